//! Switch session registry

use chrono::{DateTime, Utc};
use flowctl_core::Dpid;
use flowctl_network::openflow::{format_dpid, SwitchFeatures};
use flowctl_network::ControlChannel;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// One connection of one switch
#[derive(Clone)]
pub struct SwitchSession {
    pub dpid: Dpid,
    pub session_id: Uuid,
    pub channel: Arc<dyn ControlChannel>,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub n_tables: u8,
    pub capabilities: u32,
}

impl SwitchSession {
    /// Create a session for a switch that just sent its hello
    pub fn new(features: &SwitchFeatures, channel: Arc<dyn ControlChannel>) -> Self {
        Self {
            dpid: features.dpid,
            session_id: Uuid::new_v4(),
            channel,
            state: SessionState::Connected,
            connected_at: Utc::now(),
            n_tables: features.n_tables,
            capabilities: features.capabilities,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

impl fmt::Debug for SwitchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchSession")
            .field("dpid", &format_dpid(self.dpid))
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("connected_at", &self.connected_at)
            .field("n_tables", &self.n_tables)
            .finish()
    }
}

/// Live sessions keyed by datapath id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Dpid, SwitchSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the session it replaced (if the switch
    /// was already connected).
    pub async fn register(&self, session: SwitchSession) -> Option<SwitchSession> {
        let dpid = session.dpid;
        let session_id = session.session_id;
        let previous = self.sessions.write().await.insert(dpid, session);

        match &previous {
            Some(old) => info!(
                dpid = %format_dpid(dpid),
                %session_id,
                replaced = %old.session_id,
                "Switch reconnected, replacing previous session"
            ),
            None => info!(dpid = %format_dpid(dpid), %session_id, "Switch connected"),
        }

        previous.map(|mut old| {
            old.state = SessionState::Disconnected;
            old
        })
    }

    /// Remove the session of `dpid` if it is still `session_id`.
    /// A disconnect from a session that was already replaced returns `None`.
    pub async fn unregister(&self, dpid: Dpid, session_id: Uuid) -> Option<SwitchSession> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&dpid) {
            Some(current) if current.session_id == session_id => {}
            Some(current) => {
                debug!(
                    dpid = %format_dpid(dpid),
                    stale = %session_id,
                    live = %current.session_id,
                    "Ignoring disconnect of replaced session"
                );
                return None;
            }
            None => return None,
        }

        let mut removed = sessions.remove(&dpid)?;
        removed.state = SessionState::Disconnected;
        info!(dpid = %format_dpid(dpid), %session_id, "Switch disconnected");
        Some(removed)
    }

    pub async fn get(&self, dpid: Dpid) -> Option<SwitchSession> {
        self.sessions.read().await.get(&dpid).cloned()
    }

    pub async fn is_current(&self, dpid: Dpid, session_id: Uuid) -> bool {
        self.sessions
            .read()
            .await
            .get(&dpid)
            .is_some_and(|s| s.session_id == session_id)
    }

    /// Current switch set, ordered by dpid
    pub async fn snapshot(&self) -> Vec<SwitchSession> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.dpid);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
