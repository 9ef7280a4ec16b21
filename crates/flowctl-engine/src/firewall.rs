//! Static firewall
//!
//! Drop rules are loaded once from a JSON array of match objects and installed
//! on every switch at connect time at priority 100 with a clear-actions
//! instruction. Loading never fails: a bad document gives an empty rule set,
//! a bad entry is skipped.

use flowctl_core::PortNo;
use flowctl_network::openflow::format_dpid;
use flowctl_network::{FlowMatch, FlowMod, ParsedPacket};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::registry::SwitchSession;
use crate::FIREWALL_PRIORITY;

/// Ordered drop rules, immutable once loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallRuleSet {
    rules: Vec<FlowMatch>,
}

impl FirewallRuleSet {
    pub fn new(rules: Vec<FlowMatch>) -> Self {
        Self { rules }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Load rules from `source`; no source means no rules
    pub fn load(source: Option<&Path>) -> Self {
        let Some(path) = source else {
            info!("No firewall rules configured, allowing all traffic");
            return Self::empty();
        };

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let rules = Self::from_json_str(&content);
                info!(
                    "Loaded {} firewall rules from {}",
                    rules.len(),
                    path.display()
                );
                rules
            }
            Err(e) => {
                error!(
                    "Failed to read firewall rules from {}: {}; using empty rule set",
                    path.display(),
                    e
                );
                Self::empty()
            }
        }
    }

    /// Parse a JSON array of match objects
    pub fn from_json_str(content: &str) -> Self {
        let doc: Value = match serde_json::from_str(content) {
            Ok(doc) => doc,
            Err(e) => {
                error!("Firewall rules are not valid JSON: {}; using empty rule set", e);
                return Self::empty();
            }
        };

        let Value::Array(entries) = doc else {
            error!("Firewall rules must be a JSON array; using empty rule set");
            return Self::empty();
        };

        let mut rules = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<FlowMatch>(entry) {
                // an empty match would drop every packet on the switch
                Ok(m) if m.is_wildcard() => {
                    warn!(index = i, "Skipping firewall rule with no match fields")
                }
                Ok(m) => rules.push(m),
                Err(e) => warn!(index = i, "Skipping invalid firewall rule: {}", e),
            }
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[FlowMatch] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The flow modifications installed for this rule set, in rule order
    pub fn drop_rules(&self) -> Vec<FlowMod> {
        self.rules
            .iter()
            .map(|m| FlowMod::drop(FIREWALL_PRIORITY, m.clone()))
            .collect()
    }

    /// Install every drop rule on a switch. A failed rule is logged and the
    /// rest are still installed. Returns how many were sent.
    pub fn install(&self, session: &SwitchSession) -> usize {
        let dpid = format_dpid(session.dpid);
        let mut installed = 0;
        for (i, rule) in self.drop_rules().into_iter().enumerate() {
            let desc = rule.match_fields.to_string();
            match session.channel.install_flow(rule) {
                Ok(()) => {
                    installed += 1;
                    info!(dpid = %dpid, "Firewall: installed drop rule {} match={}", i + 1, desc);
                }
                Err(e) => error!(
                    dpid = %dpid,
                    "Firewall: failed to install rule {} match={}: {}",
                    i + 1,
                    desc,
                    e
                ),
            }
        }
        installed
    }

    /// First rule covering this packet, if any
    pub fn matching_rule(&self, in_port: PortNo, pkt: &ParsedPacket) -> Option<&FlowMatch> {
        let hit = self.rules.iter().find(|m| m.matches(in_port, pkt));
        if let Some(rule) = hit {
            debug!(in_port, rule = %rule, "Packet covered by firewall rule");
        }
        hit
    }
}
