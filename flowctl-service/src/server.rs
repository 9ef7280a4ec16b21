//! Switch connection server
//!
//! One TCP connection per switch agent speaking JSON lines. Each connection
//! gets three tasks: the reader (this function), a dispatcher draining the
//! connection's event queue into the controller in order, and a writer
//! draining the outbound control channel onto the socket.

use flowctl_engine::{ControlEvent, Controller, SwitchSession};
use flowctl_network::openflow::format_dpid;
use flowctl_network::wire::{decode_line, encode_line};
use flowctl_network::{ControllerMessage, MpscChannel, OfError, SwitchMessage};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Accept switch connections forever
pub async fn serve(listener: TcpListener, controller: Arc<Controller>) -> Result<(), OfError> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(OfError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
        }
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer.to_string(), controller).await {
                warn!(%peer, "Switch connection ended: {} ({})", e, e.suggestion());
            }
        });
    }
}

/// Serve one switch connection until it closes
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    controller: Arc<Controller>,
) -> Result<(), OfError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    // handshake
    let first = lines
        .next_line()
        .await
        .map_err(OfError::Read)?
        .ok_or(OfError::NoHello)?;
    let features = match decode_line::<SwitchMessage>(&first)? {
        SwitchMessage::Hello(features) => features,
        other => return Err(OfError::UnexpectedFirstMessage(other.kind().to_string())),
    };

    let dpid = features.dpid;
    let (channel, outbound) = MpscChannel::new(dpid);
    let writer = tokio::spawn(write_loop(write_half, outbound, dpid));

    let session = SwitchSession::new(&features, Arc::new(channel));
    let session_id = session.session_id;
    info!(
        dpid = %format_dpid(dpid),
        %peer,
        %session_id,
        n_tables = features.n_tables,
        capabilities = features.capabilities,
        "Switch hello"
    );

    let (events, queue) = mpsc::unbounded_channel();
    let dispatcher = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.process_events(queue).await })
    };

    // connect is queued first so provisioning precedes every packet
    let _ = events.send(ControlEvent::SwitchConnected(session));

    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(OfError::Read(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match decode_line::<SwitchMessage>(&line) {
            Ok(SwitchMessage::PacketIn(packet)) => ControlEvent::PacketIn {
                dpid,
                session_id,
                packet,
            },
            Ok(SwitchMessage::PortStatsReply { ports }) => ControlEvent::PortStatsReply {
                dpid,
                session_id,
                ports,
            },
            Ok(SwitchMessage::FlowStatsReply { flows }) => ControlEvent::FlowStatsReply {
                dpid,
                session_id,
                flows,
            },
            Ok(SwitchMessage::Hello(_)) => {
                warn!(dpid = %format_dpid(dpid), "Ignoring repeated hello");
                continue;
            }
            Err(e) => {
                warn!(dpid = %format_dpid(dpid), "Skipping message: {}", e);
                continue;
            }
        };
        if events.send(event).is_err() {
            break Ok(());
        }
    };

    let _ = events.send(ControlEvent::SwitchDisconnected { dpid, session_id });
    drop(events);
    match dispatcher.await {
        Ok(processed) => debug!(dpid = %format_dpid(dpid), processed, "Dispatcher finished"),
        Err(e) => error!(dpid = %format_dpid(dpid), "Dispatcher task failed: {}", e),
    }
    writer.abort();

    info!(dpid = %format_dpid(dpid), %peer, "Switch connection closed");
    result
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<ControllerMessage>,
    dpid: u64,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let line = match encode_line(&msg) {
            Ok(line) => line,
            Err(e) => {
                error!(dpid = %format_dpid(dpid), "Failed to encode {}: {}", msg.kind(), e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(dpid = %format_dpid(dpid), "{}", OfError::Write(e));
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(dpid = %format_dpid(dpid), "{}", OfError::Write(e));
            break;
        }
    }
}
