//! Outbound control channel to a switch

use flowctl_core::Dpid;
use std::fmt;
use tokio::sync::mpsc;

use crate::of_error::OfError;
use crate::openflow::{FlowMod, PacketOut};
use crate::wire::ControllerMessage;

/// Something the controller can send messages to a switch through.
///
/// Sends never block and never wait for the switch: the message is queued
/// and the caller continues.
pub trait ControlChannel: Send + Sync + fmt::Debug {
    fn send(&self, msg: ControllerMessage) -> Result<(), OfError>;

    fn install_flow(&self, flow_mod: FlowMod) -> Result<(), OfError> {
        self.send(ControllerMessage::FlowMod(flow_mod))
    }

    fn packet_out(&self, packet_out: PacketOut) -> Result<(), OfError> {
        self.send(ControllerMessage::PacketOut(packet_out))
    }
}

/// Channel backed by an unbounded queue drained by the connection's writer task
#[derive(Debug, Clone)]
pub struct MpscChannel {
    dpid: Dpid,
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

impl MpscChannel {
    pub fn new(dpid: Dpid) -> (Self, mpsc::UnboundedReceiver<ControllerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { dpid, tx }, rx)
    }

    pub fn dpid(&self) -> Dpid {
        self.dpid
    }
}

impl ControlChannel for MpscChannel {
    fn send(&self, msg: ControllerMessage) -> Result<(), OfError> {
        self.tx
            .send(msg)
            .map_err(|_| OfError::ChannelClosed(self.dpid))
    }
}
