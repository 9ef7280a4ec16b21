//! flowctl-network: the switch-facing side of the controller
//!
//! This crate provides:
//! - Frame decoding for packet-in payloads and ARP reply synthesis
//! - OpenFlow-style matches, actions, flow modifications and statistics
//! - The JSON-lines control protocol spoken with switch agents
//! - `ControlChannel`, the non-blocking outbound path to one switch
//! - An in-memory flow table and simulated switch

pub mod channel;
pub mod flow_table;
pub mod of_error;
pub mod openflow;
pub mod packet;
pub mod wire;

pub use channel::{ControlChannel, MpscChannel};
pub use flow_table::{FlowEntry, FlowTable, SimulatedSwitch};
pub use of_error::{OfError, PacketError};
pub use openflow::{
    FlowAction, FlowMatch, FlowMod, FlowStatsEntry, Instruction, Ipv4Net, PacketIn, PacketOut,
    PortStats, SwitchFeatures,
};
pub use packet::ParsedPacket;
pub use wire::{ControllerMessage, SwitchMessage};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::channel::ControlChannel;
    pub use super::openflow::{FlowAction, FlowMatch, FlowMod, PacketIn, PacketOut};
    pub use super::packet::ParsedPacket;
    pub use super::wire::{ControllerMessage, SwitchMessage};
}
