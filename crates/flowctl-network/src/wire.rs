//! JSON-lines control protocol
//!
//! Each message is one JSON object terminated by `\n`, tagged by `type`:
//! - switch -> controller: `hello`, `packet_in`, `port_stats_reply`, `flow_stats_reply`
//! - controller -> switch: `flow_mod`, `packet_out`, `port_stats_request`, `flow_stats_request`
//!
//! The first message on a connection must be `hello`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::of_error::OfError;
use crate::openflow::{
    FlowMod, FlowStatsEntry, PacketIn, PacketOut, PortStats, SwitchFeatures, OFPP_ANY, OFPTT_ALL,
};

/// Messages a switch sends to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchMessage {
    Hello(SwitchFeatures),
    PacketIn(PacketIn),
    PortStatsReply { ports: Vec<PortStats> },
    FlowStatsReply { flows: Vec<FlowStatsEntry> },
}

impl SwitchMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SwitchMessage::Hello(_) => "hello",
            SwitchMessage::PacketIn(_) => "packet_in",
            SwitchMessage::PortStatsReply { .. } => "port_stats_reply",
            SwitchMessage::FlowStatsReply { .. } => "flow_stats_reply",
        }
    }
}

/// Messages the controller sends to a switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    FlowMod(FlowMod),
    PacketOut(PacketOut),
    PortStatsRequest {
        #[serde(default = "any_port")]
        port_no: u32,
    },
    FlowStatsRequest {
        #[serde(default = "all_tables")]
        table_id: u8,
    },
}

fn any_port() -> u32 {
    OFPP_ANY
}

fn all_tables() -> u8 {
    OFPTT_ALL
}

impl ControllerMessage {
    /// Request counters for every port
    pub fn all_port_stats() -> Self {
        ControllerMessage::PortStatsRequest { port_no: OFPP_ANY }
    }

    /// Request counters for every flow in every table
    pub fn all_flow_stats() -> Self {
        ControllerMessage::FlowStatsRequest {
            table_id: OFPTT_ALL,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::FlowMod(_) => "flow_mod",
            ControllerMessage::PacketOut(_) => "packet_out",
            ControllerMessage::PortStatsRequest { .. } => "port_stats_request",
            ControllerMessage::FlowStatsRequest { .. } => "flow_stats_request",
        }
    }
}

/// Encode a message as a single line, newline included
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, OfError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (trailing whitespace ignored)
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, OfError> {
    Ok(serde_json::from_str(line.trim_end())?)
}
