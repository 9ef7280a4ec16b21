//! Control-protocol error types
//!
//! `PacketError` covers frames that cannot be decoded, `OfError` covers
//! everything that goes wrong on the switch-facing side of the controller.

use thiserror::Error;

/// Failure to decode a frame carried by a packet-in
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("{layer} header truncated: need {needed} bytes, got {got}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("Unsupported ARP hardware/protocol combination (htype={htype}, ptype={ptype:#06x})")]
    UnsupportedArp { htype: u16, ptype: u16 },

    #[error("Invalid IPv4 header: {0}")]
    InvalidIpv4(String),
}

/// Control channel and protocol errors
#[derive(Error, Debug)]
pub enum OfError {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    #[error("Control channel to switch {0:#x} is closed")]
    ChannelClosed(u64),

    #[error("Failed to accept switch connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Failed to write to switch connection: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to read from switch connection: {0}")]
    Read(#[source] std::io::Error),

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    #[error("Switch connection closed before hello")]
    NoHello,

    #[error("Expected hello as first message, got '{0}'")]
    UnexpectedFirstMessage(String),

    // ========================================================================
    // Message Errors
    // ========================================================================
    #[error("Malformed control message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("Switch rejected flow modification: {0}")]
    FlowRejected(String),
}

impl OfError {
    /// Get a helpful suggestion for resolving this error
    pub fn suggestion(&self) -> &'static str {
        match self {
            OfError::ChannelClosed(_) => "The switch disconnected; it is re-provisioned on reconnect",
            OfError::Accept(_) => "Check the listen address and file descriptor limits",
            OfError::NoHello | OfError::UnexpectedFirstMessage(_) => {
                "The switch agent must send hello {dpid} before any other message"
            }
            OfError::MalformedMessage(_) => "Check the switch agent speaks the JSON-lines protocol",
            OfError::Packet(_) => "Truncated or corrupt frame; it was discarded",
            _ => "Check controller logs for more details",
        }
    }

    /// Returns true if this error ends the switch connection
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            OfError::ChannelClosed(_)
                | OfError::Read(_)
                | OfError::Write(_)
                | OfError::NoHello
                | OfError::UnexpectedFirstMessage(_)
        )
    }
}
