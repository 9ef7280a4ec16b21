//! flowctl-engine: decision logic of the controller
//!
//! # Modules
//!
//! - `registry`: connected switch sessions
//! - `learning`: per-switch MAC learning and forwarding
//! - `firewall`: static priority-100 drop rules
//! - `vip`: virtual IP load balancing, proxy ARP and the address cache
//! - `telemetry`: stats polling and rate computation
//! - `sink`: telemetry record destinations
//! - `controller`: the context owning all of the above and the event dispatch

pub mod controller;
pub mod firewall;
pub mod learning;
pub mod registry;
pub mod sink;
pub mod telemetry;
pub mod vip;

pub use controller::{ControlEvent, Controller, EventOutcome, PacketDisposition, Stage, PACKET_PIPELINE};
pub use firewall::FirewallRuleSet;
pub use learning::{ForwardDecision, Learned, MacLearning};
pub use registry::{SessionRegistry, SessionState, SwitchSession};
pub use sink::{CsvDirSink, MemorySink, TelemetrySink};
pub use telemetry::{TelemetryCollector, TelemetrySample};
pub use vip::{AddressCache, VipDecision, VipEngine, VipMapping};

// ============================================================================
// Flow priorities shared by every stage
// ============================================================================
pub const TABLE_MISS_PRIORITY: u16 = 0;
pub const LEARNED_PRIORITY: u16 = 1;
pub const VIP_PRIORITY: u16 = 10;
/// Above every dynamic rule
pub const FIREWALL_PRIORITY: u16 = 100;

/// Idle timeout of the VIP NAT rules, in seconds
pub const VIP_IDLE_TIMEOUT: u16 = 30;
