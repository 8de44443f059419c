//! Control-server connectivity: throttle, connection gate, and the API
//! client built on top of them.

mod control;
mod gate;
mod limit;

pub use control::{AckStatus, ControlClient, PresignedPair, AGENT_VERSION};
pub use gate::{ConcurrencyGate, GatePermit};
pub use limit::RateLimiter;
