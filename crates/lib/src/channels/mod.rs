//! The two sides of the bridge.
//!
//! `signal` talks to signal-cli (send, and the receive poller); `rockblock` submits
//! mobile-terminated messages to the satellite gateway. Both are capability traits so the
//! relay core never depends on how the collaborator is implemented.

mod relay;
pub mod rockblock;
pub mod signal;

pub use relay::{RelayMessage, SourceChannel};
pub use rockblock::{RockBlockClient, RockBlockError, SatelliteUplink};
pub use signal::{
    IngressEnvelope, Marker, MessagingClient, ReceiveOutcome, SignalCli, SignalError, SignalPoller,
};
