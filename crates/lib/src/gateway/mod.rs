//! Bridge HTTP side: the RockBLOCK webhook plus the tasks started with it.
//!
//! One port serves `POST /webhook` (satellite -> Signal). The Signal poller (Signal -> satellite)
//! and the dispatch worker run for as long as the server does.

mod server;
mod webhook;

pub use server::{router, run_gateway, serve, BridgeState, Collaborators};
pub use webhook::{decode_payload, WebhookForm, DECODE_FAILED_PLACEHOLDER};
