//! sbdlink core library: relays between Iridium SBD (RockBLOCK) and Signal (signal-cli),
//! with a file-backed whitelist of Signal numbers allowed to use the bridge.

pub mod address;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod exec;
pub mod gateway;
pub mod init;
pub mod whitelist;
