//! A message in transit between the satellite and Signal sides of the bridge.

use chrono::{DateTime, Utc};

/// Which side a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceChannel {
    Satellite,
    Messaging,
}

/// Ephemeral relay value: created by one side's decoder, consumed by the other side's dispatcher.
///
/// `identity` is the Signal number the message is correlated with: the recipient for
/// satellite-originated messages, the sender for Signal-originated ones.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub id: String,
    pub source: SourceChannel,
    pub identity: String,
    /// Modem IMEI, for satellite-originated messages.
    pub device: Option<String>,
    /// Gateway-reported transmit time, passed through opaquely.
    pub transmit_time: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl RelayMessage {
    fn new(source: SourceChannel, identity: String, body: String) -> Self {
        Self {
            id: format!("relay-{}", uuid::Uuid::new_v4()),
            source,
            identity,
            device: None,
            transmit_time: None,
            body,
            received_at: Utc::now(),
        }
    }

    /// Message that came in over the satellite webhook and is addressed to `recipient` on Signal.
    pub fn from_satellite(
        recipient: impl Into<String>,
        body: impl Into<String>,
        imei: Option<String>,
        transmit_time: Option<String>,
    ) -> Self {
        let mut msg = Self::new(SourceChannel::Satellite, recipient.into(), body.into());
        msg.device = imei;
        msg.transmit_time = transmit_time;
        msg
    }

    /// Message received from `sender` on Signal, bound for the modem.
    pub fn from_messaging(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(SourceChannel::Messaging, sender.into(), body.into())
    }
}
