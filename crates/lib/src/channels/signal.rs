//! Signal side of the bridge, driven through signal-cli.
//!
//! Outbound: satellite messages are sent with `signal-cli -u <account> send`.
//! Inbound: a poller runs `signal-cli -u <account> -o json receive` on a fixed interval, decodes
//! each JSON line into an [`IngressEnvelope`], checks the whitelist and forwards plain text
//! messages to the modem.

use crate::channels::relay::RelayMessage;
use crate::channels::rockblock::SatelliteUplink;
use crate::config::SignalConfig;
use crate::exec::{self, Allowlist, ExecError, Invocation};
use crate::whitelist::WhitelistStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Prefix identifying messages that came in over Iridium.
const SATELLITE_TAG: &str = "Iridium";

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signal-cli: {0}")]
    Exec(#[from] ExecError),
}

/// Result of one receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Raw newline-delimited JSON (may be empty when nothing was queued).
    Output(String),
    /// The bounded wait expired; nothing to process this round.
    TimedOut,
}

/// The messaging client as the bridge sees it: send one text, fetch one batch.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), SignalError>;
    async fn receive(&self) -> Result<ReceiveOutcome, SignalError>;
}

/// signal-cli subprocess client for one local account.
pub struct SignalCli {
    binary: String,
    account: String,
    allowlist: Allowlist,
    receive_timeout: Duration,
    send_timeout: Duration,
}

impl SignalCli {
    pub fn new(config: &SignalConfig, account: impl Into<String>) -> Self {
        Self {
            binary: config.binary.clone(),
            account: account.into(),
            allowlist: exec::signal_cli_allowlist(&config.binary),
            receive_timeout: Duration::from_secs(config.receive_timeout_secs),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        }
    }
}

#[async_trait]
impl MessagingClient for SignalCli {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), SignalError> {
        let global = ["-u".to_string(), self.account.clone()];
        let args = ["-m".to_string(), text.to_string(), recipient.to_string()];
        self.allowlist
            .run(
                Invocation {
                    binary: &self.binary,
                    global_args: &global,
                    subcommand: "send",
                    args: &args,
                },
                self.send_timeout,
            )
            .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<ReceiveOutcome, SignalError> {
        let global = [
            "-u".to_string(),
            self.account.clone(),
            "-o".to_string(),
            "json".to_string(),
        ];
        let res = self
            .allowlist
            .run(
                Invocation {
                    binary: &self.binary,
                    global_args: &global,
                    subcommand: "receive",
                    args: &[],
                },
                self.receive_timeout,
            )
            .await;
        match res {
            Ok(stdout) => Ok(ReceiveOutcome::Output(stdout)),
            Err(ExecError::TimedOut(_)) => Ok(ReceiveOutcome::TimedOut),
            Err(e) => Err(e.into()),
        }
    }
}

/// Text sent to Signal for a satellite-originated message: `[Iridium:<imei>] <body>`.
pub fn satellite_text(msg: &RelayMessage) -> String {
    format!(
        "[{}:{}] {}",
        SATELLITE_TAG,
        msg.device.as_deref().unwrap_or("unknown"),
        msg.body
    )
}

/// Send a satellite-originated message to its Signal recipient. Errors are logged, not returned.
pub async fn deliver_to_messaging(client: &dyn MessagingClient, msg: &RelayMessage) {
    log::info!(
        "{}: processing {:?} message from {} ({}) for {}, received {}",
        msg.id,
        msg.source,
        msg.device.as_deref().unwrap_or("unknown"),
        msg.transmit_time.as_deref().unwrap_or("-"),
        msg.identity,
        msg.received_at.to_rfc3339()
    );
    match client.send(&msg.identity, &satellite_text(msg)).await {
        Ok(()) => log::info!("{}: sent to Signal", msg.id),
        Err(e) => log::error!("{}: sending via signal-cli failed: {}", msg.id, e),
    }
}

#[derive(Debug, Deserialize)]
struct ReceiveRecord {
    #[serde(default)]
    envelope: Option<RawEnvelope>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_number: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    data_message: Option<RawDataMessage>,
    #[serde(default)]
    reaction: Option<serde_json::Value>,
    #[serde(default)]
    receipt_message: Option<serde_json::Value>,
    #[serde(default)]
    typing_message: Option<serde_json::Value>,
    #[serde(default)]
    sync_message: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attachments: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    reaction: Option<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
}

/// Non-text content carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Attachment,
    Reaction,
    Receipt,
    Typing,
    Sync,
}

/// One decoded signal-cli receive record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressEnvelope {
    pub source_identity: String,
    pub timestamp: i64,
    pub body: Option<String>,
    pub markers: Vec<Marker>,
}

impl IngressEnvelope {
    /// Decode one JSON line. `Ok(None)` for records without an envelope (e.g. account notices).
    pub fn parse(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let record: ReceiveRecord = serde_json::from_str(line)?;
        Ok(record.envelope.map(Self::from_raw))
    }

    fn from_raw(raw: RawEnvelope) -> Self {
        let mut markers = Vec::new();
        let data = raw.data_message.unwrap_or_default();
        if data.attachments.as_ref().is_some_and(|a| !a.is_empty()) || data.sticker.is_some() {
            markers.push(Marker::Attachment);
        }
        if data.reaction.is_some() || raw.reaction.is_some() {
            markers.push(Marker::Reaction);
        }
        if raw.receipt_message.is_some() {
            markers.push(Marker::Receipt);
        }
        if raw.typing_message.is_some() {
            markers.push(Marker::Typing);
        }
        if raw.sync_message.is_some() {
            markers.push(Marker::Sync);
        }
        Self {
            source_identity: raw
                .source_number
                .or(raw.source)
                .unwrap_or_else(|| "unknown".to_string()),
            timestamp: raw.timestamp.unwrap_or(0),
            body: data.message,
            markers,
        }
    }

    /// The text to relay: present only for non-empty text with no non-text markers.
    pub fn relayable_text(&self) -> Option<&str> {
        if !self.markers.is_empty() {
            return None;
        }
        self.body.as_deref().filter(|b| !b.trim().is_empty())
    }
}

/// Counters for one poll iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub records: usize,
    pub malformed: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub forwarded: usize,
    pub failed: usize,
}

/// Periodic receive loop: Signal -> whitelist -> satellite uplink.
pub struct SignalPoller {
    client: Arc<dyn MessagingClient>,
    uplink: Arc<dyn SatelliteUplink>,
    whitelist: Arc<WhitelistStore>,
    interval: Duration,
}

impl SignalPoller {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        uplink: Arc<dyn SatelliteUplink>,
        whitelist: Arc<WhitelistStore>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            uplink,
            whitelist,
            interval,
        }
    }

    /// Spawn the loop. It runs until `shutdown` flips to true (or its sender is dropped).
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        log::info!(
            "signal poller: starting receive loop (interval {:?})",
            self.interval
        );
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_count: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            poll_count += 1;
            log::debug!("[poll #{}] starting signal-cli receive", poll_count);
            // Only the receive wait is interruptible; a received batch is always processed.
            let outcome = tokio::select! {
                res = self.client.receive() => res,
                _ = shutdown.changed() => break,
            };
            self.process(poll_count, outcome).await;

            log::debug!("[poll #{}] sleeping for {:?}", poll_count, self.interval);
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        log::info!("signal poller: receive loop stopped after {} poll(s)", poll_count);
    }

    /// One receive plus processing, without the trailing sleep.
    pub async fn poll_once(&self, poll_count: u64) -> PollStats {
        let outcome = self.client.receive().await;
        self.process(poll_count, outcome).await
    }

    async fn process(
        &self,
        poll_count: u64,
        outcome: Result<ReceiveOutcome, SignalError>,
    ) -> PollStats {
        let mut stats = PollStats::default();
        let output = match outcome {
            Ok(ReceiveOutcome::Output(out)) => out,
            Ok(ReceiveOutcome::TimedOut) => {
                log::debug!("[poll #{}] signal-cli receive timeout (normal)", poll_count);
                return stats;
            }
            Err(e) => {
                log::debug!("[poll #{}] signal-cli receive failed: {}", poll_count, e);
                return stats;
            }
        };
        if output.trim().is_empty() {
            log::debug!("[poll #{}] no new messages", poll_count);
            return stats;
        }

        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            stats.records += 1;
            let envelope = match IngressEnvelope::parse(line) {
                Ok(Some(env)) => env,
                Ok(None) => {
                    stats.dropped += 1;
                    continue;
                }
                Err(e) => {
                    stats.malformed += 1;
                    let preview: String = line.chars().take(100).collect();
                    log::warn!(
                        "[poll #{}] could not parse record: {} - {}",
                        poll_count,
                        preview,
                        e
                    );
                    continue;
                }
            };
            self.handle_envelope(poll_count, envelope, &mut stats).await;
        }
        log::info!("[poll #{}] {:?}", poll_count, stats);
        stats
    }

    async fn handle_envelope(&self, poll_count: u64, env: IngressEnvelope, stats: &mut PollStats) {
        if !self.whitelist.is_allowed(&env.source_identity).await {
            log::warn!(
                "[poll #{}] {} not in whitelist - message blocked",
                poll_count,
                env.source_identity
            );
            stats.rejected += 1;
            return;
        }
        let Some(text) = env.relayable_text() else {
            log::debug!(
                "[poll #{}] nothing to forward from {} (markers: {:?})",
                poll_count,
                env.source_identity,
                env.markers
            );
            stats.dropped += 1;
            return;
        };
        let msg = RelayMessage::from_messaging(env.source_identity.clone(), text);
        log::info!(
            "[poll #{}] {}: forwarding {:?} message from {} (sent {}, received {}) to the modem",
            poll_count,
            msg.id,
            msg.source,
            msg.identity,
            env.timestamp,
            msg.received_at.to_rfc3339()
        );
        match self.uplink.send(&msg.identity, &msg.body).await {
            Ok(()) => stats.forwarded += 1,
            Err(e) => {
                log::error!("[poll #{}] {}: forwarding to rockblock failed: {}", poll_count, msg.id, e);
                stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::rockblock::RockBlockError;
    use crate::config::MissingWhitelistPolicy;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Messaging client double: returns queued receive outcomes and records sends.
    #[derive(Default)]
    struct FakeMessenger {
        pub batches: Mutex<VecDeque<Result<ReceiveOutcome, ()>>>,
        pub sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingClient for FakeMessenger {
        async fn send(&self, recipient: &str, text: &str) -> Result<(), SignalError> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.to_string()));
            Ok(())
        }

        async fn receive(&self) -> Result<ReceiveOutcome, SignalError> {
            match self.batches.lock().unwrap().pop_front() {
                Some(Ok(o)) => Ok(o),
                Some(Err(())) => Err(SignalError::Exec(ExecError::Failed {
                    status: "exit status: 1".to_string(),
                    output: "boom".to_string(),
                })),
                None => Ok(ReceiveOutcome::Output(String::new())),
            }
        }
    }

    /// Uplink double recording (identity, body) pairs.
    #[derive(Default)]
    struct FakeUplink {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SatelliteUplink for FakeUplink {
        async fn send(&self, identity: &str, body: &str) -> Result<(), RockBlockError> {
            self.sent
                .lock()
                .unwrap()
                .push((identity.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn whitelist_with(entries: &[&str]) -> Arc<WhitelistStore> {
        let dir = std::env::temp_dir().join(format!("sbdlink-signal-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("signal.allowed");
        let mut s = String::new();
        for e in entries {
            s.push_str(e);
            s.push('\n');
        }
        std::fs::write(&path, s).unwrap();
        Arc::new(WhitelistStore::new(path, MissingWhitelistPolicy::DenyAll))
    }

    fn poller(
        messenger: Arc<FakeMessenger>,
        uplink: Arc<FakeUplink>,
        whitelist: Arc<WhitelistStore>,
    ) -> SignalPoller {
        SignalPoller::new(messenger, uplink, whitelist, Duration::from_millis(10))
    }

    const TEXT_FROM_STRANGER: &str = r#"{"envelope":{"source":"+31699999999","sourceNumber":"+31699999999","timestamp":1700000000001,"dataMessage":{"timestamp":1700000000001,"message":"let me in"}},"account":"+31626146216"}"#;
    const REACTION_FROM_FRIEND: &str = r#"{"envelope":{"source":"+31612345678","sourceNumber":"+31612345678","timestamp":1700000000002,"dataMessage":{"timestamp":1700000000002,"message":null,"reaction":{"emoji":"👍","targetAuthor":"+31626146216","targetSentTimestamp":1,"isRemove":false}}},"account":"+31626146216"}"#;
    const TEXT_FROM_FRIEND: &str = r#"{"envelope":{"source":"+31612345678","sourceNumber":"+31612345678","timestamp":1700000000003,"dataMessage":{"timestamp":1700000000003,"message":"weather ok?"}},"account":"+31626146216"}"#;

    #[test]
    fn parses_text_envelope() {
        let env = IngressEnvelope::parse(TEXT_FROM_FRIEND).unwrap().unwrap();
        assert_eq!(env.source_identity, "+31612345678");
        assert_eq!(env.timestamp, 1700000000003);
        assert_eq!(env.body.as_deref(), Some("weather ok?"));
        assert!(env.markers.is_empty());
        assert_eq!(env.relayable_text(), Some("weather ok?"));
    }

    #[test]
    fn markers_block_relay() {
        let env = IngressEnvelope::parse(REACTION_FROM_FRIEND).unwrap().unwrap();
        assert_eq!(env.markers, vec![Marker::Reaction]);
        assert_eq!(env.relayable_text(), None);

        let receipt = r#"{"envelope":{"source":"+31612345678","timestamp":5,"receiptMessage":{"when":5,"isDelivery":true,"timestamps":[1]}}}"#;
        let env = IngressEnvelope::parse(receipt).unwrap().unwrap();
        assert_eq!(env.markers, vec![Marker::Receipt]);
        assert_eq!(env.body, None);

        let attachment = r#"{"envelope":{"source":"+31612345678","timestamp":6,"dataMessage":{"message":"photo","attachments":[{"contentType":"image/jpeg"}]}}}"#;
        let env = IngressEnvelope::parse(attachment).unwrap().unwrap();
        assert_eq!(env.markers, vec![Marker::Attachment]);
        assert_eq!(env.relayable_text(), None);
    }

    #[test]
    fn record_without_envelope_and_garbage() {
        assert_eq!(IngressEnvelope::parse(r#"{"account":"+31626146216"}"#).unwrap(), None);
        assert!(IngressEnvelope::parse("not json").is_err());
    }

    #[test]
    fn missing_source_falls_back_to_unknown() {
        let env = IngressEnvelope::parse(r#"{"envelope":{"dataMessage":{"message":"x"}}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(env.source_identity, "unknown");
        assert_eq!(env.timestamp, 0);
    }

    #[test]
    fn satellite_text_carries_imei_tag() {
        let msg = RelayMessage::from_satellite(
            "+31612345678",
            "all good",
            Some("300434065264590".to_string()),
            None,
        );
        assert_eq!(satellite_text(&msg), "[Iridium:300434065264590] all good");
    }

    #[tokio::test]
    async fn only_authorized_text_is_forwarded() {
        let batch = format!(
            "{}\n{}\n{}\n",
            TEXT_FROM_STRANGER, REACTION_FROM_FRIEND, TEXT_FROM_FRIEND
        );
        let messenger = Arc::new(FakeMessenger::default());
        messenger
            .batches
            .lock()
            .unwrap()
            .push_back(Ok(ReceiveOutcome::Output(batch)));
        let uplink = Arc::new(FakeUplink::default());
        let p = poller(messenger, uplink.clone(), whitelist_with(&["+31612345678"]));

        let stats = p.poll_once(1).await;
        assert_eq!(stats.records, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(
            *uplink.sent.lock().unwrap(),
            vec![("+31612345678".to_string(), "weather ok?".to_string())]
        );
    }

    #[tokio::test]
    async fn malformed_line_does_not_abort_batch() {
        let batch = format!("{{broken\n{}\n", TEXT_FROM_FRIEND);
        let messenger = Arc::new(FakeMessenger::default());
        messenger
            .batches
            .lock()
            .unwrap()
            .push_back(Ok(ReceiveOutcome::Output(batch)));
        let uplink = Arc::new(FakeUplink::default());
        let p = poller(messenger, uplink.clone(), whitelist_with(&["+31612345678"]));

        let stats = p.poll_once(1).await;
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(uplink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_and_failure_are_quiet() {
        let messenger = Arc::new(FakeMessenger::default());
        {
            let mut b = messenger.batches.lock().unwrap();
            b.push_back(Ok(ReceiveOutcome::TimedOut));
            b.push_back(Err(()));
        }
        let uplink = Arc::new(FakeUplink::default());
        let p = poller(messenger, uplink.clone(), whitelist_with(&["+31612345678"]));
        assert_eq!(p.poll_once(1).await, PollStats::default());
        assert_eq!(p.poll_once(2).await, PollStats::default());
        assert!(uplink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loop_keeps_going_after_errors_and_stops_on_shutdown() {
        let messenger = Arc::new(FakeMessenger::default());
        {
            let mut b = messenger.batches.lock().unwrap();
            b.push_back(Err(()));
            b.push_back(Ok(ReceiveOutcome::TimedOut));
            b.push_back(Ok(ReceiveOutcome::Output(format!("{}\n", TEXT_FROM_FRIEND))));
        }
        let uplink = Arc::new(FakeUplink::default());
        let p = poller(messenger, uplink.clone(), whitelist_with(&["+31612345678"]));
        let (tx, rx) = watch::channel(false);
        let handle = p.start(rx);

        for _ in 0..200 {
            if !uplink.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(uplink.sent.lock().unwrap().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller stops on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn deliver_to_messaging_targets_recipient() {
        let messenger = FakeMessenger::default();
        let msg = RelayMessage::from_satellite(
            "+31612345678",
            "test message",
            Some("300434065264590".to_string()),
            Some("25-01-01 10:00:00".to_string()),
        );
        deliver_to_messaging(&messenger, &msg).await;
        assert_eq!(
            *messenger.sent.lock().unwrap(),
            vec![(
                "+31612345678".to_string(),
                "[Iridium:300434065264590] test message".to_string()
            )]
        );
    }
}
