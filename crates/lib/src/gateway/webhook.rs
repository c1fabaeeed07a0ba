//! POST /webhook: RockBLOCK mobile-originated deliveries.
//!
//! The gateway gives us a few seconds to answer, so the handler only decodes and addresses the
//! message, then hands authorization and the Signal send to the dispatcher.

use crate::address;
use crate::channels::signal::deliver_to_messaging;
use crate::channels::RelayMessage;
use crate::dispatch::DispatchError;
use crate::gateway::server::BridgeState;
use axum::{extract::State, http::StatusCode, Form};
use serde::Deserialize;

/// Relayed in place of a payload that is not valid hex.
pub const DECODE_FAILED_PLACEHOLDER: &str = "<decoding failed>";

/// Form fields posted by RockBLOCK. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookForm {
    pub imei: Option<String>,
    pub transmit_time: Option<String>,
    /// Hex-encoded payload.
    pub data: Option<String>,
    pub momsn: Option<String>,
    pub iridium_latitude: Option<String>,
    pub iridium_longitude: Option<String>,
    pub iridium_cep: Option<String>,
}

/// Hex (either case) to text; invalid UTF-8 is replaced, invalid hex yields the placeholder.
pub fn decode_payload(hex_data: &str) -> String {
    match hex::decode(hex_data) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            log::error!("webhook: hex decoding failed: {}", e);
            DECODE_FAILED_PLACEHOLDER.to_string()
        }
    }
}

pub(crate) async fn receive_webhook(
    State(state): State<BridgeState>,
    form: Option<Form<WebhookForm>>,
) -> (StatusCode, &'static str) {
    let form = form.map(|Form(f)| f).unwrap_or_default();
    let Some(hex_data) = form
        .data
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "No data");
    };
    log::debug!(
        "webhook: imei={:?} momsn={:?} transmit_time={:?} location=({:?}, {:?}) cep={:?}",
        form.imei,
        form.momsn,
        form.transmit_time,
        form.iridium_latitude,
        form.iridium_longitude,
        form.iridium_cep
    );

    let text = decode_payload(hex_data);
    let parsed = address::parse(&text);
    let authorize = parsed.identity.clone();
    let recipient = parsed
        .identity
        .unwrap_or_else(|| state.account.clone());
    let msg = RelayMessage::from_satellite(recipient, parsed.body, form.imei, form.transmit_time);

    let whitelist = state.whitelist.clone();
    let messenger = state.messenger.clone();
    let id = msg.id.clone();
    let job = async move {
        if let Some(identity) = authorize {
            if !whitelist.add(&identity).await {
                log::warn!("{}: could not whitelist {}", msg.id, identity);
            }
        }
        deliver_to_messaging(messenger.as_ref(), &msg).await;
    };
    match state.dispatcher.submit(job) {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(DispatchError::Full) => {
            log::warn!(
                "{}: dispatch queue full ({} running), asking the gateway to redeliver",
                id,
                state.dispatcher.in_flight()
            );
            (StatusCode::SERVICE_UNAVAILABLE, "Busy")
        }
        Err(DispatchError::Closed) => {
            log::warn!("{}: shutting down, asking the gateway to redeliver", id);
            (StatusCode::SERVICE_UNAVAILABLE, "Busy")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_either_case() {
        assert_eq!(decode_payload("68656c6c6f"), "hello");
        assert_eq!(decode_payload("68656C6C6F"), "hello");
    }

    #[test]
    fn invalid_hex_becomes_placeholder() {
        assert_eq!(decode_payload("zz"), DECODE_FAILED_PLACEHOLDER);
        assert_eq!(decode_payload("abc"), DECODE_FAILED_PLACEHOLDER);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(decode_payload("6869ff"), "hi\u{fffd}");
    }
}
