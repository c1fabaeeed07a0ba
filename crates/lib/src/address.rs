//! Identity addressing inside satellite payloads: `+31612345678: message text`.

/// Separator between identity and body.
const DELIMITER: char = ':';

/// Shortest accepted identity is 6 characters (`+` and at least five more).
const MIN_IDENTITY_LEN: usize = 6;

/// Result of [`parse`]: the addressed identity (if any) and the text to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub identity: Option<String>,
    pub body: String,
}

/// True if `s` looks like a phone-number identity: leading `+`, longer than five characters.
pub fn is_valid_identity(s: &str) -> bool {
    s.starts_with('+') && s.chars().count() >= MIN_IDENTITY_LEN
}

/// Split `raw` on the first `:` into identity and body.
///
/// When there is no delimiter, or the left part is not a valid identity, the whole input is
/// the body and no identity is returned (the caller supplies its fallback).
pub fn parse(raw: &str) -> ParsedAddress {
    if let Some((left, right)) = raw.split_once(DELIMITER) {
        let candidate = left.trim();
        if is_valid_identity(candidate) {
            return ParsedAddress {
                identity: Some(candidate.to_string()),
                body: right.trim().to_string(),
            };
        }
    }
    ParsedAddress {
        identity: None,
        body: raw.to_string(),
    }
}
