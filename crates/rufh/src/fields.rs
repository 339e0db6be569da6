//! Parsing and serialization for the structured-field upload headers.
//!
//! The wire grammar is the structured-field-values subset the protocol
//! actually uses: bare integers (`Upload-Offset`, `Upload-Length`,
//! `Upload-Draft-Interop-Version`), booleans (`Upload-Incomplete`) and a
//! byte sequence (`Upload-Token`). Items carrying parameters are rejected,
//! as is any trailing input.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

use crate::error::ProtocolError;

/// Opaque client-chosen identity of a logical upload.
///
/// Equality is byte-exact: two tokens are the same upload only when their
/// decoded octets match in content and length.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct UploadToken(Vec<u8>);

impl UploadToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Canonical structured-field form, e.g. `:aGVsbG8=:`.
    pub fn to_field(&self) -> String {
        format!(":{}:", STANDARD.encode(&self.0))
    }

    /// URL-safe form used as the resource segment in `Location` URLs.
    pub fn to_segment(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }
}

impl fmt::Debug for UploadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UploadToken").field(&self.to_segment()).finish()
    }
}

fn bare_item<'a>(raw: &'a str, name: &'static str) -> Result<&'a str, ProtocolError> {
    let raw = raw.trim_matches(|c| c == ' ' || c == '\t');
    if raw.is_empty() || raw.contains(';') {
        // Parameterized items are not valid for any of the upload fields.
        return Err(ProtocolError::Malformed(name));
    }
    Ok(raw)
}

/// Parse a non-negative structured-field integer (`Upload-Offset`,
/// `Upload-Length`).
pub fn parse_non_negative(raw: &str, name: &'static str) -> Result<u64, ProtocolError> {
    let raw = bare_item(raw, name)?;
    if raw.len() > 15 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::Malformed(name));
    }
    raw.parse::<u64>().map_err(|_| ProtocolError::Malformed(name))
}

/// Parse a structured-field integer that may be signed
/// (`Upload-Draft-Interop-Version`).
pub fn parse_integer(raw: &str, name: &'static str) -> Result<i64, ProtocolError> {
    let raw = bare_item(raw, name)?;
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || digits.len() > 15 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::Malformed(name));
    }
    raw.parse::<i64>().map_err(|_| ProtocolError::Malformed(name))
}

/// Parse a structured-field boolean (`Upload-Incomplete`). Only the two
/// canonical forms are accepted.
pub fn parse_boolean(raw: &str, name: &'static str) -> Result<bool, ProtocolError> {
    match bare_item(raw, name)? {
        "?1" => Ok(true),
        "?0" => Ok(false),
        _ => Err(ProtocolError::Malformed(name)),
    }
}

/// Parse a structured-field byte sequence (`Upload-Token`).
pub fn parse_token(raw: &str, name: &'static str) -> Result<UploadToken, ProtocolError> {
    let raw = bare_item(raw, name)?;
    let inner = raw
        .strip_prefix(':')
        .and_then(|rest| rest.strip_suffix(':'))
        .ok_or(ProtocolError::Malformed(name))?;
    let bytes = STANDARD
        .decode(inner)
        .map_err(|_| ProtocolError::Malformed(name))?;
    if bytes.is_empty() {
        return Err(ProtocolError::Malformed(name));
    }
    Ok(UploadToken(bytes))
}

/// Canonical serialization of a boolean field value.
pub fn format_boolean(value: bool) -> &'static str {
    if value { "?1" } else { "?0" }
}
