//! Certificate payloads reported by HTTP probes.
//!
//! A failed fetch is reported as `CERT_ERROR_PREFIX` followed by the error.
//! A successful fetch is `fingerprint|expiry`, with the expiry formatted as
//! `2006-01-02 15:04:05 -0700 MST`.

use chrono::{DateTime, Utc};

pub const CERT_ERROR_PREFIX: &str = "SSL certificate error: ";

const TRANSIENT_SUFFIXES: [&str; 3] = ["timeout", "EOF", "timed out"];

/// Display format for expiry times in messages and mute labels.
pub const EXPIRY_DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub enum CertPayload<'a> {
    /// Certificate fetch failed. Network hiccups are flagged transient.
    FetchFailed { message: &'a str, transient: bool },
    Cert(CertInfo<'a>),
    /// Anything else, e.g. plain probe output.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo<'a> {
    pub fingerprint: &'a str,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CertInfo<'_> {
    /// A rotation needs both the fingerprint and the expiry to move.
    pub fn rotated_from(&self, old: &CertInfo<'_>) -> bool {
        self.fingerprint != old.fingerprint && self.expires_at != old.expires_at
    }
}

pub fn classify(payload: &str) -> CertPayload<'_> {
    if payload.starts_with(CERT_ERROR_PREFIX) {
        let transient = TRANSIENT_SUFFIXES.iter().any(|s| payload.ends_with(s));
        return CertPayload::FetchFailed {
            message: payload,
            transient,
        };
    }

    parse_cert(payload).map_or(CertPayload::Other, CertPayload::Cert)
}

pub fn parse_cert(payload: &str) -> Option<CertInfo<'_>> {
    let (fingerprint, expiry) = payload.split_once('|')?;
    Some(CertInfo {
        fingerprint,
        expires_at: parse_expiry(expiry),
    })
}

/// Parse `2006-01-02 15:04:05 -0700 MST`. The zone name is ignored; the offset is authoritative.
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let fields: Vec<&str> = raw.split_whitespace().take(3).collect();
    if fields.len() < 3 {
        return None;
    }
    DateTime::parse_from_str(&fields.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
