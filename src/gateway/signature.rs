// Webhook signature scheme: header `t=<unix>,v1=<hex>[,v1=<hex>...]` where each
// v1 is hex(HMAC-SHA256(secret, "<t>." + raw body)).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::GatewayError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidSignature(format!("HMAC init error: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Builds a signature header value for `payload`, as the provider would.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let digest = match mac_for(secret, timestamp, payload) {
        Ok(mac) => hex::encode(mac.finalize().into_bytes()),
        Err(_) => String::new(),
    };
    format!("t={},v1={}", timestamp, digest)
}

/// Checks `header` against the raw `payload`.
///
/// The timestamp must be within `tolerance_secs` of `now`; any matching `v1`
/// entry is accepted. Comparison is constant time.
pub fn verify_signature(
    payload: &[u8],
    header: Option<&str>,
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), GatewayError> {
    if secret.is_empty() {
        return Err(GatewayError::InvalidSignature(
            "webhook secret not configured".into(),
        ));
    }
    let header = header
        .ok_or_else(|| GatewayError::InvalidSignature("missing signature header".into()))?;

    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| GatewayError::InvalidSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(GatewayError::InvalidSignature("no v1 signature".into()));
    }

    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(GatewayError::InvalidSignature(format!(
            "timestamp {} outside tolerance of {}s",
            timestamp, tolerance_secs
        )));
    }

    let valid = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        mac_for(secret, timestamp, payload)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });

    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidSignature("signature mismatch".into()))
    }
}
