//! Manufacturing-key HMAC
//!
//! Devices that do not yet hold a per-device secret authenticate bootstrap
//! and secret-retrieval calls with `HMAC_SHA256(master_key,
//! "{device_id}:{timestamp}")`, hex-encoded, where the timestamp is RFC3339
//! and must fall within a configured skew bound.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifier for manufacturing-signed device requests.
pub struct ManufacturingAuth {
    key: Vec<u8>,
    max_skew: Duration,
}

impl ManufacturingAuth {
    pub fn new(master_key: &str, max_skew_secs: i64) -> Self {
        Self {
            key: master_key.as_bytes().to_vec(),
            max_skew: Duration::seconds(max_skew_secs),
        }
    }

    /// Constant-time check of the hex signature over `"{device_id}:{timestamp}"`.
    pub fn verify_signature(&self, device_id: &str, timestamp: &str, signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(device_id.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    /// Accept RFC3339 timestamps within `max_skew` of now, in either direction.
    pub fn verify_timestamp(&self, timestamp: &str) -> bool {
        let Ok(ts) = DateTime::parse_from_rfc3339(timestamp) else {
            return false;
        };
        let ts = ts.with_timezone(&Utc);
        let now = Utc::now();
        ts <= now + self.max_skew && now - ts <= self.max_skew
    }
}

/// Compute the hex signature. Used by provisioning tooling and tests.
pub fn sign(master_key: &str, device_id: &str, timestamp: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(master_key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{device_id}:{timestamp}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_ID: &str = "11111111-1111-1111-1111-111111111111";

    fn auth() -> ManufacturingAuth {
        ManufacturingAuth::new("test-master-key", 300)
    }

    #[test]
    fn accepts_valid_signature() {
        let ts = Utc::now().to_rfc3339();
        let sig = sign("test-master-key", DEVICE_ID, &ts);
        assert!(auth().verify_signature(DEVICE_ID, &ts, &sig));
    }

    #[test]
    fn rejects_single_bit_flip() {
        let ts = Utc::now().to_rfc3339();
        let sig = sign("test-master-key", DEVICE_ID, &ts);
        let mut bytes = hex::decode(&sig).unwrap();
        bytes[0] ^= 0x01;
        assert!(!auth().verify_signature(DEVICE_ID, &ts, &hex::encode(bytes)));
    }

    #[test]
    fn rejects_random_hex_and_garbage() {
        let ts = Utc::now().to_rfc3339();
        assert!(!auth().verify_signature(DEVICE_ID, &ts, &"0".repeat(64)));
        assert!(!auth().verify_signature(DEVICE_ID, &ts, "not-hex-at-all"));
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let ts = Utc::now().to_rfc3339();
        let sig = sign("other-key", DEVICE_ID, &ts);
        assert!(!auth().verify_signature(DEVICE_ID, &ts, &sig));
    }

    #[test]
    fn timestamp_within_skew_is_accepted() {
        let auth = auth();
        let inside_past = (Utc::now() - Duration::seconds(299)).to_rfc3339();
        let inside_future = (Utc::now() + Duration::seconds(299)).to_rfc3339();
        assert!(auth.verify_timestamp(&Utc::now().to_rfc3339()));
        assert!(auth.verify_timestamp(&inside_past));
        assert!(auth.verify_timestamp(&inside_future));
    }

    #[test]
    fn timestamp_outside_skew_is_rejected() {
        let auth = auth();
        let too_old = (Utc::now() - Duration::seconds(301)).to_rfc3339();
        let too_new = (Utc::now() + Duration::seconds(301)).to_rfc3339();
        assert!(!auth.verify_timestamp(&too_old));
        assert!(!auth.verify_timestamp(&too_new));
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        assert!(!auth().verify_timestamp("yesterday at noon"));
    }
}
