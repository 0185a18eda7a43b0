//! License record
//!
//! A license is immutable once issued. Timestamps are seconds since the
//! Unix epoch; a license is valid strictly before `expiry_date`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub customer_id: String,
    #[serde(default)]
    pub customer_name: String,
    /// Number of licensed users
    pub seats: u32,
    #[serde(default)]
    pub issued_at: u64,
    pub expiry_date: u64,
    #[serde(default)]
    pub is_trial: bool,
    #[serde(default)]
    pub allow_audit: bool,
    #[serde(default)]
    pub allow_identity: bool,
    #[serde(default)]
    pub allow_mdm: bool,
}

/// Seconds since the Unix epoch for `time` (0 for times before it)
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn unix_now() -> u64 {
    unix_seconds(SystemTime::now())
}

impl License {
    /// A license for `customer_id` issued now and valid for `valid_for`
    pub fn new(customer_id: impl Into<String>, seats: u32, valid_for: Duration) -> Self {
        let issued_at = unix_now();
        Self {
            customer_id: customer_id.into(),
            customer_name: String::new(),
            seats,
            issued_at,
            expiry_date: issued_at.saturating_add(valid_for.as_secs()),
            is_trial: false,
            allow_audit: false,
            allow_identity: false,
            allow_mdm: false,
        }
    }

    pub fn is_valid_at(&self, time: SystemTime) -> bool {
        unix_seconds(time) < self.expiry_date
    }

    pub fn is_currently_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn expires_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.expiry_date)
    }

    /// Time left before expiry, None once expired
    pub fn remaining_at(&self, time: SystemTime) -> Option<Duration> {
        if !self.is_valid_at(time) {
            return None;
        }
        self.expires_at().duration_since(time).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn license_expiring_at(expiry_date: u64) -> License {
        License {
            customer_id: "cust-1".to_string(),
            customer_name: "Example Corp".to_string(),
            seats: 25,
            issued_at: 1_000,
            expiry_date,
            is_trial: false,
            allow_audit: true,
            allow_identity: false,
            allow_mdm: false,
        }
    }

    #[test]
    fn test_valid_strictly_before_expiry() {
        let license = license_expiring_at(2_000);
        let at = |secs| UNIX_EPOCH + Duration::from_secs(secs);

        assert!(license.is_valid_at(at(1_999)));
        assert!(!license.is_valid_at(at(2_000)));
        assert!(!license.is_valid_at(at(5_000)));
    }

    #[test]
    fn test_remaining() {
        let license = license_expiring_at(2_000);
        let at = |secs| UNIX_EPOCH + Duration::from_secs(secs);

        assert_eq!(license.remaining_at(at(1_500)), Some(Duration::from_secs(500)));
        assert_eq!(license.remaining_at(at(2_000)), None);
        assert_eq!(license.expires_at(), at(2_000));
    }

    #[test]
    fn test_new_license_is_current() {
        let license = License::new("cust-2", 10, Duration::from_secs(3600));
        assert!(license.is_currently_valid());
        assert_eq!(license.expiry_date - license.issued_at, 3600);

        let expired = License::new("cust-3", 10, Duration::ZERO);
        assert!(!expired.is_currently_valid());
    }

    #[test]
    fn test_optional_fields_default() {
        let json = r#"{"customer_id": "c", "seats": 0, "expiry_date": 42}"#;
        let license: License = serde_json::from_str(json).unwrap();
        assert_eq!(license.seats, 0);
        assert!(!license.is_trial);
        assert!(!license.allow_mdm);
        assert_eq!(license.issued_at, 0);
    }
}
