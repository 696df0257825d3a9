use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Display form of a fingerprint, grouped in blocks of four.
pub fn spaced_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A relay identity is 40 hex characters.
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == 40 && fingerprint.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Random URL-safe token for confirm/unsubscribe/preferences links.
pub fn new_auth_token() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hours_since(time: DateTime<Utc>) -> i64 {
    (Utc::now() - time).num_hours()
}

pub fn to_unix(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

pub fn from_unix(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now)
}

/// A relay we keep metadata for, mirrored from the network consensus.
#[derive(Debug, Clone)]
pub struct Relay {
    pub fingerprint: String,
    pub nickname: String,
    pub welcomed: bool,
    pub last_seen: DateTime<Utc>,
    pub up: bool,
    pub exit: bool,
}

impl Relay {
    pub fn new(fingerprint: String, nickname: String) -> Self {
        Self {
            fingerprint,
            nickname,
            welcomed: false,
            last_seen: Utc::now(),
            up: true,
            exit: false,
        }
    }

    pub fn display_name(&self) -> String {
        if self.nickname.is_empty() || self.nickname == "Unnamed" {
            format!("(id: {})", spaced_fingerprint(&self.fingerprint))
        } else {
            format!("{} (id: {})", self.nickname, spaced_fingerprint(&self.fingerprint))
        }
    }
}

/// One (email, relay) pairing; owns the auth tokens used in links.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub email: String,
    pub fingerprint: String,
    pub confirmed: bool,
    pub confirm_token: String,
    pub unsubscribe_token: String,
    pub preferences_token: String,
    pub subscribed_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(email: String, fingerprint: String) -> Self {
        Self {
            email,
            fingerprint,
            confirmed: false,
            confirm_token: new_auth_token(),
            unsubscribe_token: new_auth_token(),
            preferences_token: new_auth_token(),
            subscribed_at: Utc::now(),
        }
    }
}

/// The subscription kinds a subscriber can hold per relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubKind {
    NodeDown,
    Version,
    Bandwidth,
    DnsFailure,
}

impl SubKind {
    pub fn table(&self) -> &'static str {
        match self {
            SubKind::NodeDown => "node_down_subs",
            SubKind::Version => "version_subs",
            SubKind::Bandwidth => "bandwidth_subs",
            SubKind::DnsFailure => "dns_fail_subs",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeDownSub {
    pub email: String,
    pub fingerprint: String,
    pub triggered: bool,
    pub grace_hours: i64,
    pub last_changed: DateTime<Utc>,
    pub notified: bool,
}

impl NodeDownSub {
    /// The relay has been down long enough that the subscriber asked to hear
    /// about it.
    pub fn grace_elapsed(&self) -> bool {
        self.triggered && hours_since(self.last_changed) >= self.grace_hours
    }
}

#[derive(Debug, Clone)]
pub struct VersionSub {
    pub email: String,
    pub fingerprint: String,
    pub notify_type: String,
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub struct BandwidthSub {
    pub email: String,
    pub fingerprint: String,
    pub threshold_kbps: i64,
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub struct DnsFailSub {
    pub email: String,
    pub fingerprint: String,
    pub triggered: bool,
    pub grace_hours: i64,
    pub last_changed: DateTime<Utc>,
    pub notified: bool,
}

impl DnsFailSub {
    pub fn grace_elapsed(&self) -> bool {
        self.triggered && hours_since(self.last_changed) >= self.grace_hours
    }
}

/// What the DNS-probe coordinator consumes: one row per candidate exit.
#[derive(Debug, Clone)]
pub struct DnsFailTarget {
    pub fingerprint: String,
    pub exit: bool,
    pub email: String,
}

pub fn deployment_grace_passed(deployed: DateTime<Utc>, days: i64) -> bool {
    Utc::now() - deployed >= Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaced_fingerprint_groups_of_four() {
        assert_eq!(
            spaced_fingerprint("9695DFC35FFEB861329B9F1AB04C46397020CE31"),
            "9695 DFC3 5FFE B861 329B 9F1A B04C 4639 7020 CE31"
        );
    }

    #[test]
    fn fingerprint_validation() {
        assert!(is_valid_fingerprint("9695DFC35FFEB861329B9F1AB04C46397020CE31"));
        assert!(!is_valid_fingerprint("9695DFC35FFEB861329B9F1AB04C46397020CE3"));
        assert!(!is_valid_fingerprint("9695DFC35FFEB861329B9F1AB04C46397020CEZZ"));
        assert!(!is_valid_fingerprint(""));
    }

    #[test]
    fn auth_tokens_are_unique() {
        assert_ne!(new_auth_token(), new_auth_token());
    }

    #[test]
    fn node_down_grace() {
        let mut sub = NodeDownSub {
            email: "op@example.com".into(),
            fingerprint: "A".repeat(40),
            triggered: true,
            grace_hours: 2,
            last_changed: Utc::now() - Duration::hours(3),
            notified: false,
        };
        assert!(sub.grace_elapsed());

        sub.triggered = false;
        assert!(!sub.grace_elapsed());

        sub.triggered = true;
        sub.last_changed = Utc::now();
        assert!(!sub.grace_elapsed());
    }

    #[test]
    fn display_name_falls_back_to_fingerprint() {
        let relay = Relay::new("A".repeat(40), "Unnamed".into());
        assert!(relay.display_name().starts_with("(id: AAAA"));

        let named = Relay::new("A".repeat(40), "moria1".into());
        assert!(named.display_name().starts_with("moria1 (id:"));
    }
}
