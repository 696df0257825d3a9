use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Utc};

use super::{ControlError, ControlHandle};

/// One relay's entry in the network consensus.
#[derive(Debug, Clone, Default)]
pub struct RelayStatus {
    pub fingerprint: String,
    pub nickname: String,
    pub running: bool,
    pub stable: bool,
    pub exit: bool,
    /// Consensus bandwidth weight, kB/s.
    pub bandwidth_kbps: Option<i64>,
    /// Advertised software version, e.g. `0.4.8.12`.
    pub version: Option<String>,
}

/// Cached view of the consensus, fetched over the control channel.
pub struct Directory {
    relays: HashMap<String, RelayStatus>,
    pub fetched_at: DateTime<Utc>,
}

impl Directory {
    pub async fn fetch(ctl: &ControlHandle) -> Result<Self, ControlError> {
        let raw = ctl.get_info("ns/all").await?;
        let relays = parse_consensus(&raw)
            .into_iter()
            .map(|relay| (relay.fingerprint.clone(), relay))
            .collect();
        Ok(Self { relays, fetched_at: Utc::now() })
    }

    pub fn is_stale(&self, max_age_hours: i64) -> bool {
        (Utc::now() - self.fetched_at).num_hours() >= max_age_hours
    }

    pub fn relay(&self, fingerprint: &str) -> Option<&RelayStatus> {
        self.relays.get(fingerprint)
    }

    pub fn relays(&self) -> impl Iterator<Item = &RelayStatus> {
        self.relays.values()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Running non-exit relays, usable as arbitrary first hops.
    pub fn first_hop_candidates(&self) -> Vec<String> {
        self.relays
            .values()
            .filter(|relay| relay.running && !relay.exit)
            .map(|relay| relay.fingerprint.clone())
            .collect()
    }
}

/// Parse router-status entries out of an `ns/all` document.
///
/// Each entry starts with an `r` line carrying nickname and the base64
/// identity digest, followed by `s` (flags), `v` (version), `w` (bandwidth)
/// and `p` (port policy summary) lines in any order.
pub fn parse_consensus(raw: &str) -> Vec<RelayStatus> {
    let mut relays = Vec::new();
    let mut current: Option<RelayStatus> = None;

    for line in raw.lines() {
        let mut tokens = line.split_ascii_whitespace();
        match tokens.next() {
            Some("r") => {
                if let Some(done) = current.take() {
                    relays.push(done);
                }
                let nickname = tokens.next().unwrap_or_default().to_string();
                let Some(identity) = tokens.next() else { continue };
                let Some(fingerprint) = decode_identity(identity) else {
                    tracing::warn!("undecodable identity digest in consensus: {identity}");
                    continue;
                };
                current = Some(RelayStatus { fingerprint, nickname, ..Default::default() });
            }
            Some("s") => {
                if let Some(relay) = current.as_mut() {
                    for flag in tokens {
                        match flag {
                            "Running" => relay.running = true,
                            "Stable" => relay.stable = true,
                            "Exit" => relay.exit = true,
                            _ => {}
                        }
                    }
                }
            }
            Some("v") => {
                if let Some(relay) = current.as_mut() {
                    // "v Tor 0.4.8.12" - the last token is the version.
                    relay.version = tokens.last().map(str::to_string);
                }
            }
            Some("w") => {
                if let Some(relay) = current.as_mut() {
                    relay.bandwidth_kbps = tokens
                        .find_map(|token| token.strip_prefix("Bandwidth="))
                        .and_then(|value| value.parse().ok());
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current.take() {
        relays.push(done);
    }
    relays
}

/// The consensus encodes the 20-byte identity digest as unpadded base64;
/// fingerprints everywhere else are upper-case hex.
fn decode_identity(identity: &str) -> Option<String> {
    let bytes = STANDARD_NO_PAD.decode(identity).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    Some(hex::encode_upper(bytes))
}

/// Pull a contact address out of a server descriptor, when the operator
/// published one.
pub fn contact_address(descriptor: &str) -> Option<String> {
    let contact = descriptor
        .lines()
        .find_map(|line| line.strip_prefix("contact "))?;
    contact
        .split_ascii_whitespace()
        .find(|token| token.contains('@'))
        .map(|token| token.trim_matches(['<', '>']).to_string())
}

/// The recommended-versions list as published by the directory authorities.
pub async fn recommended_versions(ctl: &ControlHandle) -> Result<Vec<String>, ControlError> {
    let raw = ctl.get_info("status/version/recommended").await?;
    Ok(raw.split(',').map(|version| version.trim().to_string()).filter(|v| !v.is_empty()).collect())
}
