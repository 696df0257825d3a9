//! The exit-relay DNS-probe coordinator.
//!
//! One probe round builds a two-hop circuit per candidate exit, drives a
//! SOCKS5 resolve request through each circuit from an isolated worker
//! process, and decides which exits answer DNS dishonestly. Circuit and
//! stream events arrive on independent feeds with no mutual ordering; the
//! correlator absorbs either ordering through a port-keyed attach table and
//! the tracker decides completion from racy counters exactly once.

pub mod correlator;
pub mod round;
pub mod socks;
pub mod tracker;
pub mod worker;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::CircuitId;
use self::socks::SocksReply;

/// Failures local to a single probe. None of these escalate beyond a
/// `false` verdict for the circuit that hit them.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Malformed SOCKS reply.
    #[error("malformed SOCKS reply: {0}")]
    Protocol(String),
    /// The proxy reported a failure code.
    #[error("SOCKS request failed: {0}")]
    Socks(SocksReply),
    /// A blocking read exceeded its deadline.
    #[error("timed out talking to the proxy")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reference domains mapped to every address they legitimately resolve to.
pub type DomainTable = BTreeMap<String, Vec<String>>;

/// Establish the honest baseline: resolve every reference domain over the
/// operating system's own resolver, before any circuit is involved.
pub async fn resolve_reference_domains(domains: &[String]) -> anyhow::Result<DomainTable> {
    let mut table = DomainTable::new();
    for domain in domains {
        let mut addresses = Vec::new();
        match tokio::net::lookup_host((domain.as_str(), 0)).await {
            Ok(resolved) => {
                for addr in resolved {
                    if let std::net::SocketAddr::V4(v4) = addr {
                        addresses.push(v4.ip().to_string());
                    }
                }
            }
            Err(err) => {
                tracing::warn!("trusted resolution of {domain} failed: {err}");
            }
        }
        if addresses.is_empty() {
            tracing::warn!("no trusted addresses for {domain}, dropping it from this run");
            continue;
        }
        tracing::debug!("domain {domain} maps to {addresses:?}");
        table.insert(domain.clone(), addresses);
    }
    anyhow::ensure!(!table.is_empty(), "no reference domain could be resolved");
    Ok(table)
}

/// One probe's conclusion about one exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub circuit: CircuitId,
    pub fingerprint: String,
    /// `true` only when every reference domain resolved to an expected
    /// address. Timeouts, protocol errors, mismatches and silent workers
    /// all land on `false`.
    pub honest: bool,
}
