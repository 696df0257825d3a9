//! Periodic relay health checks: consensus sync, node-down, obsolete
//! version, low bandwidth, and the DNS-probe round.

pub mod runner;
pub mod version;

pub use self::runner::CheckRunner;
