use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use url::Url;

use store::SubscriptionStore;
use store::models::{Relay, SubKind, deployment_grace_passed, hours_since};

use super::version::{VersionStatus, version_status};
use crate::config::Config;
use crate::control::directory::{self, Directory};
use crate::control::events::ControlEvent;
use crate::control::ControlHandle;
use crate::notify::{Notice, NoticeKind, Notifier, render};
use crate::probe::round::{ProbeRound, RoundConfig};
use crate::probe::{self, DomainTable};

/// Relays unseen for this long are forgotten entirely.
const RETENTION_HOURS: i64 = 24 * 365;

/// A rendered-notice-to-be plus the bookkeeping to run once it is sent.
struct PendingNotice {
    notice: Notice,
    /// Subscription to flag as notified after successful delivery.
    mark: Option<(SubKind, String, String)>,
}

/// Drives one full check cycle: consensus sync, the four subscription
/// checks, then notice delivery.
pub struct CheckRunner {
    store: Arc<dyn SubscriptionStore>,
    ctl: ControlHandle,
    events: mpsc::Receiver<ControlEvent>,
    notifier: Box<dyn Notifier>,
    config: Config,
    base_url: Url,
    socks_addr: SocketAddr,
    directory: Option<Arc<Directory>>,
    domains: DomainTable,
}

impl CheckRunner {
    pub async fn new(
        store: Arc<dyn SubscriptionStore>,
        ctl: ControlHandle,
        events: mpsc::Receiver<ControlEvent>,
        notifier: Box<dyn Notifier>,
        config: Config,
    ) -> Result<Self> {
        let base_url =
            Url::parse(&config.notify.base_url).context("parsing notify.base_url")?;
        let socks_addr = resolve_host_port(&config.probe.socks_host, config.probe.socks_port)
            .context("resolving the SOCKS proxy address")?;

        // The honest baseline must come from a trusted, non-anonymized
        // path, which is why it happens here and never inside a probe.
        let domains = probe::resolve_reference_domains(&config.probe.reference_domains).await?;

        Ok(Self {
            store,
            ctl,
            events,
            notifier,
            config,
            base_url,
            socks_addr,
            directory: None,
            domains,
        })
    }

    pub async fn run_cycle(&mut self) -> Result<()> {
        let directory = self.refresh_directory().await?;

        let mut notices = Vec::new();
        notices.extend(self.sync_relays(&directory).await?);
        notices.extend(self.check_node_down().await?);
        notices.extend(self.check_version(&directory).await?);
        notices.extend(self.check_bandwidth(&directory).await?);
        notices.extend(self.check_dns_failures(&directory).await?);

        tracing::info!("check cycle produced {} notices", notices.len());
        self.deliver(notices).await;
        Ok(())
    }

    async fn refresh_directory(&mut self) -> Result<Arc<Directory>> {
        let stale = self
            .directory
            .as_ref()
            .is_none_or(|directory| directory.is_stale(self.config.updater.directory_max_age_hours));

        if stale {
            tracing::info!("fetching network consensus");
            let directory = Directory::fetch(&self.ctl).await?;
            tracing::info!("consensus lists {} relays", directory.len());
            self.directory = Some(Arc::new(directory));
        }

        self.directory.clone().context("no consensus available")
    }

    /// Mirror the consensus into the relay table and welcome newly stable
    /// relays whose operators published a contact address.
    async fn sync_relays(&self, directory: &Directory) -> Result<Vec<PendingNotice>> {
        let deployed = match self.store.deployed_at().await? {
            Some(deployed) => deployed,
            None => {
                let now = Utc::now();
                self.store.set_deployed_at(now).await?;
                now
            }
        };
        // A fresh deployment would otherwise "welcome" the whole network.
        let fully_deployed =
            deployment_grace_passed(deployed, self.config.updater.welcome_after_days);

        for relay in self.store.all_relays().await? {
            if hours_since(relay.last_seen) > RETENTION_HOURS {
                self.store.delete_relay(&relay.fingerprint).await?;
            } else if relay.up && directory.relay(&relay.fingerprint).is_none() {
                let mut down = relay.clone();
                down.up = false;
                self.store.save_relay(&down).await?;
            }
        }

        let mut notices = Vec::new();
        for status in directory.relays() {
            let mut relay = match self.store.relay(&status.fingerprint).await? {
                Some(existing) => existing,
                None => {
                    let mut relay =
                        Relay::new(status.fingerprint.clone(), status.nickname.clone());
                    relay.welcomed = !fully_deployed;
                    relay
                }
            };
            relay.nickname = status.nickname.clone();
            relay.last_seen = Utc::now();
            relay.up = status.running;
            relay.exit = status.exit;

            if !relay.welcomed && status.stable {
                if let Some(contact) = self.relay_contact(&status.fingerprint).await {
                    notices.push(PendingNotice {
                        notice: Notice {
                            recipient: contact,
                            fingerprint: status.fingerprint.clone(),
                            nickname: status.nickname.clone(),
                            kind: NoticeKind::Welcome { exit: status.exit },
                            unsubscribe_token: None,
                            preferences_token: None,
                        },
                        mark: None,
                    });
                }
                relay.welcomed = true;
            }

            self.store.save_relay(&relay).await?;
        }

        Ok(notices)
    }

    async fn relay_contact(&self, fingerprint: &str) -> Option<String> {
        match self.ctl.get_server_descriptor(fingerprint).await {
            Ok(descriptor) => directory::contact_address(&descriptor),
            Err(err) => {
                tracing::debug!("no descriptor for {fingerprint}: {err}");
                None
            }
        }
    }

    async fn check_node_down(&self) -> Result<Vec<PendingNotice>> {
        tracing::debug!("checking node down subscriptions");
        let mut notices = Vec::new();

        for sub in self.store.node_down_subs().await? {
            let Some(relay) = self.store.relay(&sub.fingerprint).await? else { continue };

            if relay.up {
                if sub.triggered {
                    self.store
                        .update_node_down_state(&sub.email, &sub.fingerprint, false, Utc::now(), false)
                        .await?;
                }
            } else if !sub.triggered {
                self.store
                    .update_node_down_state(
                        &sub.email,
                        &sub.fingerprint,
                        true,
                        Utc::now(),
                        sub.notified,
                    )
                    .await?;
            } else if sub.grace_elapsed() && !sub.notified {
                notices.push(
                    self.notice_for(
                        &sub.email,
                        &sub.fingerprint,
                        relay.nickname.clone(),
                        NoticeKind::NodeDown { hours: sub.grace_hours },
                        SubKind::NodeDown,
                    )
                    .await?,
                );
            }
        }

        Ok(notices)
    }

    async fn check_version(&self, directory: &Directory) -> Result<Vec<PendingNotice>> {
        tracing::debug!("checking version subscriptions");
        let recommended = match directory::recommended_versions(&self.ctl).await {
            Ok(recommended) => recommended,
            Err(err) => {
                tracing::warn!("recommended-version list unavailable: {err}");
                return Ok(Vec::new());
            }
        };

        let mut notices = Vec::new();
        for sub in self.store.version_subs().await? {
            let status = directory.relay(&sub.fingerprint);
            let version = status.and_then(|relay| relay.version.as_deref());

            match version_status(version, &recommended) {
                VersionStatus::Obsolete => {
                    if !sub.notified {
                        let nickname = self.nickname_for(directory, &sub.fingerprint).await;
                        notices.push(
                            self.notice_for(
                                &sub.email,
                                &sub.fingerprint,
                                nickname,
                                NoticeKind::ObsoleteVersion {
                                    version: version.unwrap_or("unknown").to_string(),
                                },
                                SubKind::Version,
                            )
                            .await?,
                        );
                    }
                }
                VersionStatus::Recommended => {
                    if sub.notified {
                        self.store
                            .set_notified(SubKind::Version, &sub.email, &sub.fingerprint, false)
                            .await?;
                    }
                }
                VersionStatus::Unknown => {
                    tracing::info!(
                        "couldn't determine the version relay {} is running",
                        sub.fingerprint
                    );
                }
            }
        }

        Ok(notices)
    }

    async fn check_bandwidth(&self, directory: &Directory) -> Result<Vec<PendingNotice>> {
        tracing::debug!("checking bandwidth subscriptions");
        let mut notices = Vec::new();

        for sub in self.store.bandwidth_subs().await? {
            let Some(status) = directory.relay(&sub.fingerprint) else { continue };
            let Some(bandwidth) = status.bandwidth_kbps else { continue };

            if bandwidth < sub.threshold_kbps {
                if !sub.notified {
                    let nickname = self.nickname_for(directory, &sub.fingerprint).await;
                    notices.push(
                        self.notice_for(
                            &sub.email,
                            &sub.fingerprint,
                            nickname,
                            NoticeKind::LowBandwidth {
                                observed_kbps: bandwidth,
                                threshold_kbps: sub.threshold_kbps,
                            },
                            SubKind::Bandwidth,
                        )
                        .await?,
                    );
                }
            } else if sub.notified {
                self.store
                    .set_notified(SubKind::Bandwidth, &sub.email, &sub.fingerprint, false)
                    .await?;
            }
        }

        Ok(notices)
    }

    /// The DNS check: one probe round over every subscribed exit, then
    /// trigger/grace bookkeeping per subscription.
    async fn check_dns_failures(&mut self, directory: &Directory) -> Result<Vec<PendingNotice>> {
        tracing::debug!("checking dns failure subscriptions");

        let targets = self.store.dns_fail_targets().await?;
        let mut fingerprints = Vec::new();
        let mut seen = HashSet::new();
        for target in targets.into_iter().filter(|target| target.exit) {
            if seen.insert(target.fingerprint.clone()) {
                fingerprints.push(target.fingerprint);
            }
        }
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        fingerprints.shuffle(&mut rand::thread_rng());

        let first_hops = directory.first_hop_candidates();
        let round_config = RoundConfig {
            socks_addr: self.socks_addr,
            probe_timeout: self.config.probe_timeout(),
            round_timeout: self.config.round_timeout(),
            pacing: self.config.pacing(),
        };
        let round = ProbeRound { ctl: &self.ctl, config: &round_config, domains: &self.domains };
        let outcome = round.run(&fingerprints, &first_hops, &mut self.events).await?;

        let probed: HashSet<String> = fingerprints.iter().cloned().collect();
        let failing: HashSet<String> = outcome.failing_fingerprints().into_iter().collect();

        let mut notices = Vec::new();
        for sub in self.store.dns_fail_subs().await? {
            if !probed.contains(&sub.fingerprint) {
                continue;
            }

            if failing.contains(&sub.fingerprint) {
                if !sub.triggered {
                    self.store
                        .update_dns_fail_state(
                            &sub.email,
                            &sub.fingerprint,
                            true,
                            Utc::now(),
                            sub.notified,
                        )
                        .await?;
                } else if sub.grace_elapsed() && !sub.notified {
                    let nickname = self.nickname_for(directory, &sub.fingerprint).await;
                    notices.push(
                        self.notice_for(
                            &sub.email,
                            &sub.fingerprint,
                            nickname,
                            NoticeKind::DnsFailure,
                            SubKind::DnsFailure,
                        )
                        .await?,
                    );
                }
            } else if sub.triggered || sub.notified {
                self.store
                    .update_dns_fail_state(&sub.email, &sub.fingerprint, false, Utc::now(), false)
                    .await?;
            }
        }

        Ok(notices)
    }

    async fn nickname_for(&self, directory: &Directory, fingerprint: &str) -> String {
        if let Ok(Some(relay)) = self.store.relay(fingerprint).await {
            return relay.nickname;
        }
        directory
            .relay(fingerprint)
            .map(|status| status.nickname.clone())
            .unwrap_or_else(|| "Unnamed".to_string())
    }

    async fn notice_for(
        &self,
        email: &str,
        fingerprint: &str,
        nickname: String,
        kind: NoticeKind,
        mark_kind: SubKind,
    ) -> Result<PendingNotice> {
        let subscriber = self.store.subscriber(email, fingerprint).await?;
        let (unsubscribe_token, preferences_token) = match subscriber {
            Some(subscriber) => {
                (Some(subscriber.unsubscribe_token), Some(subscriber.preferences_token))
            }
            None => (None, None),
        };

        Ok(PendingNotice {
            notice: Notice {
                recipient: email.to_string(),
                fingerprint: fingerprint.to_string(),
                nickname,
                kind,
                unsubscribe_token,
                preferences_token,
            },
            mark: Some((mark_kind, email.to_string(), fingerprint.to_string())),
        })
    }

    /// Send everything; a failed delivery keeps its subscription unflagged
    /// so the next cycle retries it.
    async fn deliver(&self, pending: Vec<PendingNotice>) {
        for item in pending {
            let message = render(&item.notice, &self.config.notify.sender, &self.base_url);
            match self.notifier.send(&message).await {
                Ok(()) => {
                    if let Some((kind, email, fingerprint)) = item.mark {
                        if let Err(err) =
                            self.store.set_notified(kind, &email, &fingerprint, true).await
                        {
                            tracing::warn!(
                                "notice sent but couldn't flag {kind:?} for {email}: {err:#}"
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to deliver notice to {}: {err:#}", message.to);
                }
            }
        }
    }
}

pub fn resolve_host_port(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("{host}:{port} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_host_port_handles_literal_addresses() {
        let addr = resolve_host_port("127.0.0.1", 9052).unwrap();
        assert_eq!(addr, "127.0.0.1:9052".parse().unwrap());
    }

    #[test]
    fn resolve_host_port_rejects_nonsense() {
        assert!(resolve_host_port("no.such.host.invalid", 1).is_err());
    }
}
