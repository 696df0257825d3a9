use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;

use crate::models::{
    BandwidthSub, DnsFailSub, DnsFailTarget, NodeDownSub, Relay, SubKind, Subscriber, VersionSub,
    from_unix, to_unix,
};
use crate::pool::{LibsqlManager, LibsqlPool};

/// Storage operations used by the weather service and the subscription API.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Relays
    async fn relay(&self, fingerprint: &str) -> Result<Option<Relay>>;
    async fn all_relays(&self) -> Result<Vec<Relay>>;
    async fn save_relay(&self, relay: &Relay) -> Result<()>;
    async fn delete_relay(&self, fingerprint: &str) -> Result<()>;

    // Subscribers
    async fn subscriber(&self, email: &str, fingerprint: &str) -> Result<Option<Subscriber>>;
    async fn ensure_subscriber(&self, email: &str, fingerprint: &str) -> Result<Subscriber>;
    async fn confirm_subscriber(&self, confirm_token: &str) -> Result<bool>;

    // Subscriptions
    async fn set_node_down_sub(&self, email: &str, fingerprint: &str, grace_hours: i64)
    -> Result<()>;
    async fn set_version_sub(&self, email: &str, fingerprint: &str, notify_type: &str)
    -> Result<()>;
    async fn set_bandwidth_sub(
        &self,
        email: &str,
        fingerprint: &str,
        threshold_kbps: i64,
    ) -> Result<()>;
    async fn set_dns_fail_sub(&self, email: &str, fingerprint: &str, grace_hours: i64)
    -> Result<()>;
    /// Remove one subscription kind. Returns whether a row existed.
    async fn remove_sub(&self, email: &str, fingerprint: &str, kind: SubKind) -> Result<bool>;

    /// Confirmed subscriptions per kind.
    async fn node_down_subs(&self) -> Result<Vec<NodeDownSub>>;
    async fn version_subs(&self) -> Result<Vec<VersionSub>>;
    async fn bandwidth_subs(&self) -> Result<Vec<BandwidthSub>>;
    async fn dns_fail_subs(&self) -> Result<Vec<DnsFailSub>>;

    /// (fingerprint, exit-flag, subscriber-email) tuples for every relay with
    /// an active, confirmed DNS-failure subscription.
    async fn dns_fail_targets(&self) -> Result<Vec<DnsFailTarget>>;

    async fn update_node_down_state(
        &self,
        email: &str,
        fingerprint: &str,
        triggered: bool,
        last_changed: DateTime<Utc>,
        notified: bool,
    ) -> Result<()>;
    async fn update_dns_fail_state(
        &self,
        email: &str,
        fingerprint: &str,
        triggered: bool,
        last_changed: DateTime<Utc>,
        notified: bool,
    ) -> Result<()>;
    async fn set_notified(
        &self,
        kind: SubKind,
        email: &str,
        fingerprint: &str,
        notified: bool,
    ) -> Result<()>;

    // Meta
    async fn deployed_at(&self) -> Result<Option<DateTime<Utc>>>;
    async fn set_deployed_at(&self, deployed: DateTime<Utc>) -> Result<()>;
}

/// LibSQL-backed store.
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

fn relay_from_row(row: &libsql::Row) -> Result<Relay> {
    Ok(Relay {
        fingerprint: row.get(0)?,
        nickname: row.get(1)?,
        welcomed: row.get::<i64>(2)? != 0,
        last_seen: from_unix(row.get(3)?),
        up: row.get::<i64>(4)? != 0,
        exit: row.get::<i64>(5)? != 0,
    })
}

fn subscriber_from_row(row: &libsql::Row) -> Result<Subscriber> {
    Ok(Subscriber {
        email: row.get(0)?,
        fingerprint: row.get(1)?,
        confirmed: row.get::<i64>(2)? != 0,
        confirm_token: row.get(3)?,
        unsubscribe_token: row.get(4)?,
        preferences_token: row.get(5)?,
        subscribed_at: from_unix(row.get(6)?),
    })
}

#[async_trait]
impl SubscriptionStore for LibsqlStore {
    async fn relay(&self, fingerprint: &str) -> Result<Option<Relay>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT fingerprint, nickname, welcomed, last_seen, up, exit
                 FROM relays WHERE fingerprint = ?",
                params![fingerprint],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(relay_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn all_relays(&self) -> Result<Vec<Relay>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT fingerprint, nickname, welcomed, last_seen, up, exit FROM relays",
                (),
            )
            .await?;

        let mut relays = Vec::new();
        while let Some(row) = rows.next().await? {
            relays.push(relay_from_row(&row)?);
        }
        Ok(relays)
    }

    async fn save_relay(&self, relay: &Relay) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO relays (fingerprint, nickname, welcomed, last_seen, up, exit)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(fingerprint) DO UPDATE SET
                nickname = excluded.nickname,
                welcomed = excluded.welcomed,
                last_seen = excluded.last_seen,
                up = excluded.up,
                exit = excluded.exit",
            params![
                relay.fingerprint.clone(),
                relay.nickname.clone(),
                relay.welcomed as i64,
                to_unix(relay.last_seen),
                relay.up as i64,
                relay.exit as i64
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_relay(&self, fingerprint: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM relays WHERE fingerprint = ?", params![fingerprint]).await?;
        Ok(())
    }

    async fn subscriber(&self, email: &str, fingerprint: &str) -> Result<Option<Subscriber>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT email, fingerprint, confirmed, confirm_token, unsubscribe_token,
                        preferences_token, subscribed_at
                 FROM subscribers WHERE email = ? AND fingerprint = ?",
                params![email, fingerprint],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(subscriber_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn ensure_subscriber(&self, email: &str, fingerprint: &str) -> Result<Subscriber> {
        if let Some(existing) = self.subscriber(email, fingerprint).await? {
            return Ok(existing);
        }

        let subscriber = Subscriber::new(email.to_string(), fingerprint.to_string());
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO subscribers (email, fingerprint, confirmed, confirm_token,
                                      unsubscribe_token, preferences_token, subscribed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                subscriber.email.clone(),
                subscriber.fingerprint.clone(),
                subscriber.confirmed as i64,
                subscriber.confirm_token.clone(),
                subscriber.unsubscribe_token.clone(),
                subscriber.preferences_token.clone(),
                to_unix(subscriber.subscribed_at)
            ],
        )
        .await?;
        Ok(subscriber)
    }

    async fn confirm_subscriber(&self, confirm_token: &str) -> Result<bool> {
        let conn = self.get_conn().await?;
        let affected = conn
            .execute(
                "UPDATE subscribers SET confirmed = 1 WHERE confirm_token = ?",
                params![confirm_token],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn set_node_down_sub(
        &self,
        email: &str,
        fingerprint: &str,
        grace_hours: i64,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO node_down_subs (email, fingerprint, triggered, grace_hours,
                                         last_changed, notified)
             VALUES (?, ?, 0, ?, ?, 0)
             ON CONFLICT(email, fingerprint) DO UPDATE SET grace_hours = excluded.grace_hours",
            params![email, fingerprint, grace_hours, to_unix(Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn set_version_sub(
        &self,
        email: &str,
        fingerprint: &str,
        notify_type: &str,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO version_subs (email, fingerprint, notify_type, notified)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(email, fingerprint) DO UPDATE SET notify_type = excluded.notify_type",
            params![email, fingerprint, notify_type],
        )
        .await?;
        Ok(())
    }

    async fn set_bandwidth_sub(
        &self,
        email: &str,
        fingerprint: &str,
        threshold_kbps: i64,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO bandwidth_subs (email, fingerprint, threshold_kbps, notified)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(email, fingerprint) DO UPDATE SET
                threshold_kbps = excluded.threshold_kbps",
            params![email, fingerprint, threshold_kbps],
        )
        .await?;
        Ok(())
    }

    async fn set_dns_fail_sub(
        &self,
        email: &str,
        fingerprint: &str,
        grace_hours: i64,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO dns_fail_subs (email, fingerprint, triggered, grace_hours,
                                        last_changed, notified)
             VALUES (?, ?, 0, ?, ?, 0)
             ON CONFLICT(email, fingerprint) DO UPDATE SET grace_hours = excluded.grace_hours",
            params![email, fingerprint, grace_hours, to_unix(Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn remove_sub(&self, email: &str, fingerprint: &str, kind: SubKind) -> Result<bool> {
        let conn = self.get_conn().await?;
        let sql = format!("DELETE FROM {} WHERE email = ? AND fingerprint = ?", kind.table());
        let affected = conn.execute(&sql, params![email, fingerprint]).await?;
        Ok(affected > 0)
    }

    async fn node_down_subs(&self) -> Result<Vec<NodeDownSub>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT n.email, n.fingerprint, n.triggered, n.grace_hours, n.last_changed,
                        n.notified
                 FROM node_down_subs n
                 JOIN subscribers s ON s.email = n.email AND s.fingerprint = n.fingerprint
                 WHERE s.confirmed = 1",
                (),
            )
            .await?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await? {
            subs.push(NodeDownSub {
                email: row.get(0)?,
                fingerprint: row.get(1)?,
                triggered: row.get::<i64>(2)? != 0,
                grace_hours: row.get(3)?,
                last_changed: from_unix(row.get(4)?),
                notified: row.get::<i64>(5)? != 0,
            });
        }
        Ok(subs)
    }

    async fn version_subs(&self) -> Result<Vec<VersionSub>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT v.email, v.fingerprint, v.notify_type, v.notified
                 FROM version_subs v
                 JOIN subscribers s ON s.email = v.email AND s.fingerprint = v.fingerprint
                 WHERE s.confirmed = 1",
                (),
            )
            .await?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await? {
            subs.push(VersionSub {
                email: row.get(0)?,
                fingerprint: row.get(1)?,
                notify_type: row.get(2)?,
                notified: row.get::<i64>(3)? != 0,
            });
        }
        Ok(subs)
    }

    async fn bandwidth_subs(&self) -> Result<Vec<BandwidthSub>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT b.email, b.fingerprint, b.threshold_kbps, b.notified
                 FROM bandwidth_subs b
                 JOIN subscribers s ON s.email = b.email AND s.fingerprint = b.fingerprint
                 WHERE s.confirmed = 1",
                (),
            )
            .await?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await? {
            subs.push(BandwidthSub {
                email: row.get(0)?,
                fingerprint: row.get(1)?,
                threshold_kbps: row.get(2)?,
                notified: row.get::<i64>(3)? != 0,
            });
        }
        Ok(subs)
    }

    async fn dns_fail_subs(&self) -> Result<Vec<DnsFailSub>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT d.email, d.fingerprint, d.triggered, d.grace_hours, d.last_changed,
                        d.notified
                 FROM dns_fail_subs d
                 JOIN subscribers s ON s.email = d.email AND s.fingerprint = d.fingerprint
                 WHERE s.confirmed = 1",
                (),
            )
            .await?;

        let mut subs = Vec::new();
        while let Some(row) = rows.next().await? {
            subs.push(DnsFailSub {
                email: row.get(0)?,
                fingerprint: row.get(1)?,
                triggered: row.get::<i64>(2)? != 0,
                grace_hours: row.get(3)?,
                last_changed: from_unix(row.get(4)?),
                notified: row.get::<i64>(5)? != 0,
            });
        }
        Ok(subs)
    }

    async fn dns_fail_targets(&self) -> Result<Vec<DnsFailTarget>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT d.fingerprint, COALESCE(r.exit, 0), d.email
                 FROM dns_fail_subs d
                 JOIN subscribers s ON s.email = d.email AND s.fingerprint = d.fingerprint
                 LEFT JOIN relays r ON r.fingerprint = d.fingerprint
                 WHERE s.confirmed = 1",
                (),
            )
            .await?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await? {
            targets.push(DnsFailTarget {
                fingerprint: row.get(0)?,
                exit: row.get::<i64>(1)? != 0,
                email: row.get(2)?,
            });
        }
        Ok(targets)
    }

    async fn update_node_down_state(
        &self,
        email: &str,
        fingerprint: &str,
        triggered: bool,
        last_changed: DateTime<Utc>,
        notified: bool,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE node_down_subs SET triggered = ?, last_changed = ?, notified = ?
             WHERE email = ? AND fingerprint = ?",
            params![triggered as i64, to_unix(last_changed), notified as i64, email, fingerprint],
        )
        .await?;
        Ok(())
    }

    async fn update_dns_fail_state(
        &self,
        email: &str,
        fingerprint: &str,
        triggered: bool,
        last_changed: DateTime<Utc>,
        notified: bool,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE dns_fail_subs SET triggered = ?, last_changed = ?, notified = ?
             WHERE email = ? AND fingerprint = ?",
            params![triggered as i64, to_unix(last_changed), notified as i64, email, fingerprint],
        )
        .await?;
        Ok(())
    }

    async fn set_notified(
        &self,
        kind: SubKind,
        email: &str,
        fingerprint: &str,
        notified: bool,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        let sql =
            format!("UPDATE {} SET notified = ? WHERE email = ? AND fingerprint = ?", kind.table());
        conn.execute(&sql, params![notified as i64, email, fingerprint]).await?;
        Ok(())
    }

    async fn deployed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.get_conn().await?;
        let mut rows =
            conn.query("SELECT value FROM meta WHERE key = 'deployed_at'", ()).await?;

        match rows.next().await? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(raw.parse::<i64>().ok().map(from_unix))
            }
            None => Ok(None),
        }
    }

    async fn set_deployed_at(&self, deployed: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('deployed_at', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![to_unix(deployed).to_string()],
        )
        .await?;
        Ok(())
    }
}
