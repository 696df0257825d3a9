//! Rendering and delivery of operator notices.
//!
//! Rendering is local; delivery goes through the `Notifier` seam. The
//! shipped implementation hands the rendered message to an external relay
//! endpoint as JSON; turning that into actual mail is that service's
//! problem, not ours.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use store::models::spaced_fingerprint;

use crate::config;

const SUBJECT_HEADER: &str = "[Relay Weather]";

/// The condition a notice reports.
#[derive(Debug, Clone)]
pub enum NoticeKind {
    Welcome { exit: bool },
    NodeDown { hours: i64 },
    LowBandwidth { observed_kbps: i64, threshold_kbps: i64 },
    ObsoleteVersion { version: String },
    DnsFailure,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub recipient: String,
    pub fingerprint: String,
    pub nickname: String,
    pub kind: NoticeKind,
    /// Footer link tokens; absent for welcome notices, which go to relay
    /// operators rather than subscribers.
    pub unsubscribe_token: Option<String>,
    pub preferences_token: Option<String>,
}

/// A rendered, deliverable message.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

fn display_name(fingerprint: &str, nickname: &str) -> String {
    if nickname.is_empty() || nickname == "Unnamed" {
        format!("(id: {})", spaced_fingerprint(fingerprint))
    } else {
        format!("{} (id: {})", nickname, spaced_fingerprint(fingerprint))
    }
}

pub fn render(notice: &Notice, sender: &str, base_url: &Url) -> OutboundMessage {
    let name = display_name(&notice.fingerprint, &notice.nickname);

    let (subject, mut body) = match &notice.kind {
        NoticeKind::Welcome { exit } => {
            let mut body = format!(
                "Congratulations! The relay {name} you operate has become stable \
                 and is now helping to carry network traffic."
            );
            if *exit {
                body.push_str(
                    "\n\nYour relay allows exit traffic, so it will also be probed \
                     periodically for DNS integrity.",
                );
            }
            ("Welcome to Relay Weather!".to_string(), body)
        }
        NoticeKind::NodeDown { hours } => {
            let unit = if *hours == 1 { "hour" } else { "hours" };
            (
                "Node Down!".to_string(),
                format!(
                    "This is a Relay Weather report.\n\n\
                     It appears that the relay {name} you've been observing has been \
                     uncontactable through the network for at least {hours} {unit}. \
                     You may wish to look at it to see why."
                ),
            )
        }
        NoticeKind::LowBandwidth { observed_kbps, threshold_kbps } => (
            "Low bandwidth!".to_string(),
            format!(
                "This is a Relay Weather report.\n\n\
                 It appears that the relay {name} you've been observing has an \
                 observed bandwidth capacity of {observed_kbps} kB/s. You elected \
                 to receive notifications if this relay's bandwidth capacity passed \
                 a threshold of {threshold_kbps} kB/s. You may wish to look at your \
                 relay to see why."
            ),
        ),
        NoticeKind::ObsoleteVersion { version } => (
            "Node Out of Date!".to_string(),
            format!(
                "This is a Relay Weather report.\n\n\
                 It appears that the relay {name} you've been observing is running \
                 an obsolete version of the relay software ({version}). You can \
                 download the latest version at {}.",
                link(base_url, "download")
            ),
        ),
        NoticeKind::DnsFailure => (
            "Failed to Resolve Hostnames!".to_string(),
            format!(
                "This is a Relay Weather report.\n\n\
                 It appears that the relay {name} you've been observing has been \
                 failing to resolve hostnames; its DNS may be tampered with. \
                 You may wish to look at it and fix that."
            ),
        ),
    };

    if let (Some(unsubscribe), Some(preferences)) =
        (&notice.unsubscribe_token, &notice.preferences_token)
    {
        body.push_str(&format!(
            "\n\nYou can unsubscribe from these reports at any time by visiting \
             the following url:\n\n{}\n\nor change your Relay Weather notification \
             preferences here:\n\n{}",
            link(base_url, &format!("unsubscribe/{unsubscribe}")),
            link(base_url, &format!("preferences/{preferences}")),
        ));
    }

    OutboundMessage {
        to: notice.recipient.clone(),
        from: sender.to_string(),
        subject: format!("{SUBJECT_HEADER} {subject}"),
        body,
    }
}

fn link(base_url: &Url, path: &str) -> String {
    base_url
        .join(path)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| format!("{base_url}{path}"))
}

/// Delivery seam; implementations must not panic on transient failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()>;
}

/// POSTs each rendered message to a relay endpoint as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: Url,
}

impl WebhookNotifier {
    pub fn new(endpoint: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fallback when no endpoint is configured: the notice only hits the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        tracing::info!("notice for {}: {} ({} bytes)", message.to, message.subject, message.body.len());
        Ok(())
    }
}

pub fn notifier_from_config(config: &config::Notify) -> anyhow::Result<Box<dyn Notifier>> {
    match &config.endpoint {
        Some(endpoint) => {
            let url = Url::parse(endpoint)?;
            Ok(Box::new(WebhookNotifier::new(url)?))
        }
        None => {
            tracing::warn!("no notification endpoint configured, notices will only be logged");
            Ok(Box::new(LogNotifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_url() -> Url {
        Url::parse("https://weather.example.org/").unwrap()
    }

    fn notice(kind: NoticeKind) -> Notice {
        Notice {
            recipient: "op@example.com".into(),
            fingerprint: "9695DFC35FFEB861329B9F1AB04C46397020CE31".into(),
            nickname: "moria1".into(),
            kind,
            unsubscribe_token: Some("unsub-token".into()),
            preferences_token: Some("pref-token".into()),
        }
    }

    #[test]
    fn node_down_notice_renders_grace_and_links() {
        let message =
            render(&notice(NoticeKind::NodeDown { hours: 4 }), "ops@example.org", &base_url());

        assert_eq!(message.subject, "[Relay Weather] Node Down!");
        assert_eq!(message.to, "op@example.com");
        assert!(message.body.contains("moria1 (id: 9695 DFC3"));
        assert!(message.body.contains("at least 4 hours"));
        assert!(message.body.contains("https://weather.example.org/unsubscribe/unsub-token"));
        assert!(message.body.contains("https://weather.example.org/preferences/pref-token"));
    }

    #[test]
    fn singular_hour_is_not_pluralized() {
        let message =
            render(&notice(NoticeKind::NodeDown { hours: 1 }), "ops@example.org", &base_url());
        assert!(message.body.contains("at least 1 hour."));
    }

    #[test]
    fn dns_failure_notice_names_the_condition() {
        let message = render(&notice(NoticeKind::DnsFailure), "ops@example.org", &base_url());
        assert_eq!(message.subject, "[Relay Weather] Failed to Resolve Hostnames!");
        assert!(message.body.contains("failing to resolve hostnames"));
    }

    #[test]
    fn welcome_notice_has_no_footer_links() {
        let mut welcome = notice(NoticeKind::Welcome { exit: true });
        welcome.unsubscribe_token = None;
        welcome.preferences_token = None;

        let message = render(&welcome, "ops@example.org", &base_url());
        assert!(message.body.contains("become stable"));
        assert!(message.body.contains("exit traffic"));
        assert!(!message.body.contains("unsubscribe"));
    }

    #[test]
    fn unnamed_relays_render_fingerprint_only() {
        let mut unnamed = notice(NoticeKind::LowBandwidth { observed_kbps: 10, threshold_kbps: 20 });
        unnamed.nickname = "Unnamed".into();

        let message = render(&unnamed, "ops@example.org", &base_url());
        assert!(message.body.contains("relay (id: 9695 DFC3"));
        assert!(message.body.contains("10 kB/s"));
        assert!(message.body.contains("threshold of 20 kB/s"));
    }
}
