use actix_web::{HttpResponse, get, post, web};
use serde::{Deserialize, Serialize};
use serde_json::json;

use store::SubscriptionStore;
use store::models::{Relay, SubKind, is_valid_fingerprint};

use crate::AppState;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub email: String,
    pub fingerprint: String,
    #[serde(default)]
    pub node_down: bool,
    pub node_down_grace_hours: Option<i64>,
    #[serde(default)]
    pub version: bool,
    #[serde(default)]
    pub bandwidth: bool,
    pub bandwidth_threshold_kbps: Option<i64>,
    #[serde(default)]
    pub dns_failure: bool,
    pub dns_failure_grace_hours: Option<i64>,
}

impl SubscribeRequest {
    fn wants_any(&self) -> bool {
        self.node_down || self.version || self.bandwidth || self.dns_failure
    }
}

#[derive(Debug, Serialize)]
struct SubscribeResponse {
    status: &'static str,
    /// Handed back so the frontend can drive the confirmation flow; the
    /// checks only ever notify confirmed subscribers.
    confirm_token: String,
    unsubscribe_token: String,
    preferences_token: String,
}

fn validate(email: &str, fingerprint: &str) -> Result<(), AppError> {
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("must provide a valid email".into()));
    }
    if !is_valid_fingerprint(fingerprint) {
        return Err(AppError::BadRequest("must provide a 40-digit hex fingerprint".into()));
    }
    Ok(())
}

async fn apply_kinds(
    state: &AppState,
    request: &SubscribeRequest,
    remove_unrequested: bool,
) -> Result<(), AppError> {
    let email = &request.email;
    let fingerprint = &request.fingerprint;
    let store = &state.store;

    if request.node_down {
        let grace = request.node_down_grace_hours.unwrap_or(state.default_grace_hours);
        store.set_node_down_sub(email, fingerprint, grace).await?;
    } else if remove_unrequested {
        store.remove_sub(email, fingerprint, SubKind::NodeDown).await?;
    }

    if request.version {
        store.set_version_sub(email, fingerprint, "obsolete").await?;
    } else if remove_unrequested {
        store.remove_sub(email, fingerprint, SubKind::Version).await?;
    }

    if request.bandwidth {
        let threshold = request.bandwidth_threshold_kbps.unwrap_or(20);
        store.set_bandwidth_sub(email, fingerprint, threshold).await?;
    } else if remove_unrequested {
        store.remove_sub(email, fingerprint, SubKind::Bandwidth).await?;
    }

    if request.dns_failure {
        let grace = request.dns_failure_grace_hours.unwrap_or(0);
        store.set_dns_fail_sub(email, fingerprint, grace).await?;
    } else if remove_unrequested {
        store.remove_sub(email, fingerprint, SubKind::DnsFailure).await?;
    }

    Ok(())
}

#[post("/subscribe")]
pub async fn subscribe(
    state: web::Data<AppState>,
    request: web::Json<SubscribeRequest>,
) -> Result<HttpResponse, AppError> {
    validate(&request.email, &request.fingerprint)?;
    if !request.wants_any() {
        return Err(AppError::BadRequest("must request at least one subscription".into()));
    }

    // The relay may not have been observed yet; keep a placeholder row so
    // the checks pick it up as soon as it appears in the consensus.
    if state.store.relay(&request.fingerprint).await?.is_none() {
        let relay = Relay::new(request.fingerprint.clone(), "Unnamed".to_string());
        state.store.save_relay(&relay).await?;
    }

    let subscriber = state.store.ensure_subscriber(&request.email, &request.fingerprint).await?;
    apply_kinds(&state, &request, false).await?;

    Ok(HttpResponse::Ok().json(SubscribeResponse {
        status: "ok",
        confirm_token: subscriber.confirm_token,
        unsubscribe_token: subscriber.unsubscribe_token,
        preferences_token: subscriber.preferences_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub email: String,
    pub fingerprint: String,
    #[serde(default)]
    pub node_down: bool,
    #[serde(default)]
    pub version: bool,
    #[serde(default)]
    pub bandwidth: bool,
    #[serde(default)]
    pub dns_failure: bool,
}

#[post("/unsubscribe")]
pub async fn unsubscribe(
    state: web::Data<AppState>,
    request: web::Json<UnsubscribeRequest>,
) -> Result<HttpResponse, AppError> {
    validate(&request.email, &request.fingerprint)?;

    let requested = [
        (request.node_down, SubKind::NodeDown, "node down"),
        (request.version, SubKind::Version, "version"),
        (request.bandwidth, SubKind::Bandwidth, "bandwidth"),
        (request.dns_failure, SubKind::DnsFailure, "dns failure"),
    ];
    if !requested.iter().any(|(wanted, _, _)| *wanted) {
        return Err(AppError::BadRequest("must name at least one subscription".into()));
    }

    for (wanted, kind, label) in requested {
        if !wanted {
            continue;
        }
        let removed =
            state.store.remove_sub(&request.email, &request.fingerprint, kind).await?;
        if !removed {
            return Err(AppError::NotFound(format!("no {label} subscription found")));
        }
    }

    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

/// Reconcile the subscription set to exactly what the request names.
#[post("/preferences")]
pub async fn preferences(
    state: web::Data<AppState>,
    request: web::Json<SubscribeRequest>,
) -> Result<HttpResponse, AppError> {
    validate(&request.email, &request.fingerprint)?;

    if state.store.subscriber(&request.email, &request.fingerprint).await?.is_none() {
        return Err(AppError::NotFound(
            "no subscription found, please subscribe first".into(),
        ));
    }

    apply_kinds(&state, &request, true).await?;

    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

#[get("/confirm/{token}")]
pub async fn confirm(
    state: web::Data<AppState>,
    token: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    if state.store.confirm_subscriber(&token).await? {
        Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
    } else {
        Err(AppError::NotFound("unknown confirmation token".into()))
    }
}
