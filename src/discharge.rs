//! The discharge protocol engine
//!
//! Target services attach third-party caveats addressed to this service;
//! clients bring them here to be discharged. An authorized caller gets a
//! discharge macaroon directly; an unauthorized caller is parked at the
//! rendezvous place and told where to log in and where to wait. The wait
//! endpoint picks up the login outcome, restricts the fresh identity macaroon
//! to the original request origin, and re-runs the same caveat check as the
//! logged-in user.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use waypost_bakery::checkers::{client_origin_caveat, declared_caveat, parse_caveat, time_before_caveat};
use waypost_bakery::macaroon::encode_slice;
use waypost_bakery::{decode_caveat, login_op, Caveat, Macaroon, ThirdPartyCaveatInfo};

use crate::auth::{discharge_for_op, origin_header, Identity, User};
use crate::error::{Error, Result};
use crate::meeting::{DoneRequest, RendezvousInfo};
use crate::server::{method_not_allowed, AppState};
use crate::store::Session;

/// How long an issued discharge token remains valid
const DISCHARGE_TOKEN_HOURS: i64 = 6;

/// How long an `is-authenticated-user` discharge remains valid
const DISCHARGE_HOURS: i64 = 24;

/// The `v1` handler group
pub fn v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/discharge",
            get(discharge_get)
                .post(discharge_post)
                .fallback(method_not_allowed),
        )
        .route("/wait", get(wait).fallback(method_not_allowed))
        .route(
            "/discharge-token-for-user",
            get(discharge_token_for_user).fallback(method_not_allowed),
        )
}

/// Routes served only on the private-network listener, never on the public
/// address.
pub(crate) fn private_routes() -> Router<AppState> {
    Router::new().route(
        "/v1/rendezvous/done",
        post(rendezvous_done).fallback(method_not_allowed),
    )
}

/// Parameters of a discharge request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DischargeRequest {
    /// The third-party caveat id to discharge
    #[serde(default)]
    pub id: Option<String>,

    /// Discharge on behalf of this user instead of the caller (admin only)
    #[serde(default, rename = "discharge-for-user")]
    pub discharge_for_user: Option<String>,
}

/// Response from the discharge endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DischargeResponse {
    /// The discharge macaroon
    #[serde(rename = "Macaroon")]
    pub macaroon: Macaroon,
}

/// Parameters of a wait request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaitRequest {
    /// The rendezvous to wait on
    #[serde(default)]
    pub waitid: String,
}

/// Response from the wait endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    /// The acquired discharge macaroon
    #[serde(rename = "Macaroon")]
    pub macaroon: Macaroon,

    /// Identity macaroon sequence usable as authorization for future
    /// discharge requests
    #[serde(rename = "DischargeToken")]
    pub discharge_token: Vec<Macaroon>,
}

/// Parameters of a discharge-token-for-user request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DischargeTokenRequest {
    /// The user to issue a discharge token for
    #[serde(default)]
    pub username: String,
}

/// Response from the discharge-token-for-user endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DischargeTokenForUserResponse {
    /// Macaroon presentable in place of an interactive login
    #[serde(rename = "DischargeToken")]
    pub discharge_token: Macaroon,
}

async fn discharge_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(session): Extension<Arc<Session>>,
    Query(request): Query<DischargeRequest>,
) -> Result<Json<DischargeResponse>> {
    handle_discharge(state, headers, session, request).await
}

async fn discharge_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(session): Extension<Arc<Session>>,
    Form(request): Form<DischargeRequest>,
) -> Result<Json<DischargeResponse>> {
    handle_discharge(state, headers, session, request).await
}

async fn handle_discharge(
    state: AppState,
    headers: HeaderMap,
    session: Arc<Session>,
    request: DischargeRequest,
) -> Result<Json<DischargeResponse>> {
    let caveat_id = request
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::BadRequest("caveat id not found in discharge request".to_string()))?;
    let (root_key, condition) = decode_caveat(state.oven.key(), caveat_id)
        .map_err(|e| Error::BadRequest(format!("cannot decode caveat: {e}")))?;

    let caveat_info = ThirdPartyCaveatInfo {
        caveat_id: caveat_id.to_string(),
        condition,
    };
    let caveats = check_third_party_caveat(
        &state,
        &headers,
        &session,
        &caveat_info,
        request.discharge_for_user.as_deref(),
    )
    .await?;

    Ok(Json(DischargeResponse {
        macaroon: mint_discharge(&state, &root_key, caveat_id, &caveats),
    }))
}

/// Check a third-party caveat against the caller's identity and return the
/// first-party caveats to attach to the discharge.
///
/// Callers that cannot be authorized are parked at the rendezvous place and
/// receive an interaction-required error naming the login and wait URLs.
pub async fn check_third_party_caveat(
    state: &AppState,
    headers: &HeaderMap,
    session: &Session,
    caveat_info: &ThirdPartyCaveatInfo,
    discharge_for_user: Option<&str>,
) -> Result<Vec<Caveat>> {
    let discharge_for_user = discharge_for_user.filter(|user| !user.is_empty());
    let op = match discharge_for_user {
        Some(_) => discharge_for_op(),
        None => login_op(),
    };

    let auth = match state.authorizer.authorize(headers, session, &op).await {
        Ok(auth) => auth,
        Err(why) => return Err(need_login(state, headers, caveat_info, why).await),
    };
    info!(
        entity = %op.entity,
        action = %op.action,
        identity = %auth.identity.id(),
        "discharge authorization succeeded"
    );

    let mut identity: Arc<dyn Identity> = auth.identity;
    if let Some(user) = discharge_for_user {
        // The usual authorization logic was bypassed for the target user, so
        // make sure the identity actually exists.
        let record = session.store().get(user).await?;
        identity = Arc::new(User::new(
            record.username,
            record.groups,
            state.authorizer.resolver(),
        ));
    }

    let (condition, args) = parse_caveat(&caveat_info.condition)
        .map_err(|_| Error::BadRequest(format!("cannot parse caveat {:?}", caveat_info.condition)))?;
    let caveats = match condition {
        "is-authenticated-user" => vec![
            declared_caveat("username", identity.id()),
            time_before_caveat(Utc::now() + ChronoDuration::hours(DISCHARGE_HOURS)),
        ],
        "is-member-of" => {
            let required: Vec<String> = args.split_whitespace().map(String::from).collect();
            let allowed = identity
                .allow(&required)
                .await
                .map_err(|e| Error::Internal(format!("cannot check group membership: {e}")))?;
            if !allowed {
                return Err(Error::Forbidden(
                    "user is not a member of required groups".to_string(),
                ));
            }
            Vec::new()
        }
        _ => return Err(Error::CaveatNotRecognized(caveat_info.condition.clone())),
    };

    update_discharge_time(session, identity.id()).await;
    Ok(caveats)
}

/// Record the identity's last discharge time; failures are logged only, the
/// discharge itself must succeed.
async fn update_discharge_time(session: &Session, username: &str) {
    if let Err(e) = session.store().set_last_discharge(username, Utc::now()).await {
        info!(username = %username, error = %e, "unexpected error updating last discharge time");
    }
}

/// Park the request at the rendezvous place and build the error telling the
/// client where to log in.
async fn need_login(
    state: &AppState,
    headers: &HeaderMap,
    caveat_info: &ThirdPartyCaveatInfo,
    why: Error,
) -> Error {
    let info = RendezvousInfo {
        caveat_id: caveat_info.caveat_id.clone(),
        condition: caveat_info.condition.clone(),
        origin: origin_header(headers).unwrap_or_default(),
    };
    let wait_id = match state.place.new_rendezvous(info).await {
        Ok(wait_id) => wait_id,
        Err(e) => return Error::Internal(format!("cannot make rendezvous: {e}")),
    };
    Error::InteractionRequired {
        visit_url: format!("{}/v1/login?waitid={wait_id}", state.params.location),
        wait_url: format!("{}/v1/wait?waitid={wait_id}", state.params.location),
        reason: why.to_string(),
    }
}

fn mint_discharge(
    state: &AppState,
    root_key: &[u8; 32],
    caveat_id: &str,
    caveats: &[Caveat],
) -> Macaroon {
    let mut macaroon = Macaroon::new(
        root_key,
        caveat_id,
        Some(state.oven.location().to_string()),
    );
    for caveat in caveats {
        macaroon.add_first_party_caveat(&caveat.id);
    }
    macaroon
}

async fn wait(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(session): Extension<Arc<Session>>,
    Query(request): Query<WaitRequest>,
) -> Result<Response> {
    if request.waitid.is_empty() {
        return Err(Error::BadRequest("wait id parameter not found".to_string()));
    }
    let (info, login) = state.place.wait(&request.waitid).await?;
    if let Some(cause) = login.error {
        return Err(Error::Unauthorized(format!("login failed: {cause}")));
    }
    let mut sequence = login
        .identity_macaroon
        .filter(|sequence| !sequence.is_empty())
        .ok_or_else(|| {
            Error::Internal("rendezvous completed without an identity macaroon".to_string())
        })?;

    // The identity macaroon may only be used from the origin that started
    // the discharge.
    sequence[0].add_first_party_caveat(&client_origin_caveat(&info.origin).id);
    let cookie_value = encode_slice(&sequence)
        .map_err(|e| Error::Internal(format!("cannot encode identity macaroon: {e}")))?;

    // Check the third-party caveat as the logged-in user: present the newly
    // minted identity macaroon on the request and run the same discharge
    // check an already-authenticated caller would go through.
    let mut enriched = headers.clone();
    enriched.append(
        COOKIE,
        format!("macaroon-identity={cookie_value}")
            .parse()
            .map_err(|_| Error::Internal("cannot build identity cookie".to_string()))?,
    );

    let (root_key, condition) = decode_caveat(state.oven.key(), &info.caveat_id)
        .map_err(|e| Error::BadRequest(format!("cannot decode caveat: {e}")))?;
    let caveat_info = ThirdPartyCaveatInfo {
        caveat_id: info.caveat_id.clone(),
        condition,
    };
    let caveats = check_third_party_caveat(&state, &enriched, &session, &caveat_info, None).await?;
    let macaroon = mint_discharge(&state, &root_key, &info.caveat_id, &caveats);

    let mut response = Json(WaitResponse {
        macaroon,
        discharge_token: sequence,
    })
    .into_response();
    if state.params.insecure_wait_cookie {
        // Known exposure: any caller of this endpoint obtains the identity
        // cookie. Kept for command-line agents; disable for browser-only
        // deployments.
        response.headers_mut().append(
            SET_COOKIE,
            format!("macaroon-identity={cookie_value}; Path=/")
                .parse()
                .map_err(|_| Error::Internal("cannot build identity cookie".to_string()))?,
        );
    }
    Ok(response)
}

async fn discharge_token_for_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(session): Extension<Arc<Session>>,
    Query(request): Query<DischargeTokenRequest>,
) -> Result<Json<DischargeTokenForUserResponse>> {
    state
        .authorizer
        .authorize(&headers, &session, &discharge_for_op())
        .await?;
    if request.username.is_empty() {
        return Err(Error::BadRequest("username parameter not found".to_string()));
    }
    if let Err(e) = session.store().get(&request.username).await {
        return Err(match e {
            Error::NotFound(_) => e,
            other => Error::Internal(format!("cannot get identity: {other}")),
        });
    }

    let discharge_token = state
        .oven
        .mint(
            Utc::now() + ChronoDuration::hours(DISCHARGE_TOKEN_HOURS),
            &[declared_caveat("username", &request.username)],
            &[login_op()],
        )
        .await
        .map_err(|e| Error::Internal(format!("cannot create discharge token: {e}")))?;
    Ok(Json(DischargeTokenForUserResponse { discharge_token }))
}

/// Receives rendezvous completions forwarded from peer instances. Reachable
/// only through the private-network listener; the public router never mounts
/// it.
async fn rendezvous_done(
    State(state): State<AppState>,
    Json(request): Json<DoneRequest>,
) -> Result<StatusCode> {
    state.place.done_local(&request.wait_id, request.result)?;
    Ok(StatusCode::OK)
}
