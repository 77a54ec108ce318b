//! The HTTP dispatch shell
//!
//! Composes the versioned handler groups behind a common shell that isolates
//! panics, sets the CORS headers the protocol requires, answers every
//! `OPTIONS` request, and acquires a store session for each request before
//! its handler runs. Routes are matched exactly as declared: unmatched paths
//! get `not found`, and a path registered under another method gets
//! `method not allowed`.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{OriginalUri, Request, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::FutureExt;
use tower_http::services::ServeDir;
use tracing::{error, info};

use waypost_bakery::{
    KeyPair, MemoryRootKeyStore, Namespace, Oven, OvenParams, ThirdPartyInfo, ThirdPartyStore,
};

use crate::auth::{Authorizer, AuthorizerParams};
use crate::discharge;
use crate::error::{Error, ErrorBody, Result};
use crate::groups::{CachedResolver, GroupResolver, LaunchpadResolver};
use crate::meeting::{HttpForwarder, InMemoryRegistry, Place};
use crate::params::{ServerParams, DEFAULT_GROUP_CACHE_TTL};
use crate::store::{IdentityBackend, Pool};

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub params: ServerParams,
    /// Mints macaroons and verifies the ones it minted
    pub oven: Arc<Oven>,
    /// Bounded pool of store sessions
    pub pool: Arc<Pool>,
    /// The rendezvous place
    pub place: Arc<Place>,
    /// Verifies request credentials
    pub authorizer: Arc<Authorizer>,
}

/// Assemble the server state from its configuration and identity storage.
///
/// Generates a service key when none is configured and registers the service
/// in its own third-party locator so it can discharge the caveats it issues
/// templates for.
pub fn build_state(params: ServerParams, backend: Arc<dyn IdentityBackend>) -> Result<AppState> {
    let key = params.key.clone().unwrap_or_else(|| {
        info!("no service key configured; generating one");
        KeyPair::generate()
    });

    let locator = Arc::new(ThirdPartyStore::new());
    locator.add_info(&params.location, ThirdPartyInfo { key: *key.secret() });
    let oven = Arc::new(Oven::new(OvenParams {
        namespace: Namespace::std(),
        key,
        location: "identity".to_string(),
        locator,
        root_keys: Arc::new(MemoryRootKeyStore::new()),
    }));

    let resolver: Option<Arc<dyn GroupResolver>> = match &params.launchpad {
        Some(base_url) => Some(Arc::new(CachedResolver::new(
            Arc::new(LaunchpadResolver::new(base_url.clone())?),
            DEFAULT_GROUP_CACHE_TTL,
        ))),
        None => None,
    };

    let pool = Arc::new(Pool::new(
        backend,
        params.max_sessions,
        params.request_timeout,
    ));
    let place = Arc::new(Place::new(
        params.rendezvous_ttl,
        params.private_addr.clone(),
        Arc::new(InMemoryRegistry::new()),
        Some(Arc::new(HttpForwarder::new()?)),
    ));
    let authorizer = Arc::new(Authorizer::new(AuthorizerParams {
        admin_username: params.auth_username.clone(),
        admin_password: params.auth_password.clone(),
        oven: oven.clone(),
        resolver,
    }));

    Ok(AppState {
        params,
        oven,
        pool,
        place,
        authorizer,
    })
}

/// The versioned handler groups this server mounts
fn versions() -> Vec<(&'static str, Router<AppState>)> {
    vec![("v1", discharge::v1_routes())]
}

/// Build the full router for the given state
pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new();
    for (version, routes) in versions() {
        let group = routes.layer(middleware::from_fn_with_state(
            state.clone(),
            acquire_session,
        ));
        app = app.nest(&format!("/{version}"), group);
    }
    if let Some(static_dir) = &state.params.static_dir {
        app = app.nest_service("/static", ServeDir::new(static_dir));
    }
    app.fallback(not_found)
        .layer(middleware::from_fn(shell))
        .with_state(state)
}

/// Build the router served on the private rendezvous listener.
///
/// Peer instances forward rendezvous completions here; the route is never
/// mounted on the public router, so only hosts that can reach the private
/// address can complete a rendezvous.
pub fn build_private_router(state: AppState) -> Router {
    discharge::private_routes()
        .fallback(not_found)
        .layer(middleware::from_fn(shell))
        .with_state(state)
}

/// Bind both listeners and serve until the process is stopped.
///
/// The public API listens on `addr`; rendezvous forwarding between instances
/// listens separately on `private_addr`, which must only be reachable over
/// the private network.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let private_addr = format!("{}:{}", state.params.private_addr, crate::meeting::PRIVATE_PORT);
    let private_listener = tokio::net::TcpListener::bind(&private_addr)
        .await
        .map_err(|e| Error::Internal(format!("cannot bind {private_addr}: {e}")))?;
    info!(addr = %private_addr, "rendezvous forwarding listener bound");
    let private_router = build_private_router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(private_listener, private_router).await {
            error!(error = %e, "rendezvous forwarding listener error");
        }
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("cannot bind {addr}: {e}")))?;
    info!(addr = %addr, "identity server listening");
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Internal(format!("server error: {e}")))
}

const CORS_ALLOW_HEADERS: &str =
    "Bakery-Protocol-Version, Macaroons, X-Requested-With, Content-Type";
const CORS_CACHE_MAX_AGE: &str = "600";

fn set_cors(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        HeaderName::from_static("access-control-cache-max-age"),
        HeaderValue::from_static(CORS_CACHE_MAX_AGE),
    );
}

/// Outermost middleware: OPTIONS catch-all, panic isolation, CORS headers on
/// every response.
async fn shell(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        set_cors(response.headers_mut());
        return response;
    }

    let path = request.uri().path().to_string();
    let mut response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(path = %path, message = %message, "handler panicked");
            let body = ErrorBody {
                code: "panic".to_string(),
                message,
                info: None,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    };
    set_cors(response.headers_mut());
    response
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

/// Acquire a store session for the request and release it on every exit path
/// (the session guard returns its pool permit on drop).
async fn acquire_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.pool.session().await {
        Ok(session) => {
            request.extensions_mut().insert(Arc::new(session));
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Fallback for paths no route matches
async fn not_found(OriginalUri(uri): OriginalUri) -> Error {
    Error::NotFound(uri.path().to_string())
}

/// Per-route fallback for paths registered under another method
pub(crate) async fn method_not_allowed(method: Method, OriginalUri(uri): OriginalUri) -> Error {
    Error::MethodNotAllowed {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use tower::ServiceExt;

    async fn error_body(response: Response) -> ErrorBody {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn boom() -> &'static str {
        panic!("something went badly wrong")
    }

    fn shell_router() -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/boom", get(boom))
            .fallback(not_found)
            .layer(middleware::from_fn(shell))
    }

    #[tokio::test]
    async fn test_shell_passes_responses_through_with_cors() {
        let response = shell_router()
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/ok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            CORS_ALLOW_HEADERS
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-cache-max-age")
                .unwrap(),
            "600"
        );
    }

    #[tokio::test]
    async fn test_shell_answers_options_everywhere() {
        for path in ["/ok", "/boom", "/anything/else"] {
            let response = shell_router()
                .oneshot(
                    HttpRequest::builder()
                        .method("OPTIONS")
                        .uri(path)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
            assert!(bytes.is_empty());
        }
    }

    #[tokio::test]
    async fn test_shell_converts_panics() {
        let response = shell_router()
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/boom")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = error_body(response).await;
        assert_eq!(body.code, "panic");
        assert!(body.message.contains("something went badly wrong"));
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let response = shell_router()
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = error_body(response).await;
        assert_eq!(body.code, "not found");
        assert!(body.message.contains("/nope"));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "panic");
    }
}
