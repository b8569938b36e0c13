//! HTTP server exposing subscriptions
//!
//! Routes:
//! - `GET /health`
//! - `GET /sub?token=T`, `GET /?token=T`
//! - `GET /sub/{T}`, `GET /{T}`
//!
//! A `token` query parameter wins over a token in the path.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::Response,
    routing::get,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, ConfigStore, StaticConfigStore};
use crate::error::{Result, SubpoolError};
use crate::fetch::hostname_of;
use crate::group::{GroupStore, StaticGroupStore};
use crate::pipeline::{RequestContext, SubscriptionPipeline};
use crate::policy::{AccessPolicy, Refusal};
use crate::response::ResponseComposer;
use crate::token::TokenResolver;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub config_store: Arc<dyn ConfigStore>,
    pub group_store: Arc<dyn GroupStore>,
    pub pipeline: SubscriptionPipeline,
}

impl AppState {
    /// Build state backed by static stores over `config`
    pub fn from_config(config: Config) -> Result<Self> {
        let group_store = StaticGroupStore::new(config.groups.clone())?;
        let pipeline = SubscriptionPipeline::new()?;
        Ok(Self {
            config_store: Arc::new(StaticConfigStore::new(config)),
            group_store: Arc::new(group_store),
            pipeline,
        })
    }
}

/// The subscription server
pub struct SubpoolServer {
    config: Config,
}

impl SubpoolServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind the listen address and serve until a shutdown signal arrives
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(AppState::from_config(self.config.clone())?);
        let app = create_router(state).layer(timeout_layer(Duration::from_secs(
            self.config.server.request_timeout_secs,
        )));

        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| SubpoolError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting subscription server on {addr}");
        tracing::info!("Serving {} group(s)", self.config.groups.len());
        match self.config.converter.endpoint() {
            Some((protocol, host)) => {
                tracing::info!("Conversion backend: {protocol}://{host}");
            }
            None => {
                tracing::warn!("No conversion backend configured, serving base64 only");
            }
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SubpoolError::Server(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| SubpoolError::Server(format!("Server error: {e}")))?;

        tracing::info!("Subscription server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(query_token_handler))
        .route("/sub", get(query_token_handler))
        .route("/sub/{token}", get(path_token_handler))
        .route("/{token}", get(path_token_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn query_token_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    uri: Uri,
    headers: HeaderMap,
) -> Response<Body> {
    serve_subscription(&state, None, query.as_deref(), &uri, &headers).await
}

async fn path_token_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    RawQuery(query): RawQuery,
    uri: Uri,
    headers: HeaderMap,
) -> Response<Body> {
    serve_subscription(&state, Some(token), query.as_deref(), &uri, &headers).await
}

async fn serve_subscription(
    state: &AppState,
    path_token: Option<String>,
    raw_query: Option<&str>,
    uri: &Uri,
    headers: &HeaderMap,
) -> Response<Body> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("subscription", request_id = %request_id);
    handle_subscription(state, path_token, raw_query, uri, headers)
        .instrument(span)
        .await
}

async fn handle_subscription(
    state: &AppState,
    path_token: Option<String>,
    raw_query: Option<&str>,
    uri: &Uri,
    headers: &HeaderMap,
) -> Response<Body> {
    let config = match state.config_store.load().await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load config");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };
    let groups = match state.group_store.list().await {
        Ok(groups) => groups,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list groups");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let query: Vec<(String, String)> = raw_query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let token = query
        .iter()
        .find(|(name, _)| name == "token")
        .map(|(_, value)| value.clone())
        .or(path_token)
        .unwrap_or_default();

    let now = Utc::now();
    let Some(resolution) = TokenResolver::resolve(&token, &groups, now) else {
        tracing::warn!("Request with unknown token");
        return unauthorized_response(config.server.redirect_url.as_deref());
    };

    if let Err(refusal) =
        AccessPolicy::new(&config.server).check(headers, &resolution.group, resolution.is_callback)
    {
        match refusal {
            Refusal::China => {
                tracing::warn!(group = %resolution.group.name, "Refused request from CN");
            }
            Refusal::Bot { score } => {
                tracing::warn!(group = %resolution.group.name, score, "Refused suspected bot");
            }
        }
        return plain_response(StatusCode::FORBIDDEN, "Forbidden");
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let host = request_authority(headers, uri);
    let serving_host = host.map(hostname_of);
    let origin = public_origin(&config, host, uri.scheme_str());

    let ctx = RequestContext {
        query: &query,
        user_agent,
        serving_host: serving_host.as_deref(),
        origin: &origin,
    };
    let payload = state.pipeline.generate(&config, &resolution, &ctx).await;

    ResponseComposer::new(&config.subscription).compose(payload, now)
}

/// Authority the request was addressed to: the `Host` header, or the
/// request-target authority when there is none (HTTP/2, absolute-form)
/// Requests running past `timeout` are answered with 408
fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

fn request_authority<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|host| !host.trim().is_empty())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
}

/// Origin the backend should call back to
fn public_origin(config: &Config, host: Option<&str>, scheme: Option<&str>) -> String {
    if let Some(base) = config.server.public_base_url.as_deref() {
        return base.trim_end_matches('/').to_string();
    }
    match host {
        Some(host) if !host.is_empty() => format!("{}://{host}", scheme.unwrap_or("https")),
        _ => format!("http://{}", config.server.listen_addr),
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn unauthorized_response(redirect_url: Option<&str>) -> Response<Body> {
    let location = redirect_url
        .filter(|url| !url.trim().is_empty())
        .and_then(|url| HeaderValue::from_str(url.trim()).ok());
    match location {
        Some(location) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::FOUND;
            response.headers_mut().insert(header::LOCATION, location);
            response
        }
        None => plain_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_base64;
    use crate::group::GroupRecord;
    use axum::http::Request;
    use tower::ServiceExt;

    const CLIENT_UA: &str = "v2rayN/6.45";

    fn group(id: &str, token: &str, sources: &[&str]) -> GroupRecord {
        GroupRecord {
            id: id.to_string(),
            name: id.to_string(),
            token: token.to_string(),
            is_admin: false,
            is_guest: false,
            allow_china_access: false,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            filter: Default::default(),
        }
    }

    fn test_state(redirect_url: Option<&str>) -> Arc<AppState> {
        let mut config = Config::default();
        config.server.redirect_url = redirect_url.map(str::to_string);
        config.groups = vec![
            group("main", "main-token", &["vless://A#node1", "vless://A#node1"]),
            group("other", "other-token", &["ss://B#node2"]),
        ];
        Arc::new(AppState::from_config(config).unwrap())
    }

    async fn get(app: Router, uri: &str, headers: &[(&str, &str)]) -> Response<Body> {
        let mut builder = Request::builder().uri(uri).header(header::HOST, "sub.example.com");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state(None));
        let response = get(app, "/health", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_token_routes() {
        let expected = encode_base64("vless://A#node1");
        for uri in ["/sub?token=main-token", "/?token=main-token", "/sub/main-token", "/main-token"] {
            let app = create_router(test_state(None));
            let response = get(app, uri, &[("user-agent", CLIENT_UA)]).await;
            assert_eq!(response.status(), StatusCode::OK, "uri {uri}");
            assert!(response.headers().contains_key("subscription-userinfo"));
            assert_eq!(body_string(response).await, expected, "uri {uri}");
        }
    }

    #[tokio::test]
    async fn test_query_token_wins_over_path() {
        let app = create_router(test_state(None));
        let response = get(app, "/sub/main-token?token=other-token", &[("user-agent", CLIENT_UA)]).await;
        assert_eq!(body_string(response).await, encode_base64("ss://B#node2"));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let app = create_router(test_state(None));
        let response = get(app, "/sub?token=nope", &[("user-agent", CLIENT_UA)]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let app = create_router(test_state(None));
        let response = get(app, "/", &[("user-agent", CLIENT_UA)]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_token_redirects_when_configured() {
        let app = create_router(test_state(Some("https://example.org/")));
        let response = get(app, "/nope", &[("user-agent", CLIENT_UA)]).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "https://example.org/");
    }

    #[tokio::test]
    async fn test_china_is_refused() {
        let app = create_router(test_state(None));
        let response = get(
            app,
            "/sub?token=main-token",
            &[("user-agent", CLIENT_UA), ("cf-ipcountry", "CN")],
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_bot_is_refused() {
        let app = create_router(test_state(None));
        let response = get(app, "/sub?token=main-token", &[("user-agent", "Googlebot/2.1")]).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_public_origin() {
        let mut config = Config::default();
        assert_eq!(
            public_origin(&config, Some("sub.example.com:8443"), None),
            "https://sub.example.com:8443"
        );
        assert_eq!(
            public_origin(&config, Some("10.0.0.5:8787"), Some("http")),
            "http://10.0.0.5:8787"
        );
        assert_eq!(public_origin(&config, None, None), "http://127.0.0.1:8787");
        config.server.public_base_url = Some("https://public.example.com/".to_string());
        assert_eq!(
            public_origin(&config, Some("internal:8787"), None),
            "https://public.example.com"
        );
    }

    #[test]
    fn test_request_authority_falls_back_to_uri() {
        let uri: Uri = "https://sub.example.com:8443/sub?token=t".parse().unwrap();
        assert_eq!(
            request_authority(&HeaderMap::new(), &uri),
            Some("sub.example.com:8443")
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("edge.example.com"));
        assert_eq!(request_authority(&headers, &uri), Some("edge.example.com"));

        let relative: Uri = "/sub?token=t".parse().unwrap();
        assert_eq!(request_authority(&HeaderMap::new(), &relative), None);
    }

    #[tokio::test]
    async fn test_slow_request_times_out_with_408() {
        let app = Router::new()
            .route(
                "/slow",
                axum::routing::get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .layer(timeout_layer(Duration::from_millis(20)));

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
