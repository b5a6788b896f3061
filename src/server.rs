//! Router construction, the middleware chain, and server bootstrap.
//!
//! Layout of the served surface:
//! - `{prefix}` lists the served API versions
//! - `{prefix}/{version}/...` is the versioned API (see [`api_routes`])
//! - `/healthz`, `/version`, `/metrics` are support endpoints
//! - anything else is a JSON 404
//!
//! The routed surface is wrapped by the middleware [`Chain`]: CORS (when
//! origins are configured), then authentication (when a token file is
//! configured), then panic recovery, outermost.  Listener limits and request
//! metrics sit outside the chain.
//!
//! Connections are served over HTTP/1 by [`serve_listener`], whose read
//! buffer holds a header block of [`MAX_HEADER_BYTES`] plus
//! [`READ_BUF_SLACK`].  Blocks up to the limit reach the router; larger ones
//! get a JSON 431 from the router, or hyper's bare 431 once they overflow
//! the buffer.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::api::ApiVersion;
use crate::auth::{self, TokenAuthenticator};
use crate::cloudprovider;
use crate::config::{Config, ConfigError};
use crate::cors::{self, CorsPolicy};
use crate::errors::ApiError;
use crate::handlers::{endpoints, minion, service, support, watch};
use crate::metrics::{init_metrics, metrics_handler, metrics_middleware};
use crate::registry::kv::KvServiceRegistry;
use crate::registry::minion as minions;
use crate::storage;
use crate::AppState;

/// Read/write timeout applied to every request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Largest accepted request header block.
pub const MAX_HEADER_BYTES: usize = 1 << 20;

/// Read buffer beyond [`MAX_HEADER_BYTES`], so a block just over the limit
/// is still parsed and answered by [`limit_header_size`].
pub const READ_BUF_SLACK: usize = 64 << 10;

/// Most header fields hyper parses per request.
pub const MAX_HEADERS: usize = 4096;

// -- Routes -------------------------------------------------------------------

/// Routes served under `{prefix}/{version}`.
pub fn api_routes(version: ApiVersion) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/services",
            get(service::list_services).post(service::create_service),
        )
        .route(
            "/services/:name",
            get(service::get_service)
                .put(service::update_service)
                .delete(service::delete_service),
        )
        .route("/endpoints", get(endpoints::list_endpoints))
        .route(
            "/endpoints/:name",
            get(endpoints::get_endpoints).put(endpoints::update_endpoints),
        )
        .route("/minions", get(minion::list_minions))
        .route("/minions/:name", get(minion::get_minion))
        .route("/watch/services", get(watch::watch_services))
        .route("/watch/endpoints", get(watch::watch_endpoints))
        .layer(Extension(version))
}

/// The routing target: every API version plus the support endpoints.
pub fn routes(state: Arc<AppState>) -> Router {
    let prefix = state.config.api_prefix.clone();
    let mut router = Router::new()
        .route("/healthz", get(support::healthz))
        .route("/version", get(support::version))
        .route("/metrics", get(metrics_handler))
        .route(&prefix, get(support::api_versions));
    for version in ApiVersion::ALL {
        router = router.nest(&format!("{prefix}/{version}"), api_routes(version));
    }
    router.fallback(support::not_found).with_state(state)
}

// -- Middleware chain ---------------------------------------------------------

/// One wrapper in the middleware chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cors,
    Authenticate,
    RecoverPanics,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Cors => "cors",
            Stage::Authenticate => "authenticate",
            Stage::RecoverPanics => "recover-panics",
        }
    }
}

/// The request wrappers around the routing target, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    cors: Option<Arc<CorsPolicy>>,
    auth: Option<Arc<TokenAuthenticator>>,
}

impl Chain {
    pub fn new(cors: Option<CorsPolicy>, auth: Option<Arc<TokenAuthenticator>>) -> Self {
        Self {
            cors: cors.map(Arc::new),
            auth,
        }
    }

    /// CORS only with at least one origin pattern, authentication only
    /// with a token file.
    pub fn from_config(config: &Config) -> Self {
        let cors = (!config.cors_allowed_origins.is_empty())
            .then(|| CorsPolicy::new(config.cors_allowed_origins.clone()));
        Self::new(cors, config.token_auth.clone())
    }

    /// The stages applied, innermost first.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(3);
        if self.cors.is_some() {
            stages.push(Stage::Cors);
        }
        if self.auth.is_some() {
            stages.push(Stage::Authenticate);
        }
        stages.push(Stage::RecoverPanics);
        stages
    }

    /// Wrap `router` in every stage.
    pub fn wrap(&self, router: Router) -> Router {
        let mut router = router;
        if let Some(policy) = &self.cors {
            router = router.layer(middleware::from_fn_with_state(policy.clone(), cors::cors));
        }
        if let Some(tokens) = &self.auth {
            router = router.layer(middleware::from_fn_with_state(
                tokens.clone(),
                auth::authenticate,
            ));
        }
        router
            .layer(CatchPanicLayer::custom(recover_panic))
            .layer(TraceLayer::new_for_http())
    }
}

/// Turn a caught panic into a 500.  The panic message is logged, not sent.
fn recover_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("recovered from panic while serving request: {}", message);
    ApiError::Panic {
        message: "the server panicked while handling the request; see server log".to_string(),
    }
    .into_response()
}

// -- Listener limits ----------------------------------------------------------

/// Size of the request line and header block as sent on the wire.
fn header_bytes(req: &Request) -> usize {
    let line = req.method().as_str().len() + req.uri().to_string().len() + 12;
    req.headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum::<usize>()
        + line
}

async fn limit_header_size(req: Request, next: Next) -> Response {
    if header_bytes(&req) > MAX_HEADER_BYTES {
        warn!("rejecting request with oversized headers");
        return ApiError::HeaderTooLarge.into_response();
    }
    next.run(req).await
}

// -- Bootstrap ----------------------------------------------------------------

/// Assemble the full service from shared state.
pub fn app(state: Arc<AppState>) -> Router {
    init_metrics();
    let chain = Chain::from_config(&state.config);
    let names: Vec<&str> = chain.stages().iter().map(Stage::as_str).collect();
    info!("Middleware chain (innermost first): {}", names.join(", "));

    chain
        .wrap(routes(state))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(limit_header_size))
}

/// Build the storage backend, cloud provider, and registries for `config`,
/// then the service.  Nothing is contacted over the network here.
pub fn build_app(config: Config) -> Result<Router, ConfigError> {
    let cloud = cloudprovider::init_cloud_provider(config.cloud.as_ref())?;
    let store = storage::open(&config.storage)
        .map_err(|e| ConfigError::StorageConfigInvalid(e.to_string()))?;
    let services = Arc::new(KvServiceRegistry::new(store, config.storage_version));
    let minions = minions::build(&config.nodes, cloud);
    let state = Arc::new(AppState {
        config: Arc::new(config),
        services,
        minions,
    });
    Ok(app(state))
}

/// Serve `app` on `addr` until SIGINT or SIGTERM.
pub async fn serve(addr: SocketAddr, app: Router) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving on {}", listener.local_addr()?);
    serve_listener(listener, app, shutdown_signal()).await;
    Ok(())
}

fn http1_builder() -> http1::Builder {
    let mut builder = http1::Builder::new();
    builder
        .max_buf_size(MAX_HEADER_BYTES + READ_BUF_SLACK)
        .max_headers(MAX_HEADERS);
    builder
}

/// Accept connections on `listener` until `shutdown` resolves, then wait
/// for open connections to finish.
pub async fn serve_listener<F>(listener: TcpListener, app: Router, shutdown: F)
where
    F: Future<Output = ()> + Send,
{
    let builder = http1_builder();
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let service = TowerToHyperService::new(app.clone());
                let conn = graceful.watch(builder.serve_connection(TokioIo::new(stream), service));
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("connection from {} ended: {}", remote, e);
                    }
                });
            }
            _ = &mut shutdown => break,
        }
    }

    drop(listener);
    graceful.shutdown().await;
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use regex::Regex;

    #[test]
    fn test_stage_order() {
        assert_eq!(Chain::default().stages(), vec![Stage::RecoverPanics]);

        let tokens = Arc::new(TokenAuthenticator::parse("t,u,1").unwrap());
        let cors = CorsPolicy::new(vec![Regex::new("x").unwrap()]);
        assert_eq!(
            Chain::new(Some(cors), Some(tokens)).stages(),
            vec![Stage::Cors, Stage::Authenticate, Stage::RecoverPanics]
        );
    }

    #[test]
    fn test_header_bytes() {
        let req = Request::builder()
            .uri("/healthz")
            .header("x-big", "a".repeat(MAX_HEADER_BYTES))
            .body(Body::empty())
            .unwrap();
        assert!(header_bytes(&req) > MAX_HEADER_BYTES);

        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        assert!(header_bytes(&req) < 64);
    }

    #[test]
    fn test_recover_panic_hides_message() {
        let resp = recover_panic(Box::new("secret detail".to_string()));
        assert_eq!(resp.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
