//! HTTP server bootstrap for courier-flow.
//!
//! This module wires together:
//! - configuration
//! - storage (PostgreSQL when `DATABASE_URL` is set, in-memory otherwise)
//! - evidence object storage and webhook notifications
//! - the workflow engines
//! - the Axum router

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::api;
use crate::auth::{
    session_middleware, AuthMiddlewareState, Authenticator, JwtValidator, ACTOR_ID_HEADER,
    ACTOR_ROLE_HEADER, SESSION_ID_HEADER,
};
use crate::infra::{
    B2bRepository, CircuitBreakerRegistry, EvidenceStorage, HealthCheck, InMemoryStore,
    LocalObjectStorage, NoopNotifier, Notifier, PgStore, ShipmentRepository, WebhookConfig,
    WebhookDispatcher,
};
use crate::metrics::MetricsRegistry;
use crate::workflow::{B2bWorkflow, EvidenceUploader, ShipmentWorkflow};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub max_connections: u32,
    pub migrate_on_startup: bool,
    /// Root directory of the local evidence store
    pub evidence_dir: PathBuf,
    /// Prefix of the public URLs returned for uploaded evidence
    pub evidence_public_url: String,
    pub webhook: WebhookConfig,
    pub jwt_secret: Option<String>,
    pub require_auth: bool,
    pub log_format: LogFormat,
    /// Comma-separated origins, `*` for any
    pub cors_allow_origins: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_var(&var, "PORT", 8080)?;
        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {host}:{port}: {e}"))?;

        let migrate_on_startup = var("DB_MIGRATE_ON_STARTUP")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(true);

        let webhook = WebhookConfig {
            urls: var("WEBHOOK_URLS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            timeout: Duration::from_millis(parse_var(&var, "WEBHOOK_TIMEOUT_MS", 5000)?),
            queue_capacity: parse_var(&var, "WEBHOOK_QUEUE_CAPACITY", 1024)?,
            ..WebhookConfig::default()
        };

        let log_format = match var("LOG_FORMAT").as_deref() {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let auth_mode = var("AUTH_MODE").unwrap_or_else(|| "required".to_string());

        Ok(Self {
            database_url: var("DATABASE_URL"),
            listen_addr,
            max_connections: parse_var(&var, "MAX_DB_CONNECTIONS", 10)?,
            migrate_on_startup,
            evidence_dir: var("EVIDENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./evidence")),
            evidence_public_url: var("EVIDENCE_PUBLIC_URL")
                .unwrap_or_else(|| "http://localhost:8080/evidence".to_string()),
            webhook,
            jwt_secret: var("JWT_SECRET"),
            require_auth: !auth_mode.eq_ignore_ascii_case("disabled"),
            log_format,
            cors_allow_origins: var("CORS_ALLOW_ORIGINS"),
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub shipments: Arc<ShipmentWorkflow>,
    pub b2b: Arc<B2bWorkflow>,
    pub health: Arc<dyn HealthCheck>,
    pub metrics: Arc<MetricsRegistry>,
    pub webhook_breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl AppState {
    /// Wire both workflows over one store
    pub fn new<S>(
        store: Arc<S>,
        evidence: Arc<dyn EvidenceStorage>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self
    where
        S: ShipmentRepository + B2bRepository + HealthCheck + 'static,
    {
        let uploader = EvidenceUploader::new(evidence, metrics.clone());
        let shipments = ShipmentWorkflow::new(
            store.clone(),
            uploader.clone(),
            notifier.clone(),
            metrics.clone(),
        );
        let b2b = B2bWorkflow::new(store.clone(), uploader, notifier, metrics.clone());
        Self {
            shipments: Arc::new(shipments),
            b2b: Arc::new(b2b),
            health: store,
            metrics,
            webhook_breakers: None,
        }
    }

    pub fn with_webhook_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.webhook_breakers = Some(breakers);
        self
    }
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    info!("Starting courier-flow v{}", env!("CARGO_PKG_VERSION"));
    info!("  Listen address: {}", config.listen_addr);

    let auth_state = auth_state(&config)?;
    let metrics = Arc::new(MetricsRegistry::new());

    tokio::fs::create_dir_all(&config.evidence_dir).await?;
    let evidence: Arc<dyn EvidenceStorage> = Arc::new(LocalObjectStorage::new(
        config.evidence_dir.clone(),
        config.evidence_public_url.clone(),
    ));
    info!("  Evidence directory: {}", config.evidence_dir.display());

    let (notifier, breakers) = if config.webhook.urls.is_empty() {
        info!("Webhooks not configured (set WEBHOOK_URLS to enable)");
        (Arc::new(NoopNotifier) as Arc<dyn Notifier>, None)
    } else {
        info!("  Webhook endpoints: {}", config.webhook.urls.len());
        let (dispatcher, _worker) =
            WebhookDispatcher::spawn(config.webhook.clone(), metrics.clone())?;
        let breakers = dispatcher.breakers();
        (Arc::new(dispatcher) as Arc<dyn Notifier>, Some(breakers))
    };

    let state = match &config.database_url {
        Some(url) => {
            info!("Connecting to PostgreSQL...");
            let store = PgStore::connect(url, config.max_connections).await?;
            info!("Connected to PostgreSQL");
            if config.migrate_on_startup {
                info!("Running database migrations...");
                crate::migrations::run_postgres(store.pool()).await?;
                info!("Database migrations applied");
            } else {
                info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
            }
            AppState::new(Arc::new(store), evidence, notifier, metrics)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            AppState::new(Arc::new(InMemoryStore::new()), evidence, notifier, metrics)
        }
    };
    let state = match breakers {
        Some(breakers) => state.with_webhook_breakers(breakers),
        None => state,
    };

    let app = build_router(state, auth_state, &config)?
        .nest_service("/evidence", ServeDir::new(&config.evidence_dir));

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("courier-flow is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("courier-flow stopped");
    Ok(())
}

fn auth_state(config: &Config) -> anyhow::Result<AuthMiddlewareState> {
    let jwt = config.jwt_secret.as_ref().map(|secret| {
        Arc::new(JwtValidator::new(
            secret.as_bytes(),
            JwtValidator::DEFAULT_ISSUER,
            JwtValidator::DEFAULT_AUDIENCE,
        ))
    });

    if config.require_auth && jwt.is_none() {
        anyhow::bail!(
            "AUTH_MODE=required but JWT_SECRET is not set (set AUTH_MODE=disabled for local dev)"
        );
    }
    if !config.require_auth {
        warn!("AUTH_MODE=disabled: sessions are taken from x-actor-* headers");
    }

    let authenticator = Authenticator::new().trusting_headers(!config.require_auth);
    let authenticator = match jwt {
        Some(jwt) => authenticator.with_jwt(jwt),
        None => authenticator,
    };

    Ok(AuthMiddlewareState {
        authenticator: Arc::new(authenticator),
        require_auth: config.require_auth,
    })
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_thread_ids(true).init(),
    }
}

/// Assemble the application router. `/v1` routes sit behind the session
/// middleware; probes and metrics do not.
pub fn build_router(
    state: AppState,
    auth_state: AuthMiddlewareState,
    config: &Config,
) -> anyhow::Result<Router> {
    let v1 = api::router()
        .route("/v1/health/detailed", get(api::detailed_health_check))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            session_middleware,
        ));

    let mut router = Router::new()
        .merge(v1)
        .route("/health", get(api::health_check))
        .route("/ready", get(api::readiness_check))
        .route("/metrics", get(api::metrics_prometheus))
        .route("/metrics/json", get(api::metrics_json))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(config.cors_allow_origins.as_deref())? {
        router = router.layer(cors);
    }

    Ok(router.with_state(state))
}

fn cors_layer(origins: Option<&str>) -> anyhow::Result<Option<CorsLayer>> {
    let Some(origins) = origins.map(str::trim).filter(|o| !o.is_empty()) else {
        return Ok(None);
    };

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                HeaderName::from_static(SESSION_ID_HEADER),
                HeaderName::from_static(ACTOR_ID_HEADER),
                HeaderName::from_static(ACTOR_ROLE_HEADER),
            ]),
    ))
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
