use crate::config::{TokenStoreBackend, WopiConfig};
use crate::handlers;
use crate::services::{
    DiscoveryClient, ExpiringStore, FileGateway, LocalStorage, MemoryStore, RedisStore, Storage,
    TokenPolicy, TokenStore,
};
use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    signature::{signature_validation_middleware, SignatureConfig, SignatureStore},
    tracing::{make_request_span, request_id_middleware},
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

const NONCE_KEY_PREFIX: &str = "wopi:nonce:";

#[derive(Clone)]
pub struct AppState {
    pub config: WopiConfig,
    pub kv: Arc<dyn ExpiringStore>,
    pub storage: Arc<dyn Storage>,
    pub tokens: TokenStore,
    pub gateway: Arc<FileGateway>,
    pub discovery: Arc<DiscoveryClient>,
    pub signature_config: SignatureConfig,
}

impl AsRef<SignatureConfig> for AppState {
    fn as_ref(&self) -> &SignatureConfig {
        &self.signature_config
    }
}

#[async_trait::async_trait]
impl SignatureStore for AppState {
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError> {
        // Nonces only need to outlive the window in which the timestamp is accepted.
        let ttl = (self.signature_config.max_clock_skew_seconds.max(1) * 2) as u64;
        self.kv
            .set_nx_ex(&format!("{}{}", NONCE_KEY_PREFIX, nonce), "1", ttl)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to record request nonce");
                AppError::ServiceUnavailable
            })
    }

    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError> {
        let security = &self.config.security;
        if client_id != security.signing_client_id {
            return Ok(None);
        }
        Ok(Some(security.signing_secret.expose_secret().clone()))
    }
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    pub async fn build(config: WopiConfig) -> Result<Self, AppError> {
        let kv: Arc<dyn ExpiringStore> = match config.token_store.backend {
            TokenStoreBackend::Redis => Arc::new(
                RedisStore::connect(&config.token_store.redis_url)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to Redis: {}", e);
                        AppError::InternalError(e)
                    })?,
            ),
            TokenStoreBackend::Memory => {
                tracing::warn!("Using in-memory token store; tokens are not shared between instances");
                Arc::new(MemoryStore::new())
            }
        };
        Self::build_with_store(config, kv).await
    }

    /// Build around an already constructed expiring store.
    pub async fn build_with_store(
        config: WopiConfig,
        kv: Arc<dyn ExpiringStore>,
    ) -> Result<Self, AppError> {
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(
                &config.storage.root,
                config.storage.max_file_size,
                config.storage.chunk_size,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    "Failed to initialize local storage at {}: {}",
                    config.storage.root,
                    e
                );
                AppError::InternalError(e.into())
            })?,
        );

        let tokens = TokenStore::new(
            kv.clone(),
            storage.clone(),
            TokenPolicy::from_seconds(config.token.ttl_seconds, config.token.expiry_grace_seconds),
        );
        let gateway = Arc::new(FileGateway::new(
            tokens.clone(),
            storage.clone(),
            config.retry_config(),
        ));
        let discovery = Arc::new(
            DiscoveryClient::new(&config.discovery).map_err(AppError::ConfigError)?,
        );

        let state = AppState {
            config: config.clone(),
            kv,
            storage,
            tokens,
            gateway,
            discovery,
            signature_config: SignatureConfig {
                require_signatures: config.security.require_signatures,
                ..Default::default()
            },
        };

        let router = build_router(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            token_store = ?config.token_store.backend,
            storage_root = %config.storage.root,
            editor_url = %config.discovery.editor_url,
            require_signatures = config.security.require_signatures,
            "WOPI service configured"
        );

        Ok(Self {
            port,
            listener,
            router,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Listening on {}", self.port);
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

pub fn build_router(state: AppState) -> Router {
    let max_upload = usize::try_from(state.config.storage.max_file_size).unwrap_or(usize::MAX);

    // Editor-host callbacks, authorised by the access token alone.
    let wopi = Router::new()
        .route("/wopi/files/:file_id", get(handlers::wopi::check_file_info))
        .route(
            "/wopi/files/:file_id/contents",
            get(handlers::wopi::get_file).post(handlers::wopi::put_file),
        );

    // Backend-facing control plane, signed when signatures are required.
    let control = Router::new()
        .route("/wopi/tokens", post(handlers::tokens::issue_token))
        .route("/wopi/tokens/revoke", post(handlers::tokens::revoke_token))
        .route("/wopi/sessions", post(handlers::tokens::create_session))
        .route(
            "/wopi/documents",
            post(handlers::documents::create_document).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/wopi/discovery", get(handlers::discovery::discovery_map))
        .route_layer(from_fn_with_state(
            state.clone(),
            signature_validation_middleware::<AppState>,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .merge(wopi)
        .merge(control)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<axum::body::Body>))
        // Outermost, so the span above already sees the minted id.
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}
