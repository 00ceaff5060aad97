use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Json, Request};
use axum::routing::{delete, get, post};
use axum::Router;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::{instrument, Level};

use crate::auth::{require_admin_key, AdminAuth};
use crate::clock::Clock;
use crate::config_parser::Config;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::llm::LlmProvider;
use crate::pipeline::ChatPipeline;
use crate::rate_limit::{rate_limit_middleware, EndpointClass, RateLimitLayerState, RateLimiter};
use crate::session_memory::SessionMemoryCache;
use crate::storage::StoreConnectionInfo;
use crate::usage_limit::TokenLedger;

/// State for the gateway
#[derive(Clone, Debug)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub store: StoreConnectionInfo,
    pub clock: Clock,
    pub rate_limiter: Arc<RateLimiter>,
    pub ledger: Arc<TokenLedger>,
    pub session_memory: Arc<SessionMemoryCache>,
    pub llm: Arc<LlmProvider>,
    pub pipeline: Arc<ChatPipeline>,
    pub admin_auth: AdminAuth,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Open the configured database and wire every component against the system clock
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = setup_http_client()?;
        let store = StoreConnectionInfo::new_sqlite(&config.storage.database_path).await?;
        let llm = LlmProvider::new(&config.llm, http_client.clone());
        Ok(Self::from_components(
            config,
            http_client,
            store,
            llm,
            Clock::System,
        ))
    }

    pub fn from_components(
        config: Arc<Config>,
        http_client: Client,
        store: StoreConnectionInfo,
        llm: LlmProvider,
        clock: Clock,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::new(config.rate_limits.clone()),
            clock.clone(),
        ));
        let ledger = Arc::new(TokenLedger::new(
            store.clone(),
            Arc::new(config.usage_limits.clone()),
            clock.clone(),
        ));
        let session_memory = Arc::new(SessionMemoryCache::new(
            store.clone(),
            config.session_memory.clone(),
            clock.clone(),
        ));
        let llm = Arc::new(llm);
        let pipeline = Arc::new(ChatPipeline::new(
            rate_limiter.clone(),
            ledger.clone(),
            session_memory.clone(),
            llm.clone(),
            store.clone(),
            clock.clone(),
            config.llm.default_model.clone(),
            config.llm.system_prompt.clone(),
        ));
        let admin_auth = AdminAuth::new(config.gateway.admin_api_key.as_ref());

        Self {
            config,
            http_client,
            store,
            clock,
            rate_limiter,
            ledger,
            session_memory,
            llm,
            pipeline,
            admin_auth,
        }
    }
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

/// Outer bound on any upstream call. Per-request timeouts are set by the provider.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

fn rate_limited<S: Clone + Send + Sync + 'static>(
    routes: Router<S>,
    limiter: &Arc<RateLimiter>,
    class: EndpointClass,
) -> Router<S> {
    routes.layer(axum::middleware::from_fn_with_state(
        RateLimitLayerState::new(limiter.clone(), class),
        rate_limit_middleware,
    ))
}

/// Every route of the gateway. `/chat` is rate limited inside the pipeline.
pub fn build_router(app_state: AppStateData) -> Router {
    let chat_routes = Router::new().route("/chat", post(endpoints::chat::chat_handler));

    let read_routes = rate_limited(
        Router::new()
            .route("/usage/{user_id}", get(endpoints::usage::usage_summary_handler))
            .route(
                "/sessions/{user_id}/snapshot",
                get(endpoints::sessions::snapshot_handler),
            ),
        &app_state.rate_limiter,
        EndpointClass::Default,
    );

    let session_routes = rate_limited(
        Router::new().route(
            "/sessions/{user_id}/cache",
            delete(endpoints::sessions::invalidate_user_handler),
        ),
        &app_state.rate_limiter,
        EndpointClass::Auth,
    );

    // Rate limiting runs before the key check so that guessing is throttled too
    let admin_routes = rate_limited(
        Router::new()
            .route(
                "/admin/usage/reset",
                post(endpoints::usage::reset_usage_handler),
            )
            .route(
                "/admin/sessions/cache",
                delete(endpoints::sessions::clear_cache_handler),
            )
            .layer(axum::middleware::from_fn_with_state(
                app_state.admin_auth.clone(),
                require_admin_key,
            )),
        &app_state.rate_limiter,
        EndpointClass::Auth,
    );

    let public_routes = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler));

    Router::new()
        .merge(chat_routes)
        .merge(read_routes)
        .merge(session_routes)
        .merge(admin_routes)
        .merge(public_routes)
        .fallback(endpoints::fallback::handle_404)
        // We log failed requests messages at 'DEBUG', since we already have our own error-logging code
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}
