use axum::Router;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::accounts::{AccountRecord, ApiCredential, CredentialStore, MemoryDirectory};
use crate::caller_config::MemoryCallerConfig;
use crate::claude::SystemPromptOverride;
use crate::config::RelayConfig;
use crate::error::{AppError, AppResult};
use crate::relay::{NoClaudeFamilyRelay, RelayService};
use crate::scheduler::UnifiedScheduler;
use crate::store::MemoryKvStore;
use crate::upstream::{GEMINI_PA_API_BASE, GEMINI_PUBLIC_API_BASE, GeminiClient};
use crate::usage::MetricsUsageSink;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub relay: Arc<RelayService>,
    pub credentials: Arc<dyn CredentialStore>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub config_path: Option<String>,
    pub public_api_base: String,
    pub pa_api_base: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            listen: env("GEMBRIDGE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            metrics_path: env("GEMBRIDGE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string()),
            config_path: env("GEMBRIDGE_CONFIG"),
            public_api_base: env("GEMBRIDGE_PUBLIC_API_BASE")
                .unwrap_or_else(|| GEMINI_PUBLIC_API_BASE.to_string()),
            pa_api_base: env("GEMBRIDGE_PA_API_BASE")
                .unwrap_or_else(|| GEMINI_PA_API_BASE.to_string()),
        }
    }
}

/// On-disk configuration: relay settings plus the seeded account pool,
/// groups, and caller credentials.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default)]
    pub groups: std::collections::HashMap<String, Vec<String>>,
    #[serde(default)]
    pub credentials: Vec<CredentialSeed>,
    #[serde(default)]
    pub global_system_prompt: Option<SystemPromptOverride>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialSeed {
    pub token: String,
    #[serde(flatten)]
    pub credential: ApiCredential,
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let file = match &runtime.config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| AppError::internal(format!("cannot read config {path}: {e}")))?;
            serde_json::from_str::<ConfigFile>(&raw)
                .map_err(|e| AppError::internal(format!("invalid config {path}: {e}")))?
        }
        None => ConfigFile::default(),
    };

    let directory = Arc::new(MemoryDirectory::new());
    for account in file.accounts {
        directory.insert_account(account);
    }
    for (group_id, members) in file.groups {
        directory.insert_group(&group_id, members);
    }
    for seed in file.credentials {
        directory.insert_credential(&seed.token, seed.credential);
    }
    let caller_config = Arc::new(MemoryCallerConfig::new());
    if let Some(prompt) = file.global_system_prompt {
        caller_config.set_global_prompt(prompt);
    }

    let config = file.relay.unwrap_or_default();
    let state = build_state(runtime, config, directory, caller_config)?;
    Ok(state)
}

/// Shared by the binary and the integration tests, which seed their own
/// directory and point the client at a local fake upstream.
pub fn build_state(
    runtime: RuntimeConfig,
    config: RelayConfig,
    directory: Arc<MemoryDirectory>,
    caller_config: Arc<MemoryCallerConfig>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    let store = Arc::new(MemoryKvStore::new());
    let scheduler = Arc::new(UnifiedScheduler::new(
        directory.clone(),
        directory.clone(),
        store,
        config.clone(),
    ));
    let client = GeminiClient::new(
        runtime.public_api_base.clone(),
        runtime.pa_api_base.clone(),
        config.request_timeout_ms,
    );
    let relay = Arc::new(RelayService {
        scheduler,
        accounts: directory.clone(),
        caller_config,
        usage: Arc::new(MetricsUsageSink),
        claude_relay: Arc::new(NoClaudeFamilyRelay),
        client,
        config,
    });

    Ok(AppState {
        runtime: Arc::new(runtime),
        relay,
        credentials: directory,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::new()
        .route("/v1/messages", post(create_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/health", get(health))
        .route(&metrics_path, get(metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> AppResult<ApiCredential> {
    let token = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .ok_or_else(|| AppError::unauthorized("missing api key"))?;

    state
        .credentials
        .authenticate(token)
        .await
        .ok_or_else(|| AppError::unauthorized("invalid api key"))
}

async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let credential = match authenticate(&state, &headers).await {
        Ok(credential) => credential,
        Err(err) => return err.into_response(),
    };
    match state.relay.handle_messages(&credential, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let credential = match authenticate(&state, &headers).await {
        Ok(credential) => credential,
        Err(err) => return err.into_response(),
    };
    state
        .relay
        .count_tokens(&credential, body)
        .await
        .into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}
