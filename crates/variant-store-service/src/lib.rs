//! HTTP surface of the variant store.
//!
//! `GET /variants` always answers 200 with a [`VariantResponse`]; failures are
//! reported through its `success` and `error` fields.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use variant_store_core::{
    QueryDescriptor, QueryError, QueryParams, Stage, VariantPage, VariantReader, VariantResponse,
    VariantSource,
};
use variant_store_sqlite::SqliteVariantStore;

pub const SERVICE_BANNER: &str = "Simple variant store API";

const ROUTE_TEMPLATES: [&str; 4] = ["/", "/health", "/variants", "/variants/:variant_id"];

#[derive(Debug, Clone, Parser)]
#[command(name = "variant-store")]
#[command(about = "Read-only HTTP query service over a genomic variant table")]
pub struct Args {
    #[arg(long, default_value = "./variants.sqlite3")]
    pub db: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    pub operation_timeout_ms: u64,
    #[arg(long, default_value_t = 5)]
    pub connect_attempts: u32,
    #[arg(long, default_value_t = 1000)]
    pub connect_retry_delay_ms: u64,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Clone)]
pub struct ServiceState {
    source: Arc<dyn VariantSource>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    parsing_error_total: AtomicU64,
    count_error_total: AtomicU64,
    fetch_error_total: AtomicU64,
    no_match_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct ServiceTelemetrySnapshot {
    pub requests_total: u64,
    pub requests_success_total: u64,
    pub requests_failure_total: u64,
    pub timeout_total: u64,
    pub parsing_error_total: u64,
    pub count_error_total: u64,
    pub fetch_error_total: u64,
    pub no_match_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

impl ServiceState {
    #[must_use]
    pub fn new(source: Arc<dyn VariantSource>, operation_timeout: Duration) -> Self {
        Self { source, operation_timeout, telemetry: Arc::new(ServiceTelemetry::default()) }
    }

    #[must_use]
    pub fn telemetry(&self) -> ServiceTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Validates `params`, then runs the count and fetch phases as two
    /// separately bounded blocking operations.
    ///
    /// # Errors
    /// Whatever stage fails first, as a [`QueryError`].
    pub async fn query_variants(&self, params: &QueryParams) -> Result<VariantPage, QueryError> {
        let query = QueryDescriptor::from_params(params)?;
        let count_query = query.clone();
        let total = self.run_phase(Stage::Count, move |reader| reader.count(&count_query)).await?;
        let variants =
            self.run_phase(Stage::Fetch, move |reader| reader.fetch(&query, total)).await?;
        Ok(VariantPage { total, variants })
    }

    async fn run_phase<T, F>(&self, stage: Stage, op: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: for<'r> FnOnce(VariantReader<'r, dyn VariantSource>) -> Result<T, QueryError>
            + Send
            + 'static,
    {
        let source = Arc::clone(&self.source);
        let deadline = Instant::now().checked_add(self.operation_timeout);
        let handle = tokio::task::spawn_blocking(move || {
            let reader = VariantReader::new(source.as_ref());
            match deadline {
                Some(deadline) => op(reader.with_deadline(deadline)),
                None => op(reader),
            }
        });

        match tokio::time::timeout(self.operation_timeout, handle).await {
            Err(_) => Err(self.timed_out(stage)),
            Ok(Err(err)) => Err(QueryError::store(
                stage,
                format!("{} join failure: {err}", stage.as_str()),
            )),
            // The reader gave up on its own deadline before the timer fired.
            Ok(Ok(Err(QueryError::Store { .. })))
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) =>
            {
                Err(self.timed_out(stage))
            }
            Ok(Ok(result)) => result,
        }
    }

    fn timed_out(&self, stage: Stage) -> QueryError {
        self.telemetry.timeout_total.fetch_add(1, Ordering::Relaxed);
        QueryError::store(
            stage,
            format!("{} timed out after {} ms", stage.as_str(), self.operation_timeout.as_millis()),
        )
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, err: &QueryError) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if matches!(err, QueryError::NoMatches { .. }) {
            self.no_match_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match err.stage() {
            Stage::Parsing => &self.parsing_error_total,
            Stage::Count => &self.count_error_total,
            Stage::Fetch => &self.fetch_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            parsing_error_total: self.parsing_error_total.load(Ordering::Relaxed),
            count_error_total: self.count_error_total.load(Ordering::Relaxed),
            fetch_error_total: self.fetch_error_total.load(Ordering::Relaxed),
            no_match_total: self.no_match_total.load(Ordering::Relaxed),
        }
    }
}

pub fn app(state: ServiceState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/variants", get(list_variants))
        .route("/variants/:variant_id", get(show_variant))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn index() -> String {
    let mut body = format!("{SERVICE_BANNER}\n");
    for template in ROUTE_TEMPLATES {
        body.push_str(template);
        body.push('\n');
    }
    body
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse { status: "ok", timeout_ms, telemetry: state.telemetry.snapshot() })
}

async fn list_variants(
    State(state): State<ServiceState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Json<VariantResponse> {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);

    let result = match query {
        Ok(Query(pairs)) => {
            let params: QueryParams = pairs.into_iter().collect();
            state.query_variants(&params).await
        }
        Err(rejection) => Err(QueryError::MalformedQuery(rejection.body_text())),
    };

    let response = match result {
        Ok(page) => {
            state.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
            VariantResponse::from_page(page)
        }
        Err(err) => {
            state.telemetry.record_failure(&err);
            warn!(stage = err.stage().as_str(), error = %err, "variant query failed");
            VariantResponse::from_error(&err)
        }
    };
    Json(response)
}

async fn show_variant(Path(variant_id): Path<String>) -> String {
    format!("variant: {variant_id}\n")
}

/// Opens the store read-only and checks it answers with the expected schema,
/// retrying up to `attempts` times.
///
/// # Errors
/// The last connection error once every attempt has failed.
pub async fn connect_with_retry(
    db: &FsPath,
    attempts: u32,
    delay: Duration,
) -> Result<SqliteVariantStore> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let path = db.to_path_buf();
        let result = tokio::task::spawn_blocking(move || open_verified(&path))
            .await
            .context("variant store connection task failed")?;

        match result {
            Ok(store) => {
                info!(attempt, db = %db.display(), "connected to variant store");
                return Ok(store);
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(attempt, attempts, error = %message, "variant store connection failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow!("no connection attempt was made"))
        .context(format!("variant store unreachable after {attempts} attempt(s)")))
}

fn open_verified(path: &FsPath) -> Result<SqliteVariantStore> {
    let store = SqliteVariantStore::open_read_only(path)?;
    store.ping()?;
    store.verify_schema()?;
    Ok(store)
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over `level`.
///
/// # Errors
/// When `level` is not a valid filter or a subscriber is already installed.
pub fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{level}'"))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Connects to the store, then serves until the listener fails.
///
/// # Errors
/// When the store stays unreachable or the listener cannot bind.
pub async fn serve(args: Args) -> Result<()> {
    let store = connect_with_retry(
        &args.db,
        args.connect_attempts,
        Duration::from_millis(args.connect_retry_delay_ms),
    )
    .await?;

    let state =
        ServiceState::new(Arc::new(store), Duration::from_millis(args.operation_timeout_ms));
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "variant store listening");
    axum::serve(listener, app(state)).await.context("http server failed")?;
    Ok(())
}
