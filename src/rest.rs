/*!
dataset-explorer REST API Server

Serves configured data sets to a browser front end: query initialization, previews,
counts, distributions, autocomplete, CSV export and saved queries.

## Usage

```bash
dsx-rest --config data_sets.toml --host 127.0.0.1 --port 3334
```

## Endpoints

- `GET /api/v1/health` - Health check
- `GET /api/v1/version` - Version information
- `GET /api/v1/data-sets` - Id and name of every data set
- `POST /api/v1/query/initialize` - Sanitized query, columns and row count
- `POST /api/v1/query/preview` - One page of rendered rows
- `POST /api/v1/query/row-count` - Rows matching all filters
- `POST /api/v1/query/filter-row-count/:pos` - Rows matching one filter
- `POST /api/v1/query/distribution/:pos` - Distribution of a column
- `POST /api/v1/query/sql` - SQL statement of a query
- `GET /api/v1/data-sets/:id/auto-complete` - Values of a text column
- `POST /api/v1/data-sets/:id/csv` - CSV export
- `POST /api/v1/query/save` - Save a query
- `GET /api/v1/data-sets/:id/queries` - Saved queries of a data set
- `DELETE /api/v1/data-sets/:id/queries/:query_id` - Delete a saved query
*/

use axum::{
    body::Body,
    extract::{Path, Query as UrlQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dataset_explorer::export::{
    cancellation_pair, csv_file_name, export_csv, CancellationHandle, CsvOptions,
};
use dataset_explorer::query::{QueryStore, QuerySummary};
use dataset_explorer::{
    Column, Config, DataSetRegistry, Distribution, ExplorerError, Query, QueryDict, Value,
    VERSION,
};

/// CLI arguments for the REST API server
#[derive(Parser)]
#[command(name = "dsx-rest")]
#[command(about = "dataset-explorer REST API Server")]
#[command(version = VERSION)]
struct Cli {
    /// Configuration file describing connections and data sets
    #[arg(long, default_value = "data_sets.toml")]
    config: PathBuf,

    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind to
    #[arg(long, default_value = "3334")]
    port: u16,

    /// CORS allowed origins (comma-separated)
    #[arg(long, default_value = "*")]
    cors_origin: String,

    /// Show personal data instead of redacting it
    #[arg(long, default_value = "false")]
    show_personal_data: bool,

    /// Discover the schema of every data set before accepting requests
    #[arg(long, default_value = "false")]
    preload: bool,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    registry: Arc<DataSetRegistry>,
    store: Option<Arc<dyn QueryStore>>,
    redact: bool,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for /api/v1/query/initialize
#[derive(Debug, Deserialize)]
struct InitializeRequest {
    data_set_id: String,
    /// Id of a saved query to start from
    #[serde(default)]
    query_id: Option<String>,
    /// Query in its wire form; wins over `query_id`
    #[serde(default)]
    query: Option<QueryDict>,
}

/// Request body of every endpoint working on one query
#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: QueryDict,
}

/// Request body for /api/v1/query/preview
#[derive(Debug, Deserialize)]
struct PreviewRequest {
    query: QueryDict,
    #[serde(default = "default_limit")]
    limit: u64,
    #[serde(default)]
    offset: u64,
}

fn default_limit() -> u64 {
    20
}

/// Request body for /api/v1/data-sets/:id/csv
#[derive(Debug, Deserialize)]
struct CsvRequest {
    query: QueryDict,
    #[serde(default = "default_delimiter")]
    delimiter: char,
    #[serde(default = "default_decimal_mark")]
    decimal_mark: char,
}

fn default_delimiter() -> char {
    ','
}

fn default_decimal_mark() -> char {
    '.'
}

/// Request body for /api/v1/query/save
#[derive(Debug, Deserialize)]
struct SaveRequest {
    query: QueryDict,
    /// Falls back to the `x-user` header
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AutocompleteParams {
    column: String,
    #[serde(default)]
    term: String,
}

/// Successful API response
#[derive(Debug, Serialize)]
struct ApiSuccess<T> {
    status: String,
    data: T,
}

/// Error API response
#[derive(Debug, Serialize)]
struct ApiError {
    status: String,
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Serialize)]
struct DataSetInfo {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct InitializeResult {
    name: String,
    query: QueryDict,
    columns: Vec<Column>,
    personal_data_columns: Vec<String>,
    row_count: i64,
}

#[derive(Debug, Serialize)]
struct PreviewResult {
    column_names: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct SqlResult {
    sql: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Version response
#[derive(Debug, Serialize)]
struct VersionResponse {
    version: String,
    features: Vec<String>,
}

type ApiResult<T> = Result<Json<ApiSuccess<T>>, ApiErrorResponse>;

fn success<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiSuccess {
        status: "success".to_string(),
        data,
    }))
}

// ============================================================================
// Error Handling
// ============================================================================

/// Custom error type for API responses
struct ApiErrorResponse {
    status: StatusCode,
    error: ApiError,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let json = Json(self.error);
        (self.status, json).into_response()
    }
}

impl From<ExplorerError> for ApiErrorResponse {
    fn from(err: ExplorerError) -> Self {
        let (status, error_type) = match &err {
            ExplorerError::UnknownDataSet(_) => (StatusCode::NOT_FOUND, "UnknownDataSet"),
            ExplorerError::UnknownQuery { .. } => (StatusCode::NOT_FOUND, "UnknownQuery"),
            ExplorerError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "PermissionDenied"),
            ExplorerError::ValidationError(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
            ExplorerError::UnsupportedColumnType { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "UnsupportedColumnType")
            }
            ExplorerError::ReaderError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ReaderError"),
            ExplorerError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ExplorerError::ExportError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ExportError"),
            ExplorerError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "Cancelled"),
            ExplorerError::InternalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        };

        if status.is_server_error() {
            warn!("{}", err);
        }

        ApiErrorResponse {
            status,
            error: ApiError {
                status: "error".to_string(),
                error: ErrorDetails {
                    message: err.to_string(),
                    error_type: error_type.to_string(),
                },
            },
        }
    }
}

/// Run backend work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T, ApiErrorResponse>
where
    F: FnOnce() -> dataset_explorer::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ExplorerError::InternalError(format!("Worker failed: {}", e)))?
        .map_err(ApiErrorResponse::from)
}

impl AppState {
    fn store(&self) -> Result<Arc<dyn QueryStore>, ApiErrorResponse> {
        self.store.clone().ok_or_else(|| {
            ExplorerError::ConfigError("No saved-query store configured".to_string()).into()
        })
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/data-sets
async fn data_sets_handler(State(state): State<AppState>) -> ApiResult<Vec<DataSetInfo>> {
    success(
        state
            .registry
            .iter()
            .map(|ds| DataSetInfo {
                id: ds.id.clone(),
                name: ds.name.clone(),
            })
            .collect(),
    )
}

/// POST /api/v1/query/initialize
async fn initialize_handler(
    State(state): State<AppState>,
    Json(request): Json<InitializeRequest>,
) -> ApiResult<InitializeResult> {
    let result = blocking(move || {
        let registry = &state.registry;
        let query = match (request.query, request.query_id) {
            (Some(mut dict), _) => {
                dict.data_set_id = request.data_set_id;
                Query::from_dict(registry, dict)?
            }
            (None, Some(query_id)) if !query_id.is_empty() => match &state.store {
                Some(store) => store.load(registry, &request.data_set_id, &query_id)?,
                None => Query::new(registry, &request.data_set_id)?,
            },
            (None, _) => Query::new(registry, &request.data_set_id)?,
        };

        let data_set = query.data_set();
        let columns: Vec<Column> = data_set.columns()?.iter().cloned().collect();
        let personal_data_columns = columns
            .iter()
            .filter(|c| data_set.is_personal_data(&c.name))
            .map(|c| c.name.clone())
            .collect();
        Ok(InitializeResult {
            name: data_set.name.clone(),
            query: query.to_dict(),
            columns,
            personal_data_columns,
            row_count: query.row_count()?,
        })
    })
    .await?;
    success(result)
}

/// POST /api/v1/query/preview
///
/// Custom renderers apply to every cell that is neither NULL nor redacted.
async fn preview_handler(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<PreviewResult> {
    let redact = state.redact;
    let result = blocking(move || {
        let query = Query::from_dict(&state.registry, request.query)?;
        let result = query.run(Some(request.limit), Some(request.offset), redact)?;
        let data_set = query.data_set();

        let rows = result
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&result.column_names)
                    .map(|(value, column)| {
                        let redacted = redact && data_set.is_personal_data(column);
                        match data_set.renderer(column) {
                            Some(renderer) if !redacted && !value.is_null() => {
                                Value::Text(renderer.render(&value))
                            }
                            _ => value,
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(PreviewResult {
            column_names: result.column_names,
            rows,
        })
    })
    .await?;
    success(result)
}

/// POST /api/v1/query/row-count
async fn row_count_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<i64> {
    let count = blocking(move || Query::from_dict(&state.registry, request.query)?.row_count())
        .await?;
    success(count)
}

/// POST /api/v1/query/filter-row-count/:pos
async fn filter_row_count_handler(
    State(state): State<AppState>,
    Path(pos): Path<usize>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<i64> {
    let count = blocking(move || {
        Query::from_dict(&state.registry, request.query)?.filter_row_count(pos)
    })
    .await?;
    success(count)
}

/// POST /api/v1/query/distribution/:pos
async fn distribution_handler(
    State(state): State<AppState>,
    Path(pos): Path<usize>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Distribution> {
    let redact = state.redact;
    let distribution = blocking(move || {
        Query::from_dict(&state.registry, request.query)?.distribution_at(pos, redact)
    })
    .await?;
    success(distribution)
}

/// POST /api/v1/query/sql
async fn sql_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<SqlResult> {
    let redact = state.redact;
    let sql = blocking(move || {
        Query::from_dict(&state.registry, request.query)?.display_sql(redact)
    })
    .await?;
    success(SqlResult { sql })
}

/// GET /api/v1/data-sets/:id/auto-complete
async fn autocomplete_handler(
    State(state): State<AppState>,
    Path(data_set_id): Path<String>,
    UrlQuery(params): UrlQuery<AutocompleteParams>,
) -> ApiResult<Vec<String>> {
    let redact = state.redact;
    let values = blocking(move || {
        state
            .registry
            .get(&data_set_id)?
            .autocomplete_text_column(&params.column, &params.term, redact)
    })
    .await?;
    success(values)
}

/// Forwards CSV bytes from the export thread to the response body
struct ChannelWriter {
    sender: mpsc::Sender<std::io::Result<Vec<u8>>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sender.blocking_send(Ok(buf.to_vec())).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Client went away")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Cancels the export when the response body is dropped
struct CancelOnDrop(CancellationHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// POST /api/v1/data-sets/:id/csv
async fn csv_handler(
    State(state): State<AppState>,
    Path(data_set_id): Path<String>,
    Json(request): Json<CsvRequest>,
) -> Result<Response, ApiErrorResponse> {
    let delimiter = u8::try_from(request.delimiter).map_err(|_| {
        ExplorerError::ValidationError("The delimiter must be a single ASCII character".into())
    })?;
    if request.decimal_mark != '.' && request.decimal_mark != ',' {
        return Err(ExplorerError::ValidationError(format!(
            "Unsupported decimal mark '{}'",
            request.decimal_mark
        ))
        .into());
    }
    let options = CsvOptions {
        delimiter,
        decimal_mark: request.decimal_mark,
        redact_personal_data: state.redact,
    };

    let registry = Arc::clone(&state.registry);
    let mut dict = request.query;
    dict.data_set_id = data_set_id;
    let query = blocking(move || Query::from_dict(&registry, dict)).await?;
    let file_name = csv_file_name(
        &query.data_set().id,
        query.query_id(),
        chrono::Local::now().date_naive(),
    );

    let (sender, receiver) = mpsc::channel(16);
    let (token, handle) = cancellation_pair();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = export_csv(&query, ChannelWriter { sender }, options, &token) {
            warn!("CSV export of data set '{}' stopped: {}", query.data_set().id, e);
        }
    });

    let stream = futures_util::stream::unfold(
        (receiver, CancelOnDrop(handle)),
        |(mut receiver, guard)| async move {
            receiver
                .recv()
                .await
                .map(|chunk| (chunk, (receiver, guard)))
        },
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// POST /api/v1/query/save
async fn save_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SaveRequest>,
) -> ApiResult<QueryDict> {
    let store = state.store()?;
    let user = request
        .user
        .or_else(|| {
            headers
                .get("x-user")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "anonymous".to_string());

    let saved = blocking(move || {
        let query = Query::from_dict(&state.registry, request.query)?;
        if query.query_id().is_empty() {
            return Err(ExplorerError::ValidationError(
                "A saved query needs an id".to_string(),
            ));
        }
        store.save(&query, &user, chrono::Local::now().naive_local())?;
        store
            .load(&state.registry, &query.data_set().id, query.query_id())
            .map(|q| q.to_dict())
    })
    .await?;
    success(saved)
}

/// GET /api/v1/data-sets/:id/queries
async fn list_queries_handler(
    State(state): State<AppState>,
    Path(data_set_id): Path<String>,
) -> ApiResult<Vec<QuerySummary>> {
    let store = state.store()?;
    let summaries = blocking(move || {
        state.registry.get(&data_set_id)?;
        store.list(&data_set_id)
    })
    .await?;
    success(summaries)
}

/// DELETE /api/v1/data-sets/:id/queries/:query_id
async fn delete_query_handler(
    State(state): State<AppState>,
    Path((data_set_id, query_id)): Path<(String, String)>,
) -> ApiResult<()> {
    let store = state.store()?;
    blocking(move || store.delete(&data_set_id, &query_id)).await?;
    success(())
}

/// GET /api/v1/health - Health check
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: VERSION.to_string(),
    })
}

/// GET /api/v1/version - Version information
async fn version_handler() -> Json<VersionResponse> {
    let mut features = vec!["duckdb".to_string()];

    #[cfg(feature = "postgres")]
    features.push("postgres".to_string());

    Json(VersionResponse {
        version: VERSION.to_string(),
        features,
    })
}

/// Root handler
async fn root_handler() -> &'static str {
    "dataset-explorer REST API Server - See /api/v1/health for status"
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dsx_rest=info,dataset_explorer=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    let registry = config.build_registry()?;
    if cli.preload {
        info!("Discovering the schema of {} data sets", registry.len());
        registry.preload()?;
    }
    let store: Option<Arc<dyn QueryStore>> = match config.open_query_store()? {
        Some(store) => Some(Arc::new(store)),
        None => {
            info!("No saved-query store configured");
            None
        }
    };
    if cli.show_personal_data {
        warn!("Personal data is shown unredacted");
    }

    let state = AppState {
        registry: Arc::new(registry),
        store,
        redact: !cli.show_personal_data,
    };

    // Configure CORS
    let cors = if cli.cors_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    } else {
        let origins: Vec<_> = cli
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    };

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/version", get(version_handler))
        .route("/api/v1/data-sets", get(data_sets_handler))
        .route("/api/v1/query/initialize", post(initialize_handler))
        .route("/api/v1/query/preview", post(preview_handler))
        .route("/api/v1/query/row-count", post(row_count_handler))
        .route(
            "/api/v1/query/filter-row-count/:pos",
            post(filter_row_count_handler),
        )
        .route("/api/v1/query/distribution/:pos", post(distribution_handler))
        .route("/api/v1/query/sql", post(sql_handler))
        .route("/api/v1/query/save", post(save_handler))
        .route(
            "/api/v1/data-sets/:id/auto-complete",
            get(autocomplete_handler),
        )
        .route("/api/v1/data-sets/:id/csv", post(csv_handler))
        .route("/api/v1/data-sets/:id/queries", get(list_queries_handler))
        .route(
            "/api/v1/data-sets/:id/queries/:query_id",
            delete(delete_query_handler),
        )
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;

    info!("Starting dataset-explorer REST API server on {}", addr);
    info!("Serving {} data sets", config.data_sets.len());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
