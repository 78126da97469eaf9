use crate::error::{ExportError, FailureKind, LedgerError, PoolError};
use crate::models::ExportKind;
use crate::worker::{ExportJob, ExportPool, IngestJob, IngestPool, MetricsSnapshot, PoolState};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Json, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const SUBMITTER: &str = "api";
const USER_ID_HEADER: &str = "x-user-id";
const ROW_COUNT_HEADER: &str = "x-row-count";

/// NF-e 上传上限 10 MB
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// 共享状态: 两个工作池
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestPool>,
    pub export: Arc<ExportPool>,
}

/// 路由表
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/nfes/upload",
            post(upload_nfe).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/nfes/:access_key/process", post(process_pending))
        .route("/api/exports/:kind", post(create_export))
        .route("/api/pools/metrics", get(pool_metrics))
        .with_state(state)
}

/// 响应体
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn respond(status: StatusCode, message: String, data: Option<Value>) -> Response {
    let response = ApiResponse {
        success: status.is_success(),
        message,
        data,
    };
    (status, Json(response)).into_response()
}

fn error(status: StatusCode, e: impl std::fmt::Display) -> Response {
    respond(status, format!("Error: {}", e), None)
}

/// 排队/停机类错误统一为 503
fn pool_unavailable(e: PoolError) -> Response {
    error(StatusCode::SERVICE_UNAVAILABLE, e)
}

/// 上传者 ID (可选请求头)
fn submitter_id(headers: &HeaderMap) -> Option<i32> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 上传 NF-e XML, 同步等待入库结果
pub async fn upload_nfe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return error(StatusCode::BAD_REQUEST, "empty upload");
    }

    let pool = &state.ingest;
    let mut job = IngestJob::new(body.to_vec(), SUBMITTER);
    if let Some(user_id) = submitter_id(&headers) {
        job = job.with_submitter_id(user_id);
    }

    let result = match pool.submit_sync(job, pool.sync_timeout()).await {
        Ok(result) => result,
        Err(e) => return pool_unavailable(e),
    };
    let data = serde_json::to_value(&result).ok();

    if result.success {
        let message = if result.duplicate {
            format!("Invoice {} already processed", result.invoice_key)
        } else {
            format!("Invoice {} processed, {} items", result.invoice_key, result.item_count)
        };
        return respond(StatusCode::OK, message, data);
    }

    let error = result.error.clone().unwrap_or_default();
    match result.failure {
        Some(FailureKind::Parse) => {
            respond(StatusCode::BAD_REQUEST, format!("Error: {}", error), data)
        }
        _ => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Error processing invoice {} ({} items): {}",
                result.invoice_key, result.item_count, error
            ),
            data,
        ),
    }
}

/// 重新处理停留在 PENDING 的发票
pub async fn process_pending(
    State(state): State<AppState>,
    Path(access_key): Path<String>,
) -> Response {
    match state.ingest.handler().retry_pending(&access_key).await {
        Ok(outcome) => {
            let message = if outcome.duplicate {
                format!("Invoice {} already processed", outcome.access_key)
            } else {
                format!("Invoice {} processed, {} items", outcome.access_key, outcome.item_count)
            };
            respond(StatusCode::OK, message, None)
        }
        Err(e @ LedgerError::NotFound(_)) => error(StatusCode::NOT_FOUND, e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// 生成 CSV 导出并以附件形式返回, 发送完毕后删除文件
pub async fn create_export(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(filters): Json<HashMap<String, String>>,
) -> Response {
    let kind = match kind.parse::<ExportKind>() {
        Ok(kind) => kind,
        Err(e @ ExportError::UnknownKind(_)) => return error(StatusCode::BAD_REQUEST, e),
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let pool = &state.export;
    let result = match pool
        .submit_sync(ExportJob::new(kind, filters, SUBMITTER), pool.sync_timeout())
        .await
    {
        Ok(result) => result,
        Err(e) => return pool_unavailable(e),
    };

    if !result.success {
        let status = match result.failure {
            Some(FailureKind::Parse) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = format!("Error: {}", result.error.clone().unwrap_or_default());
        return respond(status, message, serde_json::to_value(&result).ok());
    }

    let path = PathBuf::from(&result.file_path);
    match stream_export(path, &result.file_name, result.row_count).await {
        Ok(response) => response,
        Err(e) => {
            warn!(file = %result.file_path, error = %e, "failed to open export file");
            error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// 响应体释放时删除文件 (发送完成或客户端断开)
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!(file = %self.0.display(), "export file removed"),
            Err(e) => warn!(file = %self.0.display(), error = %e, "failed to remove export file"),
        }
    }
}

async fn stream_export(
    path: PathBuf,
    file_name: &str,
    row_count: usize,
) -> std::io::Result<Response> {
    let file = tokio::fs::File::open(&path).await?;
    let cleanup = RemoveOnDrop(path);
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _guard = &cleanup;
        chunk
    });

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
        (header::HeaderName::from_static(ROW_COUNT_HEADER), row_count.to_string()),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub name: &'static str,
    pub state: PoolState,
    pub workers: usize,
    pub queue_capacity: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct PoolsResponse {
    pub nfe: PoolStatus,
    pub export: PoolStatus,
}

/// 工作池计数
pub async fn pool_metrics(State(state): State<AppState>) -> Json<PoolsResponse> {
    Json(PoolsResponse {
        nfe: PoolStatus {
            name: state.ingest.name(),
            state: state.ingest.state(),
            workers: state.ingest.workers(),
            queue_capacity: state.ingest.queue_capacity(),
            metrics: state.ingest.metrics(),
        },
        export: PoolStatus {
            name: state.export.name(),
            state: state.export.state(),
            workers: state.export.workers(),
            queue_capacity: state.export.queue_capacity(),
            metrics: state.export.metrics(),
        },
    })
}
