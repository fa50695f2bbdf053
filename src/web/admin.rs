use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use tracing::info;

use super::error::{ApiError, ApiResult};
use super::ApiState;
use crate::stream::{StreamConfig, StreamMetrics, StreamPatch, StreamStatus};

/// 获取系统状态 API
/// 返回系统的内存、负载信息以及当前活跃的推流数量
pub async fn sys_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info()
        .map(|m| (m.total, m.avail))
        .unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "active_streams": state.supervisor.active_count(),
    }))
}

/// 获取所有推流配置 (包括已停止的)
pub async fn list_streams(State(state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
    let records = state.supervisor.list_all().await?;
    Ok(Json(json!({ "streams": records })))
}

/// 新增推流 API，失败时自动重试
pub async fn create_stream(
    State(state): State<ApiState>,
    Json(config): Json<StreamConfig>,
) -> ApiResult<(StatusCode, Json<StreamStatus>)> {
    if config.id.trim().is_empty() {
        return Err(ApiError::bad_request("Stream id must not be empty"));
    }

    info!(stream_id = %config.id, "API: add stream");
    let status = state
        .supervisor
        .add_with_retry(config, state.add_attempts)
        .await?;
    Ok((StatusCode::CREATED, Json(status)))
}

/// 批量导入推流，逐个返回结果
pub async fn batch_import(
    State(state): State<ApiState>,
    Json(configs): Json<Vec<StreamConfig>>,
) -> Json<serde_json::Value> {
    info!("API: batch import {} streams", configs.len());

    let results: Vec<_> = state
        .supervisor
        .add_batch(configs)
        .await
        .into_iter()
        .map(|(id, result)| match result {
            Ok(status) => json!({ "id": id, "status": "success", "state": status.state }),
            Err(e) => json!({ "id": id, "status": "error", "message": e.to_string() }),
        })
        .collect();

    Json(json!({ "status": "success", "results": results }))
}

/// 更新推流配置并重新启动
pub async fn update_stream(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<StreamPatch>,
) -> ApiResult<Json<StreamStatus>> {
    info!(stream_id = %id, "API: update stream");
    let status = state.supervisor.update(&id, patch).await?;
    Ok(Json(status))
}

/// 停止推流
pub async fn stop_stream(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    info!(stream_id = %id, "API: stop stream");
    state.supervisor.stop(&id).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Stream [{}] stopped", id),
    })))
}

pub async fn restart_stream(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    info!(stream_id = %id, "API: restart stream");
    let status = state.supervisor.restart(&id).await?;
    Ok(Json(status))
}

pub async fn stream_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    let status = state.supervisor.status(&id).await?;
    Ok(Json(status))
}

/// 单路推流的运行指标 (帧率、码率、CPU、内存)
pub async fn stream_metrics(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamMetrics>> {
    let metrics = state.supervisor.metrics(&id).await?;
    Ok(Json(metrics))
}
