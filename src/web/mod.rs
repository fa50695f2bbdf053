pub mod admin;
pub mod error;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::supervisor::Supervisor;

/// HTTP 处理函数共享的状态
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    /// 新增推流时的最大尝试次数
    pub add_attempts: u32,
}

/// 注册 HTTP 路由
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route(
            "/streams",
            get(admin::list_streams).post(admin::create_stream),
        )
        .route("/streams/batch", post(admin::batch_import)) // 批量导入
        .route(
            "/streams/:id",
            put(admin::update_stream).delete(admin::stop_stream),
        )
        .route("/streams/:id/restart", post(admin::restart_stream))
        .route("/streams/:id/status", get(admin::stream_status))
        .route("/streams/:id/metrics", get(admin::stream_metrics)) // 运行指标
        .with_state(state)
}
