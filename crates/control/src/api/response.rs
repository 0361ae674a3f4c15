use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crond_core::CrondError;

/// 统一响应包络
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        })
    }
}

impl ApiResponse<()> {
    pub fn empty() -> Json<Self> {
        Json(Self {
            code: 0,
            message: "success".to_string(),
            data: None,
        })
    }
}

/// 错误到 HTTP 的映射；`Internal` 只暴露 msg，细节留在日志里
pub struct ApiError(pub CrondError);

impl From<CrondError> for ApiError {
    fn from(err: CrondError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CrondError::BadCron { .. } | CrondError::Configuration(_) => StatusCode::BAD_REQUEST,
            CrondError::ProjectNotExist | CrondError::RecordNotFound => StatusCode::NOT_FOUND,
            CrondError::AlreadyLocked => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("接口内部错误: {:?}", self.0);
        }
        let body = Json(ApiResponse::<()> {
            code: status.as_u16() as i32,
            message: self.0.to_string(),
            data: None,
        });
        (status, body).into_response()
    }
}
