//! `{success, ..., error}` envelopes for HTTP-facing collaborators.

use serde::Serialize;

use crate::error::PoolResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn from_result(result: PoolResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self {
                success: false,
                data: None,
                error: Some(e.to_string()),
                error_code: Some(e.code()),
            },
        }
    }
}

impl<T: Serialize> From<PoolResult<T>> for ApiResponse<T> {
    fn from(result: PoolResult<T>) -> Self {
        Self::from_result(result)
    }
}
