use crate::http_result::HttpApiError;
use http_api_problem::{HttpApiProblem, StatusCode};
use rocket::request::FromParam;
use std::str::FromStr;

/// Handle returned to callers when an operation is enqueued. Progress and the
/// terminal result are looked up by this id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OperationId(uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for OperationId {
    type Err = OperationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(OperationId(uuid::Uuid::from_str(s)?))
    }
}

impl<'r> FromParam<'r> for OperationId {
    type Error = OperationIdError;

    fn from_param(param: &'r str) -> Result<Self, Self::Error> {
        OperationId::from_str(param)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OperationIdError {
    #[error("Failed to parse UUID: {err}")]
    UuidError { err: String },
}

impl From<uuid::Error> for OperationIdError {
    fn from(err: uuid::Error) -> Self {
        OperationIdError::UuidError {
            err: format!("{err}"),
        }
    }
}

impl From<OperationIdError> for HttpApiError {
    fn from(err: OperationIdError) -> Self {
        HttpApiProblem::with_title(StatusCode::BAD_REQUEST)
            .detail(format!("{err}"))
            .into()
    }
}
