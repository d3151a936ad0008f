use crate::http_result::HttpApiError;
use http_api_problem::{HttpApiProblem, StatusCode};
use rocket::request::FromParam;
use std::str::FromStr;

/// Identifier of one rebuild. Names the log file on disk and is the lookup
/// key of the rebuild-log API.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RebuildId(uuid::Uuid);

impl RebuildId {
    pub fn new() -> Self {
        RebuildId(uuid::Uuid::new_v4())
    }

    /// Compact hex form, used in file names.
    pub fn simple(&self) -> uuid::fmt::Simple {
        self.0.simple()
    }
}

impl Default for RebuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RebuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for RebuildId {
    type Err = RebuildIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RebuildId(uuid::Uuid::from_str(s)?))
    }
}

impl<'r> FromParam<'r> for RebuildId {
    type Error = RebuildIdError;

    fn from_param(param: &'r str) -> Result<Self, Self::Error> {
        RebuildId::from_str(param)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RebuildIdError {
    #[error("Failed to parse UUID: {err}")]
    UuidError { err: String },
}

impl From<uuid::Error> for RebuildIdError {
    fn from(err: uuid::Error) -> Self {
        RebuildIdError::UuidError {
            err: format!("{err}"),
        }
    }
}

impl From<RebuildIdError> for HttpApiError {
    fn from(err: RebuildIdError) -> Self {
        HttpApiProblem::with_title(StatusCode::BAD_REQUEST)
            .detail(format!("{err}"))
            .into()
    }
}
