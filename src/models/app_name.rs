use crate::http_result::HttpApiError;
use http_api_problem::{HttpApiProblem, StatusCode};
use regex::Regex;
use rocket::request::FromParam;
use std::ops::Deref;
use std::str::FromStr;

/// Identifier of an app. Matches the app's directory name in the catalog and
/// is embedded in unit names, route names, and file names, so the accepted
/// alphabet is deliberately narrow.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AppName(String);

impl AppName {
    pub fn into_string(self) -> String {
        self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl<'de> serde::Deserialize<'de> for AppName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let app_name = String::deserialize(deserializer)?;
        Self::from_str(&app_name).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for AppName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl Deref for AppName {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for AppName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AppName {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for AppName {
    type Err = AppNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        lazy_static::lazy_static! {
            static ref VALID_NAME_REGEX: Regex = Regex::new("^[a-z0-9][a-z0-9-]*$").unwrap();
        }

        if VALID_NAME_REGEX.is_match(name) {
            Ok(AppName(name.to_string()))
        } else {
            Err(AppNameError::InvalidName {
                name: name.to_string(),
            })
        }
    }
}

impl<'r> FromParam<'r> for AppName {
    type Error = AppNameError;

    fn from_param(param: &'r str) -> Result<Self, Self::Error> {
        AppName::from_str(param)
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum AppNameError {
    #[error("Invalid app name {name:?}: must match [a-z0-9][a-z0-9-]*")]
    InvalidName { name: String },
}

impl From<AppNameError> for HttpApiError {
    fn from(err: AppNameError) -> Self {
        HttpApiProblem::with_title(StatusCode::BAD_REQUEST)
            .detail(format!("{err}"))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_names() {
        assert_eq!(
            AppName::from_str("rss-reader").unwrap().as_str(),
            "rss-reader"
        );
        assert_eq!(AppName::from_str("db2").unwrap().as_str(), "db2");
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(AppName::from_str("../escape").is_err());
        assert!(AppName::from_str("with space").is_err());
        assert!(AppName::from_str("Upper").is_err());
        assert!(AppName::from_str("").is_err());
        assert!(AppName::from_str("-leading-dash").is_err());
    }
}
