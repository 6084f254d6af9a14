use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Every failure that can reach a client, on the socket or over HTTP.
#[derive(Debug, Error)]
pub enum TavernError {
    /// Input did not match the declared shape.
    #[error("{message}")]
    Validation { message: String, data: Option<Value> },

    /// Missing, invalid or revoked identity.
    #[error("{0}")]
    Authentication(String),

    /// Authenticated, but not allowed for this role or ownership.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// The operation would break a position invariant.
    #[error("{0}")]
    Conflict(String),

    /// Broken invariant or an upstream dependency failed.
    #[error("{0}")]
    Intern(String),
}

/// The `{message, status, data}` shape sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub status: u16,
    pub data: Option<Value>,
}

impl TavernError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            data: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, data: Value) -> Self {
        Self::Validation {
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authentication(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Intern(_) => 500,
        }
    }

    pub fn is_intern(&self) -> bool {
        matches!(self, Self::Intern(_))
    }

    /// Wire form. Internal details stay in the server log.
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            Self::Intern(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        let data = match self {
            Self::Validation { data, .. } => data.clone(),
            _ => None,
        };
        ErrorPayload {
            message,
            status: self.status(),
            data,
        }
    }
}

impl From<anyhow::Error> for TavernError {
    fn from(err: anyhow::Error) -> Self {
        Self::Intern(format!("{err:#}"))
    }
}
