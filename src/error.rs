use std::fmt;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Database,
    Forbidden,
    InvalidInput,
    NotFound,
}

/// Structured payloads attached to errors that resolvers surface verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetails {
    AddRemoveOverlap { ids: Vec<i64> },
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<ErrorDetails>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            details: None,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            details: None,
            source,
        }
    }

    pub fn forbidden(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code: "forbidden",
            public,
            details: None,
            source,
        }
    }

    pub fn unauthenticated(public: &'static str) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code: "unauthenticated",
            public,
            details: None,
            source: anyhow!(public),
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            details: None,
            source,
        }
    }

    pub fn add_remove_overlap(ids: Vec<i64>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "add_remove_conflict",
            public: "The same target appears in both add and remove",
            details: Some(ErrorDetails::AddRemoveOverlap { ids: ids.clone() }),
            source: anyhow!("add/remove sets overlap on {:?}", ids),
        }
    }

    /// Write conflicts are safe to retry once the competing transaction settles.
    pub fn is_conflict(&self) -> bool {
        self.code == "write_conflict"
    }
}

impl fmt::Display for LibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.public, self.code)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<StoreError> for LibError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict { table } => Self {
                kind: ErrorKind::Database,
                code: "write_conflict",
                public: "A concurrent write touched the same rows",
                details: None,
                source: anyhow!("unique violation on {table}"),
            },
            other => Self::database("Database request failed", anyhow!(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;

    use super::*;

    #[test]
    fn display_names_the_public_message_and_code() {
        let err = LibError::unauthenticated("You must be signed in for this operation");
        assert_eq!(
            err.to_string(),
            "You must be signed in for this operation (unauthenticated)"
        );
    }

    #[test]
    fn errors_thread_through_anyhow_context() {
        let result: std::result::Result<(), LibError> = Err(LibError::invalid(
            "User name is required",
            anyhow!("blank name"),
        ));
        let wrapped = result
            .context("seeding failed")
            .expect_err("error should survive wrapping");
        assert_eq!(wrapped.to_string(), "seeding failed");

        let chain: Vec<String> = wrapped.chain().map(ToString::to_string).collect();
        assert!(chain.iter().any(|step| step.contains("invalid_input")));
        assert!(chain.iter().any(|step| step.contains("blank name")));
    }
}
