//! Error taxonomy for the harvester.
//!
//! Every failure a work item can hit is a [`HarvestError`]. The orchestrator
//! never lets one escape past a single item; instead it classifies the error
//! with [`HarvestError::kind`] so the run summary can break failures down by
//! category.

use crate::model::FormField;
use chromiumoxide::error::CdpError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Browser binary or its driver did not come up.
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("form field not found: {0}")]
    FormFieldNotFound(FormField),

    #[error("submit control not found by any locator strategy")]
    SubmitControlNotFound,

    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport-level failure talking to the browser or the upstream server.
    #[error("connection failure: {0}")]
    Connection(String),

    /// Browser-side failure that is neither a timeout nor a lost connection.
    #[error("browser error: {0}")]
    Browser(String),

    /// The report has no row for this entity and date. Only raised as an
    /// error when the not-found policy says absence is a failure.
    #[error("no report row for entity {entity_id}")]
    NotFound { entity_id: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable setup failure; aborts the whole run.
    #[error("setup failure: {0}")]
    Setup(String),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure category reported in the end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    ElementNotFound,
    NotFound,
    Persistence,
    Launch,
    Other,
}

impl FailureKind {
    /// Buckets always shown in the summary, even at zero.
    pub const HEADLINE: [FailureKind; 4] = [
        FailureKind::Timeout,
        FailureKind::Connection,
        FailureKind::ElementNotFound,
        FailureKind::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::ElementNotFound => "element_not_found",
            Self::NotFound => "not_found",
            Self::Persistence => "persistence",
            Self::Launch => "launch",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HarvestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Connection(_) => FailureKind::Connection,
            Self::FormFieldNotFound(_) | Self::SubmitControlNotFound => {
                FailureKind::ElementNotFound
            }
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::Persistence(_) => FailureKind::Persistence,
            Self::Launch(_) => FailureKind::Launch,
            Self::Browser(_)
            | Self::Config(_)
            | Self::Setup(_)
            | Self::Cancelled
            | Self::Io(_) => FailureKind::Other,
        }
    }

    /// Timeouts, transport failures and failed launches: recovered by
    /// backoff and, when repeated, a fresh session.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::Launch(_)
        )
    }

    pub fn is_element_class(&self) -> bool {
        matches!(
            self,
            Self::FormFieldNotFound(_) | Self::SubmitControlNotFound
        )
    }

    /// Errors that retrying cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Config(_) | Self::Setup(_) | Self::NotFound { .. }
        )
    }

    pub fn persistence(err: impl fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<CdpError> for HarvestError {
    fn from(err: CdpError) -> Self {
        match err {
            CdpError::Timeout => Self::Timeout("browser request timed out".to_string()),
            CdpError::Ws(e) => Self::Connection(format!("websocket: {e}")),
            CdpError::Io(e) => Self::Connection(format!("io: {e}")),
            CdpError::ChannelSendError(e) => Self::Connection(format!("channel: {e}")),
            CdpError::NoResponse => Self::Connection("no response from browser".to_string()),
            CdpError::LaunchExit(status, _) => {
                Self::Launch(format!("browser exited during launch: {status}"))
            }
            CdpError::LaunchTimeout(_) => Self::Launch("browser launch timed out".to_string()),
            CdpError::LaunchIo(e, _) => Self::Launch(format!("browser launch io: {e}")),
            other => Self::Browser(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("malformed payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_errors_classify_as_element_not_found() {
        let err = HarvestError::FormFieldNotFound(FormField::PeriodEnd);
        assert_eq!(err.kind(), FailureKind::ElementNotFound);
        assert!(err.is_element_class());
        assert!(!err.is_connection_class());
        assert_eq!(
            HarvestError::SubmitControlNotFound.kind(),
            FailureKind::ElementNotFound
        );
    }

    #[test]
    fn timeouts_are_connection_class() {
        let err = HarvestError::Timeout("navigation".into());
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(err.is_connection_class());
    }

    #[test]
    fn cdp_timeout_maps_to_timeout() {
        let err: HarvestError = CdpError::Timeout.into();
        assert_eq!(err.kind(), FailureKind::Timeout);
        let err: HarvestError = CdpError::NoResponse.into();
        assert_eq!(err.kind(), FailureKind::Connection);
    }

    #[test]
    fn not_found_is_terminal() {
        let err = HarvestError::NotFound {
            entity_id: "1234".into(),
        };
        assert!(err.is_terminal());
        assert_eq!(err.kind().as_str(), "not_found");
    }
}
