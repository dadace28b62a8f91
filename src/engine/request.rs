//! Completion handle returned by the request-based verbs

use crate::error::{RmaError, RmaResult};

/// Handle of an RMA operation.
///
/// Every verb finishes before returning, so a request is always complete;
/// the only state it carries is whether the operation failed.
#[derive(Debug, Default)]
pub struct RmaRequest {
    error: Option<RmaError>,
}

impl RmaRequest {
    pub fn completed() -> Self {
        Self { error: None }
    }

    pub fn failed(error: RmaError) -> Self {
        Self { error: Some(error) }
    }

    pub fn from_result(result: RmaResult<()>) -> Self {
        match result {
            Ok(()) => Self::completed(),
            Err(e) => Self::failed(e),
        }
    }

    /// Non-blocking completion check; always true
    pub fn test(&self) -> bool {
        true
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&RmaError> {
        self.error.as_ref()
    }

    /// Consume the request, surfacing its error
    pub fn wait(self) -> RmaResult<()> {
        match self.error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
