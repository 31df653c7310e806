use thiserror::Error;

/// Failure surfaced by kernel construction or submission.
///
/// Contract violations (unsupported iteration dimensionality, wrong `bind`
/// arity, empty composites) are not represented here; they panic.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("incompatible operands: {message}")]
    Incompatible { message: String },
    #[error("recipe runtime call {call} failed with status {status}")]
    Recipe { call: &'static str, status: i32 },
    #[error("kernel template error: {message}")]
    Template { message: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn incompatible(message: impl Into<String>) -> Self {
        BackendError::Incompatible {
            message: message.into(),
        }
    }

    pub fn recipe(call: &'static str, status: i32) -> Self {
        BackendError::Recipe { call, status }
    }

    pub fn template(message: impl Into<String>) -> Self {
        BackendError::Template {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn is_incompatible(&self) -> bool {
        matches!(self, BackendError::Incompatible { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
