//! Step and engine error types.

use autoflow_types::{ExecutionErrorCode, ProviderErrorKind};
use thiserror::Error;

use crate::condition::ConditionError;
use crate::credentials::CredentialError;
use crate::recorder::RecorderError;
use crate::resolve::ResolutionError;

/// Error taxonomy used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorClass {
    /// Unregistered provider or malformed plan.
    Configuration,
    /// Missing, expired or invalid stored credential.
    Credential,
    /// Unresolved or forward reference.
    Resolution,
    /// Timeout, rate limit or 5xx-equivalent that outlived its retries.
    TransientProvider,
    /// Provider refused the request for a reason retrying cannot fix.
    ProviderRejected,
    /// Provider refused the supplied credential.
    Authentication,
    /// Deliberate stop requested by a caller.
    Cancelled,
}

/// Terminal failure of one step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// `message` is the provider's final error text, verbatim.
    #[error("{message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
        attempts: u32,
    },
    #[error("run cancelled")]
    Cancelled,
}

impl StepError {
    pub fn class(&self) -> StepErrorClass {
        match self {
            Self::Configuration(_) => StepErrorClass::Configuration,
            Self::Credential(_) => StepErrorClass::Credential,
            Self::Resolution(_) => StepErrorClass::Resolution,
            Self::Provider { kind, .. } => match kind {
                ProviderErrorKind::Transient | ProviderErrorKind::Timeout | ProviderErrorKind::RateLimited => {
                    StepErrorClass::TransientProvider
                }
                ProviderErrorKind::Authentication => StepErrorClass::Authentication,
                ProviderErrorKind::Rejected => StepErrorClass::ProviderRejected,
            },
            Self::Cancelled => StepErrorClass::Cancelled,
        }
    }

    /// Code stored on the failed execution.
    pub fn error_code(&self) -> ExecutionErrorCode {
        match self.class() {
            StepErrorClass::Configuration => ExecutionErrorCode::Configuration,
            StepErrorClass::Credential | StepErrorClass::Authentication => ExecutionErrorCode::Credential,
            StepErrorClass::Resolution => ExecutionErrorCode::Resolution,
            StepErrorClass::TransientProvider | StepErrorClass::ProviderRejected => ExecutionErrorCode::Provider,
            StepErrorClass::Cancelled => ExecutionErrorCode::Cancelled,
        }
    }
}

impl From<ConditionError> for StepError {
    fn from(error: ConditionError) -> Self {
        match error {
            ConditionError::Resolution(error) => Self::Resolution(error),
            syntax @ ConditionError::Syntax { .. } => Self::Configuration(syntax.to_string()),
        }
    }
}

/// Failure to dispatch or record a run.
///
/// Step failures never surface here; they end in a `failed` execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan '{plan_id}' cannot run: {reason}")]
    NotRunnable { plan_id: String, reason: String },
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("run task failed: {0}")]
    Join(String),
}

/// Why the step walk stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Failed(StepError),
    Internal(EngineError),
}

impl From<StepError> for Halt {
    fn from(error: StepError) -> Self {
        Self::Failed(error)
    }
}

impl From<RecorderError> for Halt {
    fn from(error: RecorderError) -> Self {
        Self::Internal(EngineError::Recorder(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kinds_map_to_classes_and_codes() {
        let transient = StepError::Provider {
            kind: ProviderErrorKind::RateLimited,
            message: "slow down".into(),
            attempts: 3,
        };
        assert_eq!(transient.class(), StepErrorClass::TransientProvider);
        assert_eq!(transient.error_code(), ExecutionErrorCode::Provider);
        assert_eq!(transient.to_string(), "slow down");

        let auth = StepError::Provider {
            kind: ProviderErrorKind::Authentication,
            message: "HTTP 401".into(),
            attempts: 1,
        };
        assert_eq!(auth.error_code(), ExecutionErrorCode::Credential);
        assert_eq!(StepError::Cancelled.error_code(), ExecutionErrorCode::Cancelled);
    }

    #[test]
    fn condition_errors_split_into_configuration_and_resolution() {
        let syntax = StepError::from(ConditionError::Syntax {
            expression: "a ==".into(),
            reason: "missing operand".into(),
        });
        assert_eq!(syntax.class(), StepErrorClass::Configuration);

        let resolution = StepError::from(ConditionError::Resolution(ResolutionError::StepNotExecuted {
            expression: "steps.4.output".into(),
            step: 4,
        }));
        assert_eq!(resolution.class(), StepErrorClass::Resolution);
    }
}
