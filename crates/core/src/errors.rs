use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("invalid request: {0}")]
    Validation(String),
    /// The language model provider could not be reached or refused the request.
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("orchestration failure: {0}")]
    Orchestration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest { message, .. } | Self::ServiceUnavailable { message, .. } => message,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::Validation(message) => InterfaceError::BadRequest { message, correlation_id },
            Self::Upstream(message) | Self::Orchestration(message) => {
                InterfaceError::ServiceUnavailable { message, correlation_id }
            }
        }
    }
}
