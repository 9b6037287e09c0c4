use crate::data_api::ApiError;
use crate::executor::ProtocolError;
use crate::modifier::ModifierError;
use crate::query::ExprError;
use crate::schema::SchemaError;
use std::fmt;
use std::io;

/// Unified error type for the entire crate.
///
/// This error type centralizes all possible errors that can occur across the
/// query, executor, modifier, schema, and data API layers, providing a
/// consistent interface for error handling and propagation.
///
/// Each variant represents a specific category of errors, with associated context
/// to help with debugging and error reporting.
#[derive(Debug)]
pub enum TidewireError {
    /// Errors raised while building query expressions
    Expr(ExprError),

    /// Errors surfaced by the remote executor protocol
    Protocol(ProtocolError),

    /// Errors raised by field modifiers
    Modifier(ModifierError),

    /// Errors related to schema registration and lookup
    Schema(SchemaError),

    /// Errors raised by data API endpoints
    Api(ApiError),

    /// Misuse of a cursor or change feed, such as overlapping reads.
    /// These indicate a programmer error, not an environmental failure.
    Unsafe(String),

    /// Errors related to configuration
    Config(String),

    /// Errors related to IO operations
    Io(io::Error),

    /// Errors related to serialization/deserialization
    Serialization(String),
}

impl fmt::Display for TidewireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expr(err) => write!(f, "Expression error: {}", err),
            Self::Protocol(err) => write!(f, "Protocol error: {}", err),
            Self::Modifier(err) => write!(f, "Modifier error: {}", err),
            Self::Schema(err) => write!(f, "Schema error: {}", err),
            Self::Api(err) => write!(f, "API error: {}", err),
            Self::Unsafe(msg) => write!(f, "Unsafe operation: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for TidewireError {}

/// Conversion from ExprError to TidewireError
impl From<ExprError> for TidewireError {
    fn from(error: ExprError) -> Self {
        TidewireError::Expr(error)
    }
}

/// Conversion from ProtocolError to TidewireError
impl From<ProtocolError> for TidewireError {
    fn from(error: ProtocolError) -> Self {
        TidewireError::Protocol(error)
    }
}

/// Conversion from ModifierError to TidewireError
impl From<ModifierError> for TidewireError {
    fn from(error: ModifierError) -> Self {
        TidewireError::Modifier(error)
    }
}

/// Conversion from SchemaError to TidewireError
impl From<SchemaError> for TidewireError {
    fn from(error: SchemaError) -> Self {
        TidewireError::Schema(error)
    }
}

/// Conversion from ApiError to TidewireError
impl From<ApiError> for TidewireError {
    fn from(error: ApiError) -> Self {
        TidewireError::Api(error)
    }
}

/// Conversion from io::Error to TidewireError
impl From<io::Error> for TidewireError {
    fn from(error: io::Error) -> Self {
        TidewireError::Io(error)
    }
}

/// Conversion from serde_json::Error to TidewireError
impl From<serde_json::Error> for TidewireError {
    fn from(error: serde_json::Error) -> Self {
        TidewireError::Serialization(error.to_string())
    }
}

/// Result type alias for operations that can result in a TidewireError
pub type TidewireResult<T> = Result<T, TidewireError>;
