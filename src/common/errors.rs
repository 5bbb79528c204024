//! Error types and handling for the bytecode analysis backend

use thiserror::Error;

use crate::common::types::{MethodRef, OpKind};

/// Main result type for analysis operations
pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Main error type encompassing all analysis errors
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("lifting error: {0}")]
    Lift(#[from] LiftError),

    #[error("resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Create an internal error with a custom message.
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        AnalysisError::Internal(msg.into())
    }

    /// Check whether the error is recoverable at the method granularity.
    ///
    /// A recoverable error aborts the current method only; the
    /// interprocedural driver then treats the method as unknown.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AnalysisError::Lift(_) | AnalysisError::Resolve(_) => true,
            AnalysisError::Config(_) | AnalysisError::Io(_) | AnalysisError::Internal(_) => false,
        }
    }
}

/// Fatal lifting errors. Each one aborts the method being lifted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LiftError {
    #[error("operand stack overflow at offset {offset:#06x}")]
    StackOverflow { offset: u32 },

    #[error("operand stack underflow at offset {offset:#06x}")]
    StackUnderflow { offset: u32 },

    #[error(
        "stack size mismatch entering block at offset {offset:#06x}: expected {expected}, got {actual}"
    )]
    StackSizeMismatch {
        offset: u32,
        expected: u16,
        actual: u16,
    },

    #[error("argument count mismatch calling {method}: expected {expected}, got {actual}")]
    ArgumentCountMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("branch target {target:#06x} outside method at offset {offset:#06x}")]
    MalformedBranch { target: u32, offset: u32 },

    #[error("missing operand for {opcode:?} at offset {offset:#06x}")]
    MissingOperand { opcode: OpKind, offset: u32 },

    /// Raised only under [`crate::common::config::UnknownPolicy::Error`];
    /// the default policy records a [`LiftWarning`] instead.
    #[error("unknown opcode {opcode} at offset {offset:#06x}")]
    UnknownOpcode { opcode: String, offset: u32 },
}

/// Symbol resolution errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("load-token without a type reference at offset {offset:#06x}")]
    NullTypeToken { offset: u32 },

    #[error("method {method} has no body")]
    MissingMethodBody { method: MethodRef },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Recoverable diagnostics produced while lifting a method.
///
/// Unknown opcodes are logged and skipped rather than failing the method;
/// the lifter applies no stack effect for them, preserving stack balance.
#[derive(Debug, Clone, PartialEq)]
pub enum LiftWarning {
    /// Opcode outside the supported set
    UnknownOpcode { opcode: String, offset: u32 },
}

impl std::fmt::Display for LiftWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiftWarning::UnknownOpcode { opcode, offset } => {
                write!(f, "unknown opcode {} at offset {:#06x}", opcode, offset)
            }
        }
    }
}
