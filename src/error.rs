//! Unified error handling for kernelforge
//!
//! All scheduler, actor and memory failures are reported through
//! [`RuntimeError`]. Errors are grouped into categories that decide how a
//! failure is handled:
//! - Configuration errors (contract violations between compiler and scheduler)
//! - Resource errors (allocation failures, static memory plan mismatches)
//! - Launch errors (device kernel reported failure)
//! - Inference errors (shape/type inference or resize failures)
//! - Internal errors (bugs, poisoned locks, closed channels)

use std::fmt;

use crate::device::DeviceError;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for kernelforge
///
/// Errors are `Clone` because the first failure of a run is stored on the
/// op context and handed back to the caller once the run has drained.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    // ========== Configuration Errors ==========
    /// Invalid scheduler or graph configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Structural problem in the compiled graph
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Node refers to a device context that was not provided
    #[error("Node {node} expects device context {index}, but only {available} were provided")]
    DeviceContextMismatch {
        node: String,
        index: usize,
        available: usize,
    },

    /// Input/output/workspace arity does not match what the kernel reports
    #[error("Node {node}: {what} arity mismatch, expected {expected}, got {actual}")]
    ArityMismatch {
        node: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Index into an input/output/workspace list is out of range
    #[error("Node {node}: {what} index {index} out of range (len {len})")]
    IndexOutOfRange {
        node: String,
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// Dynamic shape node placed into the static memory plan
    #[error("Node {0} is dynamic shape and cannot use the static memory plan")]
    SomasDynamicConflict(String),

    /// Node carries a static memory placement while the plan is disabled
    #[error("Node {0} has a static memory placement but the static memory plan is disabled")]
    SomasDisabled(String),

    /// Input tensor does not match the graph's declared input
    #[error("Invalid input {index}: {reason}")]
    InvalidInput { index: usize, reason: String },

    // ========== Resource Errors ==========
    /// Device memory allocation failed
    #[error("Memory allocation failed for {requester}: {reason}")]
    AllocationFailed { requester: String, reason: String },

    /// Static memory plan lookup failed
    #[error("Static memory plan mismatch: {0}")]
    SomasMismatch(String),

    /// Format/device adaptation copy failed
    #[error("Node {node}: copy of input {input_index} failed: {reason}")]
    CopyFailed {
        node: String,
        input_index: usize,
        reason: String,
    },

    /// Device tensor store lookup failed
    #[error("Persistent tensor not bound: {0}")]
    ParameterNotBound(String),

    /// Device level error outside of a kernel launch
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    // ========== Launch Errors ==========
    /// Device kernel launch failed
    #[error("Kernel launch failed on node {node}: {reason}")]
    LaunchFailed { node: String, reason: String },

    // ========== Inference Errors ==========
    /// Shape or type inference raised an error
    #[error("Shape inference failed on node {node}: {reason}")]
    InferenceFailed { node: String, reason: String },

    /// Kernel resize returned a non-OK status
    #[error("Resize failed on node {node}: {status}")]
    ResizeFailed { node: String, status: String },

    // ========== Run Errors ==========
    /// Run exceeded the configured timeout
    #[error("Run {sequence} timed out after {millis} ms")]
    RunTimeout { sequence: u64, millis: u64 },

    /// Run drained without producing every graph output
    #[error("Run {sequence} stalled: {received}/{expected} outputs collected")]
    RunStalled {
        sequence: u64,
        received: usize,
        expected: usize,
    },

    /// Remote message rejected by a receive actor
    #[error("Actor {actor} rejected message from {from}: {reason}")]
    MessageRejected {
        actor: String,
        from: String,
        reason: String,
    },

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a worker panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Executor or service channel closed unexpectedly
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Invalid actor phase or dispatch state transition
    #[error("Invalid state transition for {actor}: {from} -> {to}")]
    InvalidStateTransition {
        actor: String,
        from: String,
        to: String,
    },

    /// Actor id not present in the directory
    #[error("Actor not found: {0}")]
    ActorNotFound(String),
}

impl RuntimeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::InvalidConfiguration(_)
            | RuntimeError::InvalidGraph(_)
            | RuntimeError::DeviceContextMismatch { .. }
            | RuntimeError::ArityMismatch { .. }
            | RuntimeError::IndexOutOfRange { .. }
            | RuntimeError::SomasDynamicConflict(_)
            | RuntimeError::SomasDisabled(_)
            | RuntimeError::InvalidInput { .. } => ErrorCategory::Configuration,

            RuntimeError::AllocationFailed { .. }
            | RuntimeError::SomasMismatch(_)
            | RuntimeError::CopyFailed { .. }
            | RuntimeError::ParameterNotBound(_)
            | RuntimeError::Device(_)
            | RuntimeError::RunTimeout { .. }
            | RuntimeError::RunStalled { .. }
            | RuntimeError::MessageRejected { .. } => ErrorCategory::Resource,

            RuntimeError::LaunchFailed { .. } => ErrorCategory::Launch,

            RuntimeError::InferenceFailed { .. } | RuntimeError::ResizeFailed { .. } => {
                ErrorCategory::Inference
            }

            RuntimeError::InternalError(_)
            | RuntimeError::LockPoisoned(_)
            | RuntimeError::ChannelClosed(_)
            | RuntimeError::InvalidStateTransition { .. }
            | RuntimeError::ActorNotFound(_) => ErrorCategory::Internal,
        }
    }

    /// Check if the caller may retry the whole run
    ///
    /// Run-scoped failures (resources, launches, inference) leave the
    /// scheduler in a reusable state. Configuration and internal errors do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Resource | ErrorCategory::Launch | ErrorCategory::Inference
        )
    }

    /// Check if this error is a compiler/scheduler contract violation
    pub fn is_configuration_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Contract violation detected while building the scheduler
    Configuration,
    /// Memory or plan failure scoped to one run
    Resource,
    /// Device kernel launch failure scoped to one run
    Launch,
    /// Shape/type inference or resize failure scoped to one run
    Inference,
    /// Bug or broken invariant
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Launch => write!(f, "Launch"),
            ErrorCategory::Inference => write!(f, "Inference"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for RuntimeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RuntimeError::LockPoisoned(err.to_string())
    }
}

// Helper type alias for Results using RuntimeError
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Create a configuration error with context
///
/// # Examples
/// ```ignore
/// return Err(config_error!("worker_threads must be > 0"));
/// ```
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::RuntimeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RuntimeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::RuntimeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RuntimeError::InternalError(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_not_recoverable() {
        let err = RuntimeError::SomasDynamicConflict("matmul".to_string());
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.is_configuration_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_run_scoped_errors_are_recoverable() {
        let alloc = RuntimeError::AllocationFailed {
            requester: "add".to_string(),
            reason: "out of memory".to_string(),
        };
        let launch = RuntimeError::LaunchFailed {
            node: "conv".to_string(),
            reason: "device fault".to_string(),
        };
        let resize = RuntimeError::ResizeFailed {
            node: "reshape".to_string(),
            status: "ResizeFailed".to_string(),
        };
        assert!(alloc.is_recoverable());
        assert!(launch.is_recoverable());
        assert!(resize.is_recoverable());
        assert_eq!(launch.category(), ErrorCategory::Launch);
        assert_eq!(resize.category(), ErrorCategory::Inference);
    }

    #[test]
    fn test_launch_error_names_node() {
        let err = RuntimeError::LaunchFailed {
            node: "relu_3".to_string(),
            reason: "kernel returned false".to_string(),
        };
        assert!(err.to_string().contains("relu_3"));
    }

    #[test]
    fn test_poison_error_conversion() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: RuntimeError = lock.lock().unwrap_err().into();
        assert!(err.is_internal_error());
    }

    #[test]
    fn test_error_macros() {
        let err = config_error!("threads must be > {}", 0);
        assert!(matches!(err, RuntimeError::InvalidConfiguration(ref m) if m == "threads must be > 0"));
        let err = internal_error!("broken");
        assert!(err.is_internal_error());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Resource.to_string(), "Resource");
        assert_eq!(ErrorCategory::Configuration.to_string(), "Configuration");
    }
}
