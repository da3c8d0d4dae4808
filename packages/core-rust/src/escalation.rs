//! Typed failures propagated through the escalation handler chain.
//!
//! An [`Escalation`] wraps any `std::error::Error` so handlers can be matched
//! by the Rust type of the failure. [`EngineEscalation`] covers failures the
//! engine itself raises, and [`CleanupEscalation`] records failures that
//! happen while a scope is being torn down.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// A typed failure raised during function execution.
///
/// Cheap to clone: the same escalation may be observed by a handler and then
/// recorded on the process report.
#[derive(Clone)]
pub struct Escalation {
    cause: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Escalation {
    /// Wraps a typed failure.
    pub fn new<E>(cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            cause: Arc::new(cause),
        }
    }

    /// Creates an escalation carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageEscalation(message.into()))
    }

    /// Returns whether the underlying failure is of type `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.cause.downcast_ref::<E>().is_some()
    }

    /// Returns the underlying failure as `E`, if it is one.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.cause.downcast_ref::<E>()
    }

    /// Returns the underlying failure.
    #[must_use]
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.cause
    }

    /// Returns whether this escalation is the engine's shutdown escalation.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self.downcast_ref::<EngineEscalation>(),
            Some(EngineEscalation::Shutdown)
        )
    }
}

impl fmt::Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Escalation").field(&self.cause).finish()
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl From<EngineEscalation> for Escalation {
    fn from(escalation: EngineEscalation) -> Self {
        Escalation::new(escalation)
    }
}

/// Failure carrying only a message, produced by [`Escalation::msg`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MessageEscalation(pub String);

// ---------------------------------------------------------------------------
// EngineEscalation
// ---------------------------------------------------------------------------

/// Failures raised by the engine rather than by application functions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineEscalation {
    #[error("office floor is shutting down")]
    Shutdown,
    #[error("asynchronous operation on managed object {object} timed out after {timeout_ms}ms")]
    AsynchronousTimeout { object: String, timeout_ms: u64 },
    #[error("failed to source managed object {object}: {reason}")]
    ObjectSourcing { object: String, reason: String },
    #[error("managed object {object} does not provide extension {extension}")]
    MissingExtension { object: String, extension: String },
    #[error("function {function} has no flow {flow}")]
    UnknownFlow { function: String, flow: String },
    #[error("function {function} has no object dependency {dependency}")]
    UnknownDependency { function: String, dependency: String },
    #[error("object {dependency} of function {function} is not a {expected}")]
    ObjectType {
        function: String,
        dependency: String,
        expected: &'static str,
    },
    #[error("governance {governance} failed to {action}: {reason}")]
    Governance {
        governance: String,
        action: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// CleanupEscalation
// ---------------------------------------------------------------------------

/// A failure that occurred while tearing down a scope.
///
/// Cleanup escalations are collected rather than thrown: each one is passed to
/// later recycle attempts in the same sweep and finally reported on the
/// process report.
#[derive(Debug, Clone)]
pub struct CleanupEscalation {
    /// Name of the managed object, governance or job being cleaned up.
    pub source: String,
    /// The failure raised.
    pub escalation: Escalation,
}

impl CleanupEscalation {
    /// Creates a cleanup escalation for the named source.
    pub fn new(source: impl Into<String>, escalation: Escalation) -> Self {
        Self {
            source: source.into(),
            escalation,
        }
    }
}

impl fmt::Display for CleanupEscalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup of {} failed: {}", self.source, self.escalation)
    }
}
