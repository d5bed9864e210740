//! The crate's single stable error taxonomy.
//!
//! Every subsystem (timer, queue, session, component registry, dispatch)
//! defines its own small error enum for the failure modes it can actually
//! produce, then converts into [`CoreError`] at the point where it crosses
//! into a caller that doesn't care about subsystem internals — a component
//! callback, the service loop, or the C-ABI façade. Internal call sites use
//! `Result<T, CoreError>` with `?`; nothing in this crate consults a
//! thread-local error slot. The façade crate is the only place that does.

use std::borrow::Cow;
use std::fmt;

/// The kind of failure, independent of what produced it.
///
/// Mirrors §7 of the specification one-for-one: these are the *kinds* the
/// core promises to report, not a type per subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad input to an otherwise well-formed call.
    Arg,
    /// A lookup (component, method, session, service) came up empty.
    NotFound,
    /// Duplicate registration of a name that must be unique.
    Repeat,
    /// The operation is invalid for the current lifecycle phase.
    State,
    /// A frame failed to decode under the active codec.
    ProtocolError,
    /// The operation would have to block; retry after a readiness signal.
    WouldBlock,
    /// The session or service this call targeted is already gone.
    Closed,
    /// A bounded wait elapsed before the operation completed.
    Timeout,
    /// Anything else — typically a caught handler panic or an invariant
    /// violation that the caller cannot meaningfully recover from.
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Arg => "arg",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Repeat => "repeat",
            ErrorKind::State => "state",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::WouldBlock => "would_block",
            ErrorKind::Closed => "closed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate-wide error value.
///
/// Carries a stable [`ErrorKind`], a human-readable message meant for logs
/// (never parsed by callers), and an optional chained cause so
/// `std::error::Error::source` can walk back to the original failure.
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn repeat(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Repeat, message)
    }

    pub fn state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    pub fn arg(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Arg, message)
    }

    pub fn protocol(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }

    pub fn would_block() -> Self {
        Self::new(ErrorKind::WouldBlock, "operation would block")
    }

    pub fn closed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Subsystem-local error enums, each naming only the failure modes that
/// subsystem can actually produce. `CoreError` is what every one of
/// these converts into at the point where it crosses into a caller that
/// doesn't care about subsystem internals; matching on the concrete enum
/// is for callers (typically within the same subsystem or its own
/// tests) that do.
#[derive(thiserror::Error, Debug)]
pub enum TimerError {
    #[error("timer {0} is not scheduled")]
    NotScheduled(crate::ids::TimerId),
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("message queue consumer has shut down")]
    ConsumerClosed,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },
    #[error("malformed frame")]
    Malformed,
    #[error("send buffer at high-water mark")]
    WouldBlock,
}

#[derive(thiserror::Error, Debug)]
pub enum ComponentError {
    #[error("component '{0}' not found")]
    NotFound(String),
    #[error("component '{0}' already registered")]
    Duplicate(String),
    #[error("method '{0}' not found")]
    MethodNotFound(String),
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("handler for opcode {0:#x} panicked or returned a fatal error")]
    HandlerFailed(u32),
}

impl From<TimerError> for CoreError {
    fn from(err: TimerError) -> Self {
        CoreError::new(ErrorKind::NotFound, err.to_string()).with_cause(err)
    }
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        CoreError::new(ErrorKind::Closed, err.to_string()).with_cause(err)
    }
}

impl From<SessionError> for CoreError {
    fn from(err: SessionError) -> Self {
        let kind = match err {
            SessionError::InvalidTransition { .. } => ErrorKind::State,
            SessionError::Malformed => ErrorKind::ProtocolError,
            SessionError::WouldBlock => ErrorKind::WouldBlock,
        };
        CoreError::new(kind, err.to_string()).with_cause(err)
    }
}

impl From<ComponentError> for CoreError {
    fn from(err: ComponentError) -> Self {
        let kind = match err {
            ComponentError::NotFound(_) | ComponentError::MethodNotFound(_) => ErrorKind::NotFound,
            ComponentError::Duplicate(_) => ErrorKind::Repeat,
        };
        CoreError::new(kind, err.to_string()).with_cause(err)
    }
}

impl From<DispatchError> for CoreError {
    fn from(err: DispatchError) -> Self {
        CoreError::new(ErrorKind::Internal, err.to_string()).with_cause(err)
    }
}
