//! Error types and error handling strategy for the supervisor.
//!
//! Every fault a caller can observe is a typed [`ErrorKind`]. The split that
//! matters to the lifecycle machinery is transient versus fatal: transient
//! launch faults are recovered locally with bounded retries, while fatal
//! faults surface as activity finishes. An error path never leaves a record
//! half-transitioned: every caught error either completes the transition or
//! rolls back to the prior state.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Caller faults ===
    /// Caller lacks a required capability; no state was changed.
    PermissionDenied,
    /// Intent carried a file-descriptor payload or malformed options.
    BadIntent,
    /// The package resolver returned no activity for the intent.
    ResolveFailed,

    // === Transient launch faults ===
    /// Process could not be forked; the activity stays INITIALIZING and is
    /// retried when a process becomes available.
    ProcessStartFailed,
    /// A remote call into the hosting process failed. The first occurrence
    /// per launch attempt triggers a process restart and retry.
    LaunchFailed,

    // === Escalated faults ===
    /// Second launch failure within the same attempt; the activity is
    /// finished with a cancelled result.
    CrashFatal,
    /// The quick-crash rule tripped and the process was marked bad.
    QuotaExceeded,

    // === Users ===
    /// Attempted to stop the system user or the current user.
    UserOpInvalid,
    /// The target user is not started.
    UserNotRunning,

    // === Structure ===
    /// Attempted to create a second singleton stack or an unsupported
    /// windowing-mode combination.
    Configuration,
    /// Invalid lifecycle state transition.
    InvalidStateTransition,
    /// A record id did not resolve (stale or removed).
    StaleRecord,

    // === Coordination ===
    /// A bounded wait exceeded its deadline. The target state has advanced
    /// to the deadline-driven next state; nothing is rolled back.
    Timeout,
    /// Internal supervisor error (bug).
    Internal,
}

impl ErrorKind {
    /// Short label used in rendered errors and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission denied",
            Self::BadIntent => "bad intent",
            Self::ResolveFailed => "resolve failed",
            Self::ProcessStartFailed => "process start failed",
            Self::LaunchFailed => "launch failed",
            Self::CrashFatal => "crash fatal",
            Self::QuotaExceeded => "quota exceeded",
            Self::UserOpInvalid => "user op invalid",
            Self::UserNotRunning => "user not running",
            Self::Configuration => "configuration",
            Self::InvalidStateTransition => "invalid state transition",
            Self::StaleRecord => "stale record",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

/// The main error type for supervisor operations: a kind, optional context
/// text, and an optional underlying cause from a collaborator call.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates an error of the given kind with no context.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the operation may be retried after the fault clears.
    ///
    /// Only the two launch faults qualify: a refused fork and a failed
    /// remote launch call. Everything else is final from the caller's view.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ProcessStartFailed | ErrorKind::LaunchFailed
        )
    }

    /// Returns true if this error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Attaches context text describing what was being attempted.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Attaches the underlying collaborator failure.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.label())?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for attaching context to fallible supervisor calls.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for supervisor operations.
pub type Result<T> = core::result::Result<T, Error>;
