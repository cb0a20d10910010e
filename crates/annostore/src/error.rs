use crate::hooks::Finding;
use crate::key::AccessKey;
use crate::mode::AccessMode;
use crate::session::SessionId;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// The step of a façade operation during which a lower-level failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    Repair,
    Upgrade,
    Persist,
    Delete,
    Export,
    Import,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Repair => "repair",
            Self::Upgrade => "upgrade",
            Self::Persist => "persist",
            Self::Delete => "delete",
            Self::Export => "export",
            Self::Import => "import",
        };
        f.write_str(name)
    }
}

/// Errors raised by the storage core.
///
/// Session and permission variants are contract violations by the caller and are never retried.
/// [`StoreError::BorrowTimeout`] is transient. Everything carrying a `source` is a lower-level
/// failure; the service wraps those into [`StoreError::Retrieval`] so the key, mode and stage
/// survive up to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No storage session is active on this thread")]
    NoActiveSession,

    #[error("A storage session is already active on this thread")]
    SessionAlreadyActive,

    #[error(
        "Session {session} is not the current session (current: {})",
        display_session(.current)
    )]
    SessionNotCurrent { session: SessionId, current: Option<SessionId> },

    #[error("Write not permitted on {key}: {reason}")]
    WriteNotPermitted { key: AccessKey, reason: Cow<'static, str> },

    /// The exclusive access pool could not hand out the slot for `key` in time.
    #[error("Exclusive access pool exhausted for {key}: gave up after {waited:?}")]
    BorrowTimeout { key: AccessKey, waited: Duration },

    #[error("Container {key} does not exist")]
    NotFound { key: AccessKey },

    #[error("Invalid argument{}: {message}", format_context(.context))]
    InvalidArgument { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Container {key} is corrupt: {}", summarize(.findings))]
    Corrupt { key: AccessKey, findings: Vec<Finding> },

    #[error("I/O failure{}: {source}", format_context(.context))]
    Io { source: std::io::Error, context: Option<Cow<'static, str>> },

    #[error("Codec failure{}: {source}", format_context(.context))]
    Codec { source: postcard::Error, context: Option<Cow<'static, str>> },

    #[error("Driver failure{}: {source}", format_context(.context))]
    Driver {
        source: Box<dyn std::error::Error + Send + Sync>,
        context: Option<Cow<'static, str>>,
    },

    #[error("Config error{}: {source}", format_context(.context))]
    Config { source: config::ConfigError, context: Option<Cow<'static, str>> },

    #[error("{stage} of {key} ({mode}) failed: {source}")]
    Retrieval { key: AccessKey, mode: AccessMode, stage: Stage, source: Box<StoreError> },

    #[error("Internal fault{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BorrowTimeout { .. } => true,
            Self::Retrieval { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether this failure originated below the contract surface (I/O, codec, driver, repair).
    pub const fn is_lower_level(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. }
                | Self::Io { .. }
                | Self::Codec { .. }
                | Self::Driver { .. }
                | Self::Internal { .. }
        )
    }

    /// Wraps lower-level failures with the façade coordinates; contract errors pass through.
    #[must_use]
    pub fn at_stage(self, key: &AccessKey, mode: AccessMode, stage: Stage) -> Self {
        if self.is_lower_level() {
            Self::Retrieval { key: key.clone(), mode, stage, source: Box::new(self) }
        } else {
            self
        }
    }

    /// Innermost error, looking through [`StoreError::Retrieval`] wrappers.
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Retrieval { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn driver(
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        context: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::Driver { source: source.into(), context: Some(context.into()) }
    }
}

impl From<&'static str> for StoreError {
    fn from(s: &'static str) -> Self {
        Self::Internal { message: Cow::Borrowed(s), context: None }
    }
}

impl From<String> for StoreError {
    fn from(s: String) -> Self {
        Self::Internal { message: Cow::Owned(s), context: None }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, context: None }
    }
}

impl From<postcard::Error> for StoreError {
    fn from(source: postcard::Error) -> Self {
        Self::Codec { source, context: None }
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(source: config::ConfigError) -> Self {
        Self::Config { source, context: None }
    }
}

/// Adds `.context(...)` to results that convert into [`StoreError`].
pub trait StoreErrorExt<T> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, StoreError>;
}

impl<T> StoreErrorExt<T> for Result<T, StoreError> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Self {
        self.map_err(|mut e| {
            match &mut e {
                StoreError::InvalidArgument { context: c, .. }
                | StoreError::Io { context: c, .. }
                | StoreError::Codec { context: c, .. }
                | StoreError::Driver { context: c, .. }
                | StoreError::Config { context: c, .. }
                | StoreError::Internal { context: c, .. } => *c = Some(context.into()),
                _ => {},
            }
            e
        })
    }
}

impl<T> StoreErrorExt<T> for Result<T, std::io::Error> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Io { source, context: Some(context.into()) })
    }
}

impl<T> StoreErrorExt<T> for Result<T, postcard::Error> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Codec { source, context: Some(context.into()) })
    }
}

impl<T> StoreErrorExt<T> for Result<T, config::ConfigError> {
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Config { source, context: Some(context.into()) })
    }
}

#[allow(clippy::ref_option)]
fn format_context(context: &Option<Cow<'static, str>>) -> Cow<'static, str> {
    context.as_ref().map_or(Cow::Borrowed(""), |c| Cow::Owned(format!(" ({c})")))
}

#[allow(clippy::ref_option)]
fn display_session(session: &Option<SessionId>) -> String {
    session.map_or_else(|| "none".to_owned(), |s| s.to_string())
}

fn summarize(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "no findings recorded".to_owned();
    }
    findings.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
