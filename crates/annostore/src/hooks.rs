//! Extension points the storage core calls into: repair, schema upgrade, validation and
//! initialization. All of them are optional except the initializer, which is supplied per call.

use crate::container::{Container, ContainerData};
use crate::error::StoreResult;
use crate::key::AccessKey;
use crate::mode::AccessMode;
use std::borrow::Cow;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// A single observation produced by a repair analysis or a validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: Cow<'static, str>,
}

impl Finding {
    pub fn new(severity: Severity, message: impl Into<Cow<'static, str>>) -> Self {
        Self { severity, message: message.into() }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Consistency analysis and repair of freshly loaded containers.
pub trait RepairHook: Send + Sync {
    fn analyze(&self, key: &AccessKey, data: &ContainerData) -> Vec<Finding>;

    /// Repairs `data` in place and reports what was done.
    fn repair(&self, key: &AccessKey, data: &mut ContainerData) -> StoreResult<Vec<Finding>>;
}

/// Brings a container up to the current type system of its project.
///
/// Runs inside an isolated nested session in which `container` is registered for exclusive
/// write, so the hook may persist it through the service. Must be idempotent.
pub trait UpgradeHook: Send + Sync {
    /// Returns `true` if the container content changed.
    fn upgrade(&self, container: &Container, key: &AccessKey, mode: AccessMode)
    -> StoreResult<bool>;
}

/// Checks a container before it is persisted. Findings are reported, not enforced.
pub trait Validator: Send + Sync {
    fn validate(&self, key: &AccessKey, data: &ContainerData) -> StoreResult<Vec<Finding>>;
}

/// Supplies initial content for a container that does not exist on durable storage yet.
pub trait Initializer {
    fn initialize(&self, key: &AccessKey) -> StoreResult<ContainerData>;
}

impl<F> Initializer for F
where
    F: Fn(&AccessKey) -> StoreResult<ContainerData>,
{
    fn initialize(&self, key: &AccessKey) -> StoreResult<ContainerData> {
        self(key)
    }
}

pub(crate) fn has_errors(findings: &[Finding]) -> bool {
    findings.iter().any(Finding::is_error)
}

pub(crate) fn log_findings(key: &AccessKey, origin: &'static str, findings: &[Finding]) {
    for finding in findings {
        match finding.severity {
            Severity::Info => info!(%key, origin, message = %finding.message, "Container finding"),
            Severity::Warning => {
                warn!(%key, origin, message = %finding.message, "Container finding");
            },
            Severity::Error => {
                error!(%key, origin, message = %finding.message, "Container finding");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_errors_ignores_warnings() {
        let findings = vec![
            Finding::new(Severity::Info, "checked 3 layers"),
            Finding::new(Severity::Warning, "orphan feature"),
        ];
        assert!(!has_errors(&findings));

        let mut findings = findings;
        findings.push(Finding::new(Severity::Error, "offsets out of range"));
        assert!(has_errors(&findings));
        assert_eq!(findings[2].to_string(), "error: offsets out of range");
    }

    #[test]
    fn test_closures_are_initializers() {
        let init = |key: &AccessKey| {
            Ok::<_, crate::StoreError>(ContainerData::new(1, key.user().as_bytes().to_vec()))
        };
        let data = init.initialize(&AccessKey::document(1, 2, "carol")).unwrap();
        assert_eq!(data.payload, b"carol");
    }
}
