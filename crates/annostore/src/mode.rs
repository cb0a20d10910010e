use std::fmt;

/// How a caller wants to access a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// The only mode permitting mutation. Exclusive per key and recorded in the session.
    ExclusiveWrite,
    /// Immutable snapshot served from the shared cache. Requires automatic upgrade on load.
    SharedReadOnly,
    /// One-off bypass read. No cache, no session bookkeeping.
    Unmanaged,
    /// Like [`AccessMode::Unmanaged`], but never falls back to an initializer.
    UnmanagedNonInitializing,
}

impl AccessMode {
    /// Whether a session entry held in `self` mode can serve a request for `requested`.
    pub const fn permits(self, requested: Self) -> bool {
        match self {
            Self::ExclusiveWrite => true,
            Self::SharedReadOnly => matches!(requested, Self::SharedReadOnly),
            Self::Unmanaged | Self::UnmanagedNonInitializing => false,
        }
    }

    /// Whether containers read in this mode are recorded in the session ledger.
    pub const fn is_managed(self) -> bool {
        matches!(self, Self::ExclusiveWrite | Self::SharedReadOnly)
    }

    pub const fn allows_initializer(self) -> bool {
        !matches!(self, Self::UnmanagedNonInitializing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExclusiveWrite => "exclusive-write",
            Self::SharedReadOnly => "shared-read-only",
            Self::Unmanaged => "unmanaged",
            Self::UnmanagedNonInitializing => "unmanaged-non-initializing",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the schema-upgrade hook runs when a container is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpgradePolicy {
    #[default]
    Auto,
    Skip,
}
