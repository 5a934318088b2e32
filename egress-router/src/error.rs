//! Error types for the egress-router plugin.

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a single kernel capability call (link, address, route,
/// sysctl, firewall or namespace operation).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// The object the operation targets does not exist.
    #[error("{0}: not found")]
    NotFound(String),

    /// The object the operation would create already exists.
    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// Any other kernel or tool failure.
    #[error("{0}")]
    Other(String),
}

impl KernelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Errors surfaced by ADD/CHECK/DEL.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input errors (no kernel mutation attempted)
    // =========================================================================
    /// Malformed or contradictory configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A destination entry could not be parsed.
    #[error("invalid destination {spec:?}: {reason}")]
    InvalidDestination { spec: String, reason: String },

    /// A required default could not be determined from host state.
    #[error("{0}")]
    Resolution(String),

    // =========================================================================
    // Kernel mutation errors
    // =========================================================================
    /// Interface creation, move or rename failed.
    #[error("failed to provision interface {target:?}: {reason}")]
    Provisioning { target: String, reason: String },

    /// Address, route or sysctl programming failed after the interface exists.
    #[error("failed to configure {target:?}: {reason}")]
    Configuration { target: String, reason: String },

    /// Firewall rule installation failed.
    #[error("failed to install NAT rules: {0}")]
    Nat(String),

    /// A network namespace could not be opened, entered or restored.
    #[error("network namespace {path:?}: {source}")]
    Namespace {
        path: String,
        #[source]
        source: KernelError,
    },
}

impl Error {
    pub(crate) fn provisioning(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Provisioning {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn configuration(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Configuration {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// CNI error code reported to the runtime.
    pub fn code(&self) -> u32 {
        match self {
            Self::Config(_) | Self::InvalidDestination { .. } => 7,
            Self::Namespace { source, .. } if source.is_not_found() => 3,
            _ => 100,
        }
    }
}
