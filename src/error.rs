//! Error types and handling for Easel

/// Result type alias for Easel operations
pub type Result<T> = std::result::Result<T, EaselError>;

/// Coarse classification of every [`EaselError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Incompatible type, version, kind or name; never auto-coerced
    Compatibility,
    /// Pool, port or registry capacity reached; the caller may retry later
    ResourceExhaustion,
    /// A stale resource was found and recovery is disabled by configuration
    Recovery,
    /// Shutdown was requested through a signal
    Shutdown,
    /// OS level failure or invalid usage
    Fatal,
}

/// Comprehensive error types for the Easel middleware
#[derive(Debug, thiserror::Error)]
pub enum EaselError {
    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Memory mapping or layout failures
    #[error("Memory error: {message}")]
    Memory { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Configuration file could not be parsed
    #[error("Config error: {message}")]
    Config { message: String },

    /// Segment header carries another magic, version or size
    #[error("Incompatible version of segment {name}: expected {expected}, got {actual}")]
    IncompatibleVersion {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// A segment of the same name exists with another layout
    #[error("Segment {name} already exists with an incompatible layout")]
    AlreadyExistsIncompatible { name: String },

    /// Service exists with another payload or user header type
    #[error("Incompatible type for service {service}: {detail}")]
    IncompatibleType { service: String, detail: String },

    /// Service exists with another messaging pattern
    #[error("Service {service} exists as {existing}, requested {requested}")]
    IncompatibleKind {
        service: String,
        existing: String,
        requested: String,
    },

    /// Access to the backing OS resource was denied
    #[error("Permission denied: {name}")]
    PermissionDenied { name: String },

    /// Not enough space for the backing OS resource
    #[error("Out of space while creating {name} ({requested} bytes)")]
    OutOfSpace { name: String, requested: usize },

    /// Service names must be non-empty and from a restricted character set
    #[error("Invalid service name {name:?}: {reason}")]
    InvalidServiceName { name: String, reason: String },

    /// All publisher ports of the service are in use
    #[error("Too many publishers for service {service} (max {max})")]
    TooManyPublishers { service: String, max: usize },

    /// All subscriber ports of the service are in use
    #[error("Too many subscribers for service {service} (max {max})")]
    TooManySubscribers { service: String, max: usize },

    /// Every holder record of the registry entry is in use
    #[error("Too many open handles for service {service} (max {max})")]
    TooManyHandles { service: String, max: usize },

    /// All notifier ports of the service are in use
    #[error("Too many notifiers for service {service} (max {max})")]
    TooManyNotifiers { service: String, max: usize },

    /// All listener ports of the service are in use
    #[error("Too many listeners for service {service} (max {max})")]
    TooManyListeners { service: String, max: usize },

    /// No service of that name and kind exists
    #[error("Service {service} does not exist")]
    ServiceNotFound { service: String },

    /// A service of that name exists although creation was requested
    #[error("Service {service} already exists")]
    ServiceAlreadyExists { service: String },

    /// The registry has no free entry left
    #[error("Service registry is full (capacity {capacity})")]
    RegistryFull { capacity: usize },

    /// No free slot left in the sample pool
    #[error("Pool exhausted: all {capacity} slots are in use")]
    PoolExhausted { capacity: usize },

    /// A publisher holds its maximum number of loaned samples
    #[error("Publisher exceeds its maximum of {max} loans")]
    ExceedsMaxLoans { max: usize },

    /// A slice loan exceeds the maximum slice length of the service
    #[error("Slice length {requested} exceeds the maximum of {max}")]
    SliceTooLong { requested: usize, max: usize },

    /// Event id outside of the configured range
    #[error("Invalid event id {id} (max {max})")]
    InvalidEventId { id: usize, max: usize },

    /// A segment left behind by dead processes and recovery is disabled
    #[error("Stale segment {name} requires manual cleanup")]
    StaleSegment { name: String },

    /// The service the port belongs to is no longer usable
    #[error("Connection broken: {message}")]
    ConnectionBroken { message: String },

    /// A shutdown signal was received
    #[error("Terminated by shutdown request")]
    Terminated,

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl EaselError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an incompatible type error
    pub fn incompatible_type(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IncompatibleType {
            service: service.into(),
            detail: detail.into(),
        }
    }

    /// Create an invalid service name error
    pub fn invalid_service_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidServiceName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection broken error
    pub fn connection_broken(message: impl Into<String>) -> Self {
        Self::ConnectionBroken {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IncompatibleVersion { .. }
            | Self::AlreadyExistsIncompatible { .. }
            | Self::IncompatibleType { .. }
            | Self::IncompatibleKind { .. }
            | Self::InvalidServiceName { .. }
            | Self::InvalidEventId { .. }
            | Self::SliceTooLong { .. }
            | Self::ServiceAlreadyExists { .. } => ErrorKind::Compatibility,
            Self::TooManyPublishers { .. }
            | Self::TooManySubscribers { .. }
            | Self::TooManyNotifiers { .. }
            | Self::TooManyListeners { .. }
            | Self::TooManyHandles { .. }
            | Self::RegistryFull { .. }
            | Self::PoolExhausted { .. }
            | Self::ExceedsMaxLoans { .. } => ErrorKind::ResourceExhaustion,
            Self::StaleSegment { .. } => ErrorKind::Recovery,
            Self::Terminated => ErrorKind::Shutdown,
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhaustion
    }
}

// Convert from common error types
impl From<std::io::Error> for EaselError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<nix::Error> for EaselError {
    fn from(err: nix::Error) -> Self {
        Self::platform(format!("System call failed: {}", err))
    }
}

impl From<toml::de::Error> for EaselError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EaselError::memory("Out of memory");
        assert!(matches!(err, EaselError::Memory { .. }));

        let err = EaselError::invalid_service_name("", "empty");
        assert!(matches!(err, EaselError::InvalidServiceName { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = EaselError::PoolExhausted { capacity: 4 };
        let display = format!("{}", err);
        assert!(display.contains("Pool exhausted"));
        assert!(display.contains('4'));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            EaselError::incompatible_type("svc", "size").kind(),
            ErrorKind::Compatibility
        );
        assert!(EaselError::PoolExhausted { capacity: 1 }.is_recoverable());
        assert!(EaselError::TooManySubscribers {
            service: "svc".into(),
            max: 1
        }
        .is_recoverable());
        assert!(!EaselError::Terminated.is_recoverable());
        assert_eq!(
            EaselError::StaleSegment { name: "x".into() }.kind(),
            ErrorKind::Recovery
        );
    }
}
