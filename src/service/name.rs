//! Validated service names

use std::fmt;

use crate::error::{EaselError, Result};

/// Maximum length of a service name in bytes
pub const MAX_SERVICE_NAME_LEN: usize = 128;

/// Name of a service, non-empty and restricted to `[A-Za-z0-9/_.-]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(String);

impl ServiceName {
    /// Validate and wrap a service name
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(EaselError::invalid_service_name(name, "name is empty"));
        }

        if name.len() > MAX_SERVICE_NAME_LEN {
            return Err(EaselError::invalid_service_name(
                name,
                format!("name exceeds {} bytes", MAX_SERVICE_NAME_LEN),
            ));
        }

        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-')))
        {
            return Err(EaselError::invalid_service_name(
                name,
                format!("invalid character {:?}", c),
            ));
        }

        if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return Err(EaselError::invalid_service_name(
                name,
                "empty path component",
            ));
        }

        Ok(Self(name.to_string()))
    }

    /// The name as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable hash used to place the service in the registry
    pub fn hash(&self) -> u32 {
        crc32fast::hash(self.0.as_bytes())
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = EaselError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["MyEventName", "My/Funk/ServiceName", "camera-0.raw_image"] {
            assert_eq!(ServiceName::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_invalid_names() {
        let too_long = "a".repeat(MAX_SERVICE_NAME_LEN + 1);
        for name in ["", "with space", "a//b", "/leading", "trailing/", "ütf", too_long.as_str()] {
            assert!(
                matches!(ServiceName::new(name), Err(EaselError::InvalidServiceName { .. })),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let a = ServiceName::new("sensor/imu").unwrap();
        let b: ServiceName = "sensor/imu".try_into().unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), ServiceName::new("sensor/gps").unwrap().hash());
    }
}
