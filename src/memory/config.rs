//! Configuration types for shared memory segments

use std::{path::PathBuf, time::Duration};

use crate::{
    config::{Config, RecoveryPolicy},
    error::{EaselError, Result},
};

/// Configuration for opening or creating a shared memory segment
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Name of the segment, unique within `root_dir` and `prefix`
    pub name: String,
    /// Size of the user area in bytes (the header is added on top)
    pub size: usize,
    /// Directory holding the backing file
    pub root_dir: PathBuf,
    /// File name prefix
    pub prefix: String,
    /// Permissions for the backing file (Unix permissions)
    pub permissions: u32,
    /// What to do with segments left behind by dead processes
    pub recovery_policy: RecoveryPolicy,
    /// How long to wait for a concurrent creator to publish the header
    pub init_timeout: Duration,
}

impl SegmentConfig {
    /// Create a segment configuration from the global settings
    pub fn new(name: impl Into<String>, size: usize, config: &Config) -> Self {
        Self {
            name: name.into(),
            size,
            root_dir: config.global.root_dir.clone(),
            prefix: config.global.prefix.clone(),
            permissions: 0o600,
            recovery_policy: config.global.recovery_policy,
            init_timeout: config.global.init_timeout,
        }
    }

    /// Set the permissions for the backing file
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Set the recovery policy
    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EaselError::invalid_parameter(
                "name",
                "Segment name cannot be empty",
            ));
        }

        if self.name.contains('/') || self.name.contains('\0') {
            return Err(EaselError::invalid_parameter(
                "name",
                "Segment name must not contain '/' or NUL",
            ));
        }

        if self.size == 0 {
            return Err(EaselError::invalid_parameter(
                "size",
                "Segment size must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Path of the backing file
    pub fn file_path(&self) -> PathBuf {
        self.root_dir.join(format!("{}{}", self.prefix, self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_config_validation() {
        let config = Config::default();
        assert!(SegmentConfig::new("", 64, &config).validate().is_err());
        assert!(SegmentConfig::new("a/b", 64, &config).validate().is_err());
        assert!(SegmentConfig::new("seg", 0, &config).validate().is_err());
        assert!(SegmentConfig::new("seg", 64, &config).validate().is_ok());
    }

    #[test]
    fn test_file_path() {
        let config = Config::default().with_root_dir("/tmp/easel_test");
        let seg = SegmentConfig::new("registry", 64, &config);
        assert_eq!(seg.file_path(), PathBuf::from("/tmp/easel_test/easel_registry"));
    }
}
