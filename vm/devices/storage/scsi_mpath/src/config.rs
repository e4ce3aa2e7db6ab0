// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stack-wide limits and retry policy.

use thiserror::Error;

const DEFAULT_MAX_PATHS: usize = 1024;
const DEFAULT_MAX_DEVICES: usize = 256;
const DEFAULT_MAX_INFLIGHT: usize = 4096;
const DEFAULT_QUEUE_DEPTH: u32 = 32;
const DEFAULT_TRANSIENT_RETRIES: u32 = 10;
const DEFAULT_ERROR_RETRIES: u32 = 3;
const DEFAULT_PROBE_RETRIES: u32 = 3;

/// Caller-supplied overrides. Unset fields take the defaults in
/// [`StackConfig`].
#[derive(Debug, Clone, Default)]
pub struct StackParameters {
    /// Maximum number of paths in the path table.
    pub max_paths: Option<usize>,
    /// Maximum number of allocated device slots.
    pub max_devices: Option<usize>,
    /// Maximum number of commands in flight across all paths.
    pub max_inflight: Option<usize>,
    /// Queue depth given to newly registered devices.
    pub default_queue_depth: Option<u32>,
    /// Retry bound for busy and transient completions.
    pub transient_retries: Option<u32>,
    /// Retry bound for generic errors and failover requeues.
    pub error_retries: Option<u32>,
    /// Retry bound for asynchronous probes.
    pub probe_retries: Option<u32>,
}

/// Resolved stack configuration.
#[derive(Debug, Clone)]
#[expect(missing_docs)] // mirrors StackParameters
pub struct StackConfig {
    pub max_paths: usize,
    pub max_devices: usize,
    pub max_inflight: usize,
    pub default_queue_depth: u32,
    pub transient_retries: u32,
    pub error_retries: u32,
    pub probe_retries: u32,
}

/// Invalid [`StackParameters`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A limit was set to zero.
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl StackParameters {
    /// Applies defaults and validates the limits.
    pub fn resolve(self) -> Result<StackConfig, ConfigError> {
        let StackParameters {
            max_paths,
            max_devices,
            max_inflight,
            default_queue_depth,
            transient_retries,
            error_retries,
            probe_retries,
        } = self;

        let config = StackConfig {
            max_paths: max_paths.unwrap_or(DEFAULT_MAX_PATHS),
            max_devices: max_devices.unwrap_or(DEFAULT_MAX_DEVICES),
            max_inflight: max_inflight.unwrap_or(DEFAULT_MAX_INFLIGHT),
            default_queue_depth: default_queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            transient_retries: transient_retries.unwrap_or(DEFAULT_TRANSIENT_RETRIES),
            error_retries: error_retries.unwrap_or(DEFAULT_ERROR_RETRIES),
            probe_retries: probe_retries.unwrap_or(DEFAULT_PROBE_RETRIES),
        };

        if config.max_paths == 0 {
            return Err(ConfigError::Zero("max_paths"));
        }
        if config.max_devices == 0 {
            return Err(ConfigError::Zero("max_devices"));
        }
        if config.max_inflight == 0 {
            return Err(ConfigError::Zero("max_inflight"));
        }
        if config.default_queue_depth == 0 {
            return Err(ConfigError::Zero("default_queue_depth"));
        }
        Ok(config)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_paths: DEFAULT_MAX_PATHS,
            max_devices: DEFAULT_MAX_DEVICES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            default_queue_depth: DEFAULT_QUEUE_DEPTH,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
            error_retries: DEFAULT_ERROR_RETRIES,
            probe_retries: DEFAULT_PROBE_RETRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_and_defaults() {
        let config = StackParameters {
            max_inflight: Some(8),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.max_inflight, 8);
        assert_eq!(config.max_paths, StackConfig::default().max_paths);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = StackParameters {
            default_queue_depth: Some(0),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("default_queue_depth")));
    }
}
