// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for [`BounceDmaManager`](crate::BounceDmaManager).

use page_visibility::PoolReservationSupport;
use reserved_pool_alloc::DEFAULT_SIZE_CLASSES;
use reserved_pool_alloc::SizeClass;
use std::ffi::OsStr;
use std::str::FromStr;
use thiserror::Error;

/// The environment variable overriding [`BounceDmaConfig::reserved_pool`].
pub const RESERVED_POOL_ENV_VAR_NAME: &str = "CVM_DMA_RESERVED_POOL";

/// Whether to reserve a pool of pre-shared bounce buffers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ReservedPoolMode {
    /// Reserve the pool if the platform reports support for it.
    #[default]
    Auto,
    /// Always reserve the pool.
    Enabled,
    /// Never reserve the pool. Every bounce buffer is converted on demand.
    Disabled,
}

impl ReservedPoolMode {
    /// Returns whether the pool should be reserved on a platform reporting
    /// `support`.
    pub fn should_reserve(&self, support: PoolReservationSupport) -> bool {
        match self {
            ReservedPoolMode::Auto => support == PoolReservationSupport::Supported,
            ReservedPoolMode::Enabled => true,
            ReservedPoolMode::Disabled => false,
        }
    }
}

/// Error parsing a [`ReservedPoolMode`].
#[derive(Debug, Error)]
#[error("invalid reserved pool mode {0:?}, expected auto, enabled or disabled")]
pub struct ConfigError(String);

impl FromStr for ReservedPoolMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => ReservedPoolMode::Auto,
            "1" | "on" | "enabled" => ReservedPoolMode::Enabled,
            "0" | "off" | "disabled" => ReservedPoolMode::Disabled,
            _ => return Err(ConfigError(s.to_owned())),
        };
        Ok(mode)
    }
}

/// Bounce-buffer DMA configuration.
#[derive(Debug, Clone)]
pub struct BounceDmaConfig {
    /// Whether to reserve the pre-shared pool.
    pub reserved_pool: ReservedPoolMode,
    /// The pool layout, smallest class first.
    pub size_classes: Vec<SizeClass>,
}

impl Default for BounceDmaConfig {
    fn default() -> Self {
        Self {
            reserved_pool: ReservedPoolMode::Auto,
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
        }
    }
}

impl BounceDmaConfig {
    /// Returns the default configuration with overrides from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_var(std::env::var_os(RESERVED_POOL_ENV_VAR_NAME).as_deref())
    }

    fn from_var(value: Option<&OsStr>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = value {
            config.reserved_pool = value.to_string_lossy().parse()?;
        }
        Ok(config)
    }
}
