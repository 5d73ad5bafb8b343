//! Runtime configuration.
//!
//! # Environment Variable Overrides
//!
//! [`RuntimeConfig::from_env()`] reads:
//!
//! | Field | Environment Variable | Default |
//! |-------|---------------------|---------|
//! | `pool.reserve_bytes` | `ACCEL_POOL_RESERVE_BYTES` | unset (use fraction) |
//! | `pool.reserve_fraction` | `ACCEL_POOL_RESERVE_FRACTION` | 0.5 |
//! | `pool.alignment` | `ACCEL_POOL_ALIGNMENT` | 512 |
//! | `pool.allow_growth` | `ACCEL_POOL_ALLOW_GROWTH` | true |
//! | `pool.growth_bytes` | `ACCEL_POOL_GROWTH_BYTES` | 67,108,864 (64MiB) |
//! | `default_mode` | `ACCEL_MODE` (`host` / `device`) | host |
//! | `random_seed` | `ACCEL_RANDOM_SEED` | unset (entropy) |
//! | `device_id` | `CUDA_VISIBLE_DEVICES` (first entry) | 0 |
//!
//! Unparseable values are ignored and the default is kept.
//!
//! # File Format
//!
//! ```toml
//! default_mode = "device-accelerated"
//! random_seed = 1701
//! device_id = 0
//!
//! [pool]
//! reserve_bytes = 1073741824
//! alignment = 512
//! allow_growth = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionMode;
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::DeviceId;

/// One mebibyte in bytes.
const MIB: usize = 1024 * 1024;

/// Memory pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Fixed per-device reservation. When unset, `reserve_fraction` of the
    /// device's free memory is reserved at initialization.
    pub reserve_bytes: Option<usize>,

    /// Fraction of free device memory to reserve (0.0, 1.0].
    pub reserve_fraction: f64,

    /// Block granularity in bytes. Must be a power of two.
    pub alignment: usize,

    /// Reserve an extra segment when the pool runs out.
    pub allow_growth: bool,

    /// Minimum size of a growth segment.
    pub growth_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reserve_bytes: None,
            reserve_fraction: 0.5,
            alignment: 512,
            allow_growth: true,
            growth_bytes: 64 * MIB,
        }
    }
}

impl PoolConfig {
    /// Bytes to reserve on a device that currently has `free_bytes` free.
    ///
    /// Rounded down to `alignment`, never above `free_bytes`.
    #[must_use]
    pub fn reservation_for(&self, free_bytes: usize) -> usize {
        let wanted = match self.reserve_bytes {
            Some(bytes) => bytes,
            None => (free_bytes as f64 * self.reserve_fraction) as usize,
        };
        let bytes = wanted.min(free_bytes);
        bytes - bytes % self.alignment.max(1)
    }

    /// Validate pool settings.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if:
    /// - `alignment` is zero or not a power of two
    /// - `reserve_fraction` is outside (0.0, 1.0]
    /// - `reserve_bytes` is `Some(0)`
    /// - `allow_growth` is set with `growth_bytes == 0`
    pub fn validate(&self) -> RuntimeResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(RuntimeError::InvalidConfig {
                field: "pool.alignment".into(),
                reason: format!("must be a power of two, got {}", self.alignment),
            });
        }

        if !(self.reserve_fraction > 0.0 && self.reserve_fraction <= 1.0) {
            return Err(RuntimeError::InvalidConfig {
                field: "pool.reserve_fraction".into(),
                reason: format!("must be in (0.0, 1.0], got {}", self.reserve_fraction),
            });
        }

        if self.reserve_bytes == Some(0) {
            return Err(RuntimeError::InvalidConfig {
                field: "pool.reserve_bytes".into(),
                reason: "must be greater than 0 when set".into(),
            });
        }

        if self.allow_growth && self.growth_bytes == 0 {
            return Err(RuntimeError::InvalidConfig {
                field: "pool.growth_bytes".into(),
                reason: "must be greater than 0 when growth is allowed".into(),
            });
        }

        Ok(())
    }
}

/// Top-level runtime configuration.
///
/// # Example
///
/// ```
/// use accel_runtime::RuntimeConfig;
///
/// let config = RuntimeConfig::from_env();
/// config.validate()?;
/// # Ok::<(), accel_runtime::RuntimeError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Mode new execution contexts start in.
    pub default_mode: ExecutionMode,

    /// Seed applied to new execution contexts. Entropy when unset.
    pub random_seed: Option<u64>,

    /// Device new execution contexts bind to.
    pub device_id: DeviceId,

    /// Memory pool settings.
    pub pool: PoolConfig,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// Falls back to default values for any unset or unparseable variable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ACCEL_POOL_RESERVE_BYTES") {
            if let Ok(bytes) = val.trim().parse::<usize>() {
                config.pool.reserve_bytes = Some(bytes);
            }
        }

        if let Ok(val) = std::env::var("ACCEL_POOL_RESERVE_FRACTION") {
            if let Ok(fraction) = val.trim().parse::<f64>() {
                config.pool.reserve_fraction = fraction;
            }
        }

        if let Ok(val) = std::env::var("ACCEL_POOL_ALIGNMENT") {
            if let Ok(alignment) = val.trim().parse::<usize>() {
                config.pool.alignment = alignment;
            }
        }

        if let Ok(val) = std::env::var("ACCEL_POOL_ALLOW_GROWTH") {
            config.pool.allow_growth = matches!(
                val.to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            );
        }

        if let Ok(val) = std::env::var("ACCEL_POOL_GROWTH_BYTES") {
            if let Ok(bytes) = val.trim().parse::<usize>() {
                config.pool.growth_bytes = bytes;
            }
        }

        if let Ok(val) = std::env::var("ACCEL_MODE") {
            match val.to_lowercase().as_str() {
                "host" | "cpu" | "host-only" => config.default_mode = ExecutionMode::HostOnly,
                "device" | "gpu" | "device-accelerated" => {
                    config.default_mode = ExecutionMode::DeviceAccelerated
                }
                _ => {}
            }
        }

        if let Ok(val) = std::env::var("ACCEL_RANDOM_SEED") {
            if let Ok(seed) = val.trim().parse::<u64>() {
                config.random_seed = Some(seed);
            }
        }

        if let Ok(val) = std::env::var("CUDA_VISIBLE_DEVICES") {
            // Comma-separated; take the first
            if let Some(first) = val.split(',').next() {
                if let Ok(id) = first.trim().parse::<u32>() {
                    config.device_id = DeviceId(id);
                }
            }
        }

        config
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::ConfigLoad` if the file cannot be read or parsed
    /// - `RuntimeError::InvalidConfig` if a value fails validation
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RuntimeError::ConfigLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: RuntimeConfig =
            toml::from_str(&content).map_err(|e| RuntimeError::ConfigLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` for the first bad pool setting.
    pub fn validate(&self) -> RuntimeResult<()> {
        self.pool.validate()
    }
}
