//! Configuration management for the SC-D70 bridge
//!
//! Handles loading, parsing, and validation of the YAML configuration file.
//! Every field has a default so a missing file or section is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub timing: TimingConfig,
    pub forwarding: ForwardingConfig,
    pub supervisor: SupervisorConfig,
}

/// USB identity and endpoint layout of the synthesizer
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface carrying the MIDI endpoints
    pub midi_interface: u8,
    pub alt_setting: u8,
    pub endpoint_out: u8,
}

/// Timeouts and intervals
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub forward_write_timeout_ms: u64,
    pub init_write_timeout_ms: u64,
    /// Pause after GS reset before the next command
    pub init_settle_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub stop_join_timeout_ms: u64,
    /// Pause between the stop and start halves of a reconnect
    pub reconnect_delay_ms: u64,
}

/// Forwarding loop sizing
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Events requested per `read` call
    pub read_chunk: usize,
    /// Events buffered by the input port before new ones are dropped
    pub input_buffer: usize,
    /// Upper bound on events drained into one batch
    pub max_batch_events: usize,
    /// Consecutive failed writes before the loop gives up (0 = never)
    pub max_consecutive_write_failures: u32,
}

/// Automatic recovery policy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub auto_reconnect: bool,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0582,
            product_id: 0x000c,
            midi_interface: 2,
            alt_setting: 0,
            endpoint_out: 0x02,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            forward_write_timeout_ms: 10,
            init_write_timeout_ms: 100,
            init_settle_ms: 200,
            poll_interval_ms: 1,
            heartbeat_interval_secs: 60,
            stop_join_timeout_ms: 1000,
            reconnect_delay_ms: 500,
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            read_chunk: 50,
            input_buffer: 4096,
            max_batch_events: 4096,
            max_consecutive_write_failures: 100,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry_base_ms: 250,
            retry_max_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn forward_write_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_write_timeout_ms)
    }

    pub fn init_write_timeout(&self) -> Duration {
        Duration::from_millis(self.init_write_timeout_ms)
    }

    pub fn init_settle(&self) -> Duration {
        Duration::from_millis(self.init_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SupervisorConfig {
    /// Linear backoff, capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = self.retry_base_ms.saturating_mul(attempt.max(1) as u64);
        Duration::from_millis(ms.min(self.retry_max_ms))
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config.validate()?;
        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.device.endpoint_out & 0x80 != 0 {
            anyhow::bail!(
                "endpoint_out 0x{:02X} is an IN endpoint (direction bit set)",
                self.device.endpoint_out
            );
        }

        let timing = &self.timing;
        for (name, value) in [
            ("forward_write_timeout_ms", timing.forward_write_timeout_ms),
            ("init_write_timeout_ms", timing.init_write_timeout_ms),
            ("poll_interval_ms", timing.poll_interval_ms),
            ("heartbeat_interval_secs", timing.heartbeat_interval_secs),
            ("stop_join_timeout_ms", timing.stop_join_timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("timing.{} must be greater than zero", name);
            }
        }

        if self.forwarding.read_chunk == 0 {
            anyhow::bail!("forwarding.read_chunk must be greater than zero");
        }
        if self.forwarding.input_buffer == 0 {
            anyhow::bail!("forwarding.input_buffer must be greater than zero");
        }
        if self.forwarding.max_batch_events < self.forwarding.read_chunk {
            anyhow::bail!(
                "forwarding.max_batch_events ({}) must be at least read_chunk ({})",
                self.forwarding.max_batch_events,
                self.forwarding.read_chunk
            );
        }

        Ok(())
    }
}
