//! Scheduler configuration.
//!
//! Flags are read once per process and cached; the first read wins.
//! A configuration can come from a JSON file named by `ACCEL_SCHED_CONFIG`,
//! with individual fields overridden by `ACCEL_SCHED_<FIELD>` variables:
//!
//! ```text
//! ACCEL_SCHED_CONFIG=/etc/accel_sched.json
//! ACCEL_SCHED_ERT=true
//! ACCEL_SCHED_POLLING_THROTTLE_US=50
//! ```
//!
//! Tests and embedders that need isolation construct a [`SchedConfig`]
//! directly and hand it to [`crate::Runtime::new`].

use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::packet::{CQ_SIZE, MAX_CU_MASKS};
use crate::error::{ExecError, ExecResult};
use crate::scheduler::BackendKind;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "ACCEL_SCHED_CONFIG";

const ENV_PREFIX: &str = "ACCEL_SCHED_";

/// Scheduler configuration flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Use the embedded hardware scheduler (selects the mbs backend).
    pub ert: bool,
    /// Submit through the kernel driver scheduler (selects the kds backend).
    pub kds: bool,
    /// ERT polls CUs instead of waiting for CU interrupts.
    pub polling: bool,
    /// Enable the CU-DMA module of the embedded scheduler.
    pub cudma: bool,
    /// Enable CU-level interrupts.
    pub cuisr: bool,
    /// Enable host to ERT command queue interrupts.
    pub cqint: bool,
    /// Command queue slot size in bytes.
    pub ert_slotsize: u32,
    /// Sleep between idle polling iterations, in microseconds.
    pub polling_throttle_us: u64,
    /// Permit register read/write on kernels opened with shared access.
    pub rw_shared: bool,
    /// Deliver completion notifications on a background worker pool.
    pub threaded_notification: bool,
    /// Number of notification worker threads. The software scheduler always
    /// uses one so that completions of a CU arrive in order.
    pub notify_workers: usize,
    /// Exec buffer size in bytes.
    pub exec_buffer_size: usize,
    /// Bounded timeout used by the kds monitor's device wait.
    pub kds_wait_timeout_ms: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            ert: false,
            kds: false,
            polling: false,
            cudma: true,
            cuisr: false,
            cqint: false,
            ert_slotsize: 0x1000,
            polling_throttle_us: 0,
            rw_shared: false,
            threaded_notification: true,
            notify_workers: 1,
            exec_buffer_size: 4096,
            kds_wait_timeout_ms: 100,
        }
    }
}

impl SchedConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> ExecResult<Self> {
        let config: SchedConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> ExecResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("Loaded scheduler config from {}", path.display());
        Self::from_json_str(&text)
    }

    /// Load from `ACCEL_SCHED_CONFIG` (if set) and apply per-field
    /// environment overrides.
    pub fn from_env() -> ExecResult<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup. Keys are upper-case field names.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ExecResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn flag(key: &str, value: &str) -> ExecResult<bool> {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(true),
                "0" | "false" | "off" | "no" => Ok(false),
                _ => Err(ExecError::InvalidConfig(format!("{key}: expected a boolean, got '{value}'"))),
            }
        }

        fn number<T: std::str::FromStr>(key: &str, value: &str) -> ExecResult<T> {
            let trimmed = value.trim();
            let parsed = match trimmed.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16)
                    .ok()
                    .and_then(|v| v.to_string().parse().ok()),
                None => trimmed.parse().ok(),
            };
            parsed.ok_or_else(|| ExecError::InvalidConfig(format!("{key}: expected a number, got '{value}'")))
        }

        let bools: [(&str, &mut bool); 8] = [
            ("ERT", &mut self.ert),
            ("KDS", &mut self.kds),
            ("POLLING", &mut self.polling),
            ("CUDMA", &mut self.cudma),
            ("CUISR", &mut self.cuisr),
            ("CQINT", &mut self.cqint),
            ("RW_SHARED", &mut self.rw_shared),
            ("THREADED_NOTIFICATION", &mut self.threaded_notification),
        ];
        for (key, slot) in bools {
            if let Some(value) = lookup(key) {
                *slot = flag(key, &value)?;
            }
        }

        if let Some(value) = lookup("ERT_SLOTSIZE") {
            self.ert_slotsize = number("ERT_SLOTSIZE", &value)?;
        }
        if let Some(value) = lookup("POLLING_THROTTLE_US") {
            self.polling_throttle_us = number("POLLING_THROTTLE_US", &value)?;
        }
        if let Some(value) = lookup("NOTIFY_WORKERS") {
            self.notify_workers = number("NOTIFY_WORKERS", &value)?;
        }
        if let Some(value) = lookup("EXEC_BUFFER_SIZE") {
            self.exec_buffer_size = number("EXEC_BUFFER_SIZE", &value)?;
        }
        if let Some(value) = lookup("KDS_WAIT_TIMEOUT_MS") {
            self.kds_wait_timeout_ms = number("KDS_WAIT_TIMEOUT_MS", &value)?;
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> ExecResult<()> {
        if self.ert_slotsize == 0 || self.ert_slotsize % 4 != 0 {
            return Err(ExecError::InvalidConfig(format!(
                "ert_slotsize {:#x} must be a non-zero multiple of 4",
                self.ert_slotsize
            )));
        }
        if self.ert_slotsize as usize > CQ_SIZE {
            return Err(ExecError::InvalidConfig(format!(
                "ert_slotsize {:#x} exceeds command queue size {:#x}",
                self.ert_slotsize, CQ_SIZE
            )));
        }
        let min_exec = (1 + MAX_CU_MASKS) * 4;
        if self.exec_buffer_size < min_exec {
            return Err(ExecError::InvalidConfig(format!(
                "exec_buffer_size {} is smaller than the minimum packet of {} bytes",
                self.exec_buffer_size, min_exec
            )));
        }
        if self.threaded_notification && self.notify_workers == 0 {
            return Err(ExecError::InvalidConfig(
                "threaded notification requires at least one worker".into(),
            ));
        }
        Ok(())
    }

    /// Scheduler backend selected by these flags.
    pub fn backend_kind(&self) -> BackendKind {
        if self.kds {
            BackendKind::Kds
        } else if self.ert {
            BackendKind::Mbs
        } else {
            BackendKind::Sws
        }
    }

    /// Set the ERT flag.
    pub fn with_ert(mut self, ert: bool) -> Self {
        self.ert = ert;
        self
    }

    /// Set the kds flag.
    pub fn with_kds(mut self, kds: bool) -> Self {
        self.kds = kds;
        self
    }

    /// Set the polling throttle.
    pub fn with_polling_throttle_us(mut self, us: u64) -> Self {
        self.polling_throttle_us = us;
        self
    }

    /// Set the command queue slot size.
    pub fn with_slot_size(mut self, bytes: u32) -> Self {
        self.ert_slotsize = bytes;
        self
    }

    /// Enable or disable threaded notification.
    pub fn with_threaded_notification(mut self, threaded: bool) -> Self {
        self.threaded_notification = threaded;
        self
    }

    /// Set the number of notification worker threads.
    pub fn with_notify_workers(mut self, workers: usize) -> Self {
        self.notify_workers = workers;
        self
    }

    /// Permit shared register access.
    pub fn with_rw_shared(mut self, rw_shared: bool) -> Self {
        self.rw_shared = rw_shared;
        self
    }
}

static GLOBAL: OnceLock<SchedConfig> = OnceLock::new();

/// Process-wide configuration, loaded from the environment on first use.
///
/// An invalid environment configuration is logged and replaced by defaults
/// so that later reads stay consistent.
pub fn global() -> &'static SchedConfig {
    GLOBAL.get_or_init(|| match SchedConfig::from_env() {
        Ok(config) => {
            info!("Scheduler config: backend={}", config.backend_kind());
            config
        }
        Err(e) => {
            warn!("Ignoring invalid scheduler config: {}", e);
            SchedConfig::default()
        }
    })
}

/// Install the process-wide configuration. Fails once it has been read.
pub fn set_global(config: SchedConfig) -> ExecResult<()> {
    config.validate()?;
    GLOBAL
        .set(config)
        .map_err(|_| ExecError::InvalidConfig("global configuration already initialized".into()))
}
