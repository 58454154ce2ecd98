//! Recognized configuration options for the duplication core.
//!
//! `g_config` and the process-wide command-manager are external,
//! process-wide singletons (see design notes); this crate only owns its
//! own slice of configuration, loaded the way `kimberlite-config` layers
//! defaults under a project file under environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DuplicationError, Result};

/// Options recognized by the duplication core.
///
/// All fields have defaults matching the values documented in the design
/// doc's "Recognized configuration options" table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicationOptions {
    /// Period of the host's duplication-sync timer.
    pub duplication_sync_interval_ms: u64,

    /// Size of the batch's sliding (prepare-list) window.
    pub prepare_list_capacity: usize,

    /// Delay before retrying when no further log file is available.
    pub rotation_probe_delay_ms: u64,

    /// Backoff on a remote transport error while shipping.
    pub ship_retry_delay_ms: u64,

    /// Delay when the batch is empty and there are no new commits on disk.
    pub idle_poll_delay_ms: u64,

    /// Pacing delay between successive successful ships.
    pub inter_batch_delay_ms: u64,
}

impl Default for DuplicationOptions {
    fn default() -> Self {
        Self {
            duplication_sync_interval_ms: 10_000,
            prepare_list_capacity: 200,
            rotation_probe_delay_ms: 10_000,
            ship_retry_delay_ms: 1_000,
            idle_poll_delay_ms: 10_000,
            inter_batch_delay_ms: 1_000,
        }
    }
}

impl DuplicationOptions {
    pub fn duplication_sync_interval(&self) -> Duration {
        Duration::from_millis(self.duplication_sync_interval_ms)
    }

    pub fn rotation_probe_delay(&self) -> Duration {
        Duration::from_millis(self.rotation_probe_delay_ms)
    }

    pub fn ship_retry_delay(&self) -> Duration {
        Duration::from_millis(self.ship_retry_delay_ms)
    }

    pub fn idle_poll_delay(&self) -> Duration {
        Duration::from_millis(self.idle_poll_delay_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    /// Loads options by layering a TOML file's `[duplication]` table over
    /// the built-in defaults. Missing files are not an error — the caller
    /// gets defaults, matching `ConfigLoader::load_or_default` upstream.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let defaults = Self::default();

        if !path.exists() {
            return Ok(defaults);
        }

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults).map_err(|e| {
                DuplicationError::Fatal(format!("invalid default duplication options: {e}"))
            })?)
            .add_source(
                config::File::from(path.to_path_buf())
                    .required(false)
                    .format(config::FileFormat::Toml),
            );

        let built = builder
            .build()
            .map_err(|e| DuplicationError::Fatal(format!("failed to build config: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| DuplicationError::Fatal(format!("failed to deserialize config: {e}")))
    }
}
