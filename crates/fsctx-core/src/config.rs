//! Engine configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::FsError;
use crate::filter::EntryFilter;

/// Tunables for one filesystem-operation engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EngineConfig {
    /// Files at least this large may use the two-thread copy pipeline.
    #[builder(default = "4 * 1024 * 1024")]
    pub pipeline_threshold: u64,

    /// Only use the pipeline when source and target are on different devices.
    #[builder(default = "true")]
    pub pipeline_cross_device_only: bool,

    /// Chunk slots shared by the pipeline's reader and writer.
    #[builder(default = "8")]
    pub pipeline_slots: usize,

    /// Buffer size used for the first file copied.
    #[builder(default = "256 * 1024")]
    pub initial_buffer_size: usize,

    /// Smallest buffer the buffer manager shrinks to.
    #[builder(default = "32 * 1024")]
    pub min_buffer_size: usize,

    /// Hard upper bound on the buffer, before the memory-derived ceiling.
    #[builder(default = "8 * 1024 * 1024")]
    pub max_buffer_size: usize,

    /// How long smaller sizes must keep being requested before shrinking.
    #[builder(default = "2000")]
    pub shrink_delay_ms: u64,

    /// Progress coalescing period, also the pipeline's target time per chunk.
    #[builder(default = "250")]
    pub progress_interval_ms: u64,

    /// Carry extended attributes over to copies.
    #[builder(default = "true")]
    pub copy_attributes: bool,

    /// Extended attributes never copied.
    #[builder(default)]
    pub excluded_attributes: Vec<String>,

    /// Carry modification and access times over to copies.
    #[builder(default = "true")]
    pub preserve_timestamps: bool,

    /// Carry permission bits over to copies.
    #[builder(default = "true")]
    pub preserve_permissions: bool,

    /// Names excluded from every walk (glob syntax).
    #[builder(default)]
    pub ignore_patterns: Vec<String>,

    /// Include entries whose names start with `.`.
    #[builder(default = "true")]
    pub include_hidden: bool,

    /// Explicit trash directories, at most one per volume.
    #[builder(default)]
    pub trash_dirs: Vec<PathBuf>,

    /// Look for a trash on every mounted volume when none is configured.
    #[builder(default = "true")]
    pub discover_volume_trash: bool,

    /// Pause a new operation while an earlier one touches the same devices.
    #[builder(default = "false")]
    pub auto_pause: bool,
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let min = self.min_buffer_size.unwrap_or(32 * 1024);
        let max = self.max_buffer_size.unwrap_or(8 * 1024 * 1024);
        if min == 0 || min > max {
            return Err(format!("buffer bounds {min}..{max} are invalid"));
        }
        if self.pipeline_slots.is_some_and(|slots| slots < 2) {
            return Err("pipeline needs at least 2 slots".to_string());
        }
        if self.progress_interval_ms == Some(0) {
            return Err("progress interval cannot be zero".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FsError::io(path, e))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| FsError::InvalidConfig {
            message: format!("{}: {e}", path.display()),
        })?;
        config.check()?;
        Ok(config)
    }

    /// Validate a config that did not come through the builder.
    pub fn check(&self) -> Result<(), FsError> {
        EngineConfigBuilder::default()
            .min_buffer_size(self.min_buffer_size)
            .max_buffer_size(self.max_buffer_size)
            .pipeline_slots(self.pipeline_slots)
            .progress_interval_ms(self.progress_interval_ms)
            .validate()
            .map_err(|message| FsError::InvalidConfig { message })
    }

    /// Delay before an oversized buffer is shrunk.
    pub fn shrink_delay(&self) -> Duration {
        Duration::from_millis(self.shrink_delay_ms)
    }

    /// Progress coalescing period.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Exclude filter built from `ignore_patterns` and `include_hidden`.
    ///
    /// Returns `None` when nothing is excluded.
    pub fn entry_filter(&self) -> Result<Option<EntryFilter>, FsError> {
        if self.ignore_patterns.is_empty() && self.include_hidden {
            return Ok(None);
        }
        EntryFilter::from_patterns(&self.ignore_patterns, self.include_hidden).map(Some)
    }

    /// Check whether an extended attribute should be left behind.
    pub fn is_attribute_excluded(&self, name: &str) -> bool {
        self.excluded_attributes.iter().any(|excluded| excluded == name)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline_threshold: 4 * 1024 * 1024,
            pipeline_cross_device_only: true,
            pipeline_slots: 8,
            initial_buffer_size: 256 * 1024,
            min_buffer_size: 32 * 1024,
            max_buffer_size: 8 * 1024 * 1024,
            shrink_delay_ms: 2000,
            progress_interval_ms: 250,
            copy_attributes: true,
            excluded_attributes: Vec::new(),
            preserve_timestamps: true,
            preserve_permissions: true,
            ignore_patterns: Vec::new(),
            include_hidden: true,
            trash_dirs: Vec::new(),
            discover_volume_trash: true,
            auto_pause: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .pipeline_threshold(1024u64)
            .pipeline_slots(4usize)
            .trash_dirs(vec![PathBuf::from("/tmp/trash")])
            .build()
            .unwrap();

        assert_eq!(config.pipeline_threshold, 1024);
        assert_eq!(config.pipeline_slots, 4);
        assert!(config.pipeline_cross_device_only);
        assert_eq!(config.trash_dirs.len(), 1);
    }

    #[test]
    fn test_builder_matches_default() {
        let built = EngineConfig::builder().build().unwrap();
        let default = EngineConfig::default();
        assert_eq!(built.max_buffer_size, default.max_buffer_size);
        assert_eq!(built.progress_interval_ms, default.progress_interval_ms);
        assert_eq!(built.include_hidden, default.include_hidden);
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::builder()
            .min_buffer_size(1024usize)
            .max_buffer_size(512usize)
            .build()
            .is_err());
        assert!(EngineConfig::builder().pipeline_slots(1usize).build().is_err());
        assert!(EngineConfig::builder().progress_interval_ms(0u64).build().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("fsctx.json");
        std::fs::write(&file, r#"{ "pipeline_slots": 3, "auto_pause": true }"#).unwrap();

        let config = EngineConfig::load(&file).unwrap();
        assert_eq!(config.pipeline_slots, 3);
        assert!(config.auto_pause);
        assert_eq!(config.min_buffer_size, 32 * 1024);
    }

    #[test]
    fn test_entry_filter() {
        assert!(EngineConfig::default().entry_filter().unwrap().is_none());

        let config = EngineConfig {
            ignore_patterns: vec!["*.o".to_string()],
            ..Default::default()
        };
        assert!(config.entry_filter().unwrap().is_some());
    }
}
