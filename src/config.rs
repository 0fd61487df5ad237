//src/config.rs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::heatmap::{HeatmapDefaults, BLACKLIST_GENUS_ID, HOST_TAX_ID};
use crate::types::{BackgroundId, TaxId};

pub const DEFAULT_PER_PAGE: usize = 2000;
pub const MAX_PER_PAGE: usize = 10_000;
pub const DEFAULT_TOP_N_PER_SAMPLE: usize = 1000;
pub const DEFAULT_MIN_READS: u64 = 5;
pub const DEFAULT_MAX_TOTAL_TAXA: usize = 10_000;
pub const DEFAULT_SAMPLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Engine settings. Every field has a default, so a config file only needs
/// the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_per_page: usize,
    pub max_per_page: usize,
    pub top_n_per_sample: usize,
    pub min_reads: u64,
    pub max_total_taxa: usize,
    /// Heatmap worker threads; 0 lets rayon decide.
    pub worker_threads: usize,
    pub sample_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    /// 0 disables the response cache.
    pub cache_capacity: usize,
    /// Taxa never shown in heatmaps.
    pub blacklisted_taxa: Vec<TaxId>,
    /// Used when neither the request nor any sample names a background.
    pub default_background_id: Option<BackgroundId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_per_page: DEFAULT_PER_PAGE,
            max_per_page: MAX_PER_PAGE,
            top_n_per_sample: DEFAULT_TOP_N_PER_SAMPLE,
            min_reads: DEFAULT_MIN_READS,
            max_total_taxa: DEFAULT_MAX_TOTAL_TAXA,
            worker_threads: 0,
            sample_timeout_ms: DEFAULT_SAMPLE_TIMEOUT_MS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            blacklisted_taxa: vec![BLACKLIST_GENUS_ID, HOST_TAX_ID],
            default_background_id: None,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        log::info!("Loaded engine config from {}", path.as_ref().display());
        Ok(config.validated())
    }

    /// Repairs settings that would make requests impossible to serve.
    pub fn validated(mut self) -> Self {
        if self.max_per_page == 0 {
            log::warn!("max_per_page 0 is not usable, using {MAX_PER_PAGE}");
            self.max_per_page = MAX_PER_PAGE;
        }
        if self.default_per_page == 0 || self.default_per_page > self.max_per_page {
            self.default_per_page = self.default_per_page.clamp(1, self.max_per_page);
        }
        if self.sample_timeout_ms == 0 {
            log::warn!("sample_timeout_ms 0 is not usable, using {DEFAULT_SAMPLE_TIMEOUT_MS}");
            self.sample_timeout_ms = DEFAULT_SAMPLE_TIMEOUT_MS;
        }
        self
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn heatmap_defaults(&self) -> HeatmapDefaults {
        HeatmapDefaults {
            top_n_per_sample: self.top_n_per_sample,
            min_reads: self.min_reads,
            max_total_taxa: self.max_total_taxa,
            blacklist: self.blacklisted_taxa.clone(),
            default_background_id: self.default_background_id,
        }
    }
}
