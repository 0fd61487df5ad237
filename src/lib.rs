// src/lib.rs
pub mod types;
pub mod error;
pub mod metrics;
pub mod background;
pub mod counts;
pub mod hierarchy;
pub mod filter;
pub mod heatmap;
pub mod cache;
pub mod config;
pub mod service;

use std::path::Path;
use std::sync::Arc;

pub use crate::error::{ReportError, Result};
pub use crate::config::EngineConfig;
pub use crate::heatmap::{HeatmapRequest, HeatmapResponse};
pub use crate::service::{ReportRequest, ReportResponse, ReportService};

use crate::background::load_backgrounds;
use crate::counts::load_counts_dir;

/// Builds a service over on-disk tables:
/// a directory of `<sample_id>.tsv[.gz]` count tables and one background table.
/// Without a config file the defaults apply.
pub fn open_service(
    counts_dir: &Path,
    backgrounds_path: &Path,
    config_path: Option<&Path>,
) -> Result<ReportService> {
    // 1. Configuration
    let config = match config_path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    // 2. Upstream tables
    let counts = load_counts_dir(counts_dir)?;
    let backgrounds = load_backgrounds(backgrounds_path)?;

    ReportService::new(Arc::new(counts), Arc::new(backgrounds), config)
}
