//src/service.rs

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use crate::background::{BackgroundStats, BackgroundStore};
use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::counts::CountSource;
use crate::error::{ReportError, Result};
use crate::filter::{
    filter_and_sort, sort_from_param, thresholds_from_operators, thresholds_from_params, FilterOptions,
    OperatorThreshold,
};
use crate::heatmap::{write_heatmap_csv, HeatmapAggregator, HeatmapRequest, HeatmapResponse};
use crate::hierarchy::{build_hierarchy, compute_rows, ExpandPolicy, ReportRow};
use crate::types::{BackgroundId, BackgroundInfo, SampleId, TaxId, TaxLevel};

/// A single-sample report request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportRequest {
    pub sample_id: SampleId,
    /// Falls back to the sample's default background.
    pub background_id: Option<BackgroundId>,
    pub view_level: Option<TaxLevel>,
    pub excluded_categories: Vec<String>,
    /// `"<highest|lowest>_<metric>"`.
    pub sort_by: Option<String>,
    /// `threshold_<metric> -> "<min>,<max>"`.
    pub thresholds: BTreeMap<String, String>,
    pub threshold_filters: Vec<OperatorThreshold>,
    #[serde(deserialize_with = "flag")]
    pub disable_filters: bool,
    /// 1-based.
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub searched_genus: Option<TaxId>,
}

/// Accepts `true`/`false` as well as `0`/`1`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(u8),
        Text(String),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
        Flag::Text(s) => matches!(s.trim(), "1" | "true"),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenusSummary {
    pub tax_id: TaxId,
    pub name: String,
    pub category_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResponse {
    pub rows_passing_filters: usize,
    pub rows_total: usize,
    pub rows: Vec<ReportRow>,
    pub all_genera_in_sample: Vec<GenusSummary>,
}

/// Entry point for report and heatmap requests.
pub struct ReportService {
    source: Arc<dyn CountSource>,
    backgrounds: Arc<dyn BackgroundStore>,
    heatmaps: HeatmapAggregator,
    config: EngineConfig,
    reports: ResponseCache<ReportResponse>,
    heatmap_responses: ResponseCache<HeatmapResponse>,
}

impl ReportService {
    pub fn new(
        source: Arc<dyn CountSource>,
        backgrounds: Arc<dyn BackgroundStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let config = config.validated();
        let heatmaps = HeatmapAggregator::new(
            Arc::clone(&source),
            Arc::clone(&backgrounds),
            config.worker_threads,
            config.sample_timeout(),
            config.heatmap_defaults(),
        )?;
        Ok(Self {
            reports: ResponseCache::new(config.cache_ttl(), config.cache_capacity),
            heatmap_responses: ResponseCache::new(config.cache_ttl(), config.cache_capacity),
            source,
            backgrounds,
            heatmaps,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backgrounds(&self) -> Vec<BackgroundInfo> {
        self.backgrounds.backgrounds()
    }

    /// Normalized, filtered and paged report for one sample.
    pub fn report(&self, request: &ReportRequest) -> Result<Arc<ReportResponse>> {
        let key = ResponseCache::<ReportResponse>::key(&serde_json::to_string(request)?);
        self.reports.get_or_try_insert(key, || self.build_report(request))
    }

    fn build_report(&self, request: &ReportRequest) -> Result<ReportResponse> {
        let started = Instant::now();
        let sample = self.source.sample_counts(request.sample_id)?;

        let background_id = request
            .background_id
            .or(sample.default_background_id)
            .or(self.config.default_background_id);
        let (stats, mass_normalized) = match background_id {
            Some(id) => {
                let info = self
                    .backgrounds
                    .background(id)
                    .ok_or(ReportError::BackgroundModelNotFound(id))?;
                let mut tax_ids: Vec<TaxId> = sample.counts.iter().map(|c| c.tax_id).filter(|&id| id > 0).collect();
                tax_ids.sort_unstable();
                tax_ids.dedup();
                (self.backgrounds.stats(id, &tax_ids)?, info.mass_normalized)
            }
            None => {
                log::warn!("sample {} has no background, z-scores are not meaningful", sample.sample_id);
                (BackgroundStats::new(), false)
            }
        };

        let rows = compute_rows(&sample, &stats, mass_normalized);
        let tree = build_hierarchy(rows, ExpandPolicy { searched_genus: request.searched_genus });

        let mut thresholds = thresholds_from_params(&request.thresholds);
        thresholds.extend(thresholds_from_operators(&request.threshold_filters));
        let per_page = request
            .per_page
            .unwrap_or(self.config.default_per_page)
            .clamp(1, self.config.max_per_page);
        let page = request.page.unwrap_or(1).max(1);
        let options = FilterOptions {
            excluded_categories: request.excluded_categories.clone(),
            thresholds,
            sort: sort_from_param(request.sort_by.as_deref()),
            disable_filters: request.disable_filters,
            view_level: request.view_level.unwrap_or(TaxLevel::Species),
            offset: (page - 1).saturating_mul(per_page),
            max_rows_to_render: per_page,
        };
        let filtered = filter_and_sort(&tree, &options);

        let mut all_genera: Vec<GenusSummary> = tree
            .genera
            .iter()
            .filter(|node| !node.genus.synthetic)
            .map(|node| GenusSummary {
                tax_id: node.genus.tax_id,
                name: node.genus.name.clone(),
                category_name: node.genus.category_name.clone(),
            })
            .collect();
        all_genera.sort_by(|a, b| a.name.cmp(&b.name).then(a.tax_id.cmp(&b.tax_id)));

        log::info!(
            "report for sample {}: {} of {} rows pass, page {} ({} rows) in {:?}",
            request.sample_id,
            filtered.rows_passing_filters,
            filtered.rows_total,
            page,
            filtered.rows.len(),
            started.elapsed()
        );

        Ok(ReportResponse {
            rows_passing_filters: filtered.rows_passing_filters,
            rows_total: filtered.rows_total,
            rows: filtered.rows.into_iter().cloned().collect(),
            all_genera_in_sample: all_genera,
        })
    }

    /// Cross-sample matrix. Per-sample failures are reported inside the response.
    pub fn heatmap(&self, request: &HeatmapRequest) -> Result<Arc<HeatmapResponse>> {
        let key = ResponseCache::<HeatmapResponse>::key(&serde_json::to_string(request)?);
        self.heatmap_responses.get_or_try_insert(key, || {
            let started = Instant::now();
            let response = self.heatmaps.run(request)?;
            log::info!(
                "heatmap over {} samples ({} valid), {} taxa in {:?}",
                response.samples.len(),
                response.valid_samples(),
                response.metadata.union_size,
                started.elapsed()
            );
            Ok(response)
        })
    }

    pub fn heatmap_csv<W: Write>(&self, request: &HeatmapRequest, writer: W) -> Result<()> {
        let response = self.heatmap(request)?;
        write_heatmap_csv(&response, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::InMemoryBackgrounds;
    use crate::counts::InMemoryCounts;
    use crate::hierarchy::tests::{sample, taxon};
    use crate::types::{BackgroundStat, CountType};

    fn service(config: EngineConfig) -> ReportService {
        let mut s = sample(vec![
            taxon(100, TaxLevel::Species, 50, CountType::Nt, 500),
            taxon(50, TaxLevel::Genus, 50, CountType::Nt, 500),
            taxon(300, TaxLevel::Species, 77, CountType::Nt, 20),
        ]);
        s.default_background_id = Some(1);
        let mut counts = InMemoryCounts::new();
        counts.insert(s);

        let mut backgrounds = InMemoryBackgrounds::new();
        backgrounds.add_background(BackgroundInfo { id: 1, name: "default".into(), mass_normalized: false });
        let stat = BackgroundStat { mean: 100.0, stdev: 50.0, mean_mass_normalized: None, stdev_mass_normalized: None };
        backgrounds.insert_stat(1, 100, CountType::Nt, stat);
        backgrounds.insert_stat(1, 50, CountType::Nt, stat);
        ReportService::new(Arc::new(counts), Arc::new(backgrounds), config).unwrap()
    }

    #[test]
    fn falls_back_to_sample_background() {
        let svc = service(EngineConfig::default());
        let response = svc.report(&ReportRequest { sample_id: 1, ..ReportRequest::default() }).unwrap();
        // genus 50 + species 100, synthetic genus + species 300
        assert_eq!(response.rows_total, 4);
        let species = response.rows.iter().find(|r| r.tax_id == 100).unwrap();
        assert_eq!(species.nt.zscore, 8.0);
        assert_eq!(response.all_genera_in_sample.len(), 1);
    }

    #[test]
    fn missing_background_and_sample_are_fatal() {
        let svc = service(EngineConfig::default());
        let bad_bg = ReportRequest { sample_id: 1, background_id: Some(9), ..ReportRequest::default() };
        assert!(matches!(svc.report(&bad_bg), Err(ReportError::BackgroundModelNotFound(9))));
        let bad_sample = ReportRequest { sample_id: 2, ..ReportRequest::default() };
        assert!(matches!(svc.report(&bad_sample), Err(ReportError::SampleNotFound(2))));
    }

    #[test]
    fn per_page_is_capped() {
        let svc = service(EngineConfig { max_per_page: 2, ..EngineConfig::default() });
        let request = ReportRequest { sample_id: 1, per_page: Some(500), ..ReportRequest::default() };
        let response = svc.report(&request).unwrap();
        assert_eq!(response.rows.len(), 2);
        assert_eq!(response.rows_passing_filters, 4);

        let second = svc
            .report(&ReportRequest { page: Some(2), ..request })
            .unwrap();
        assert_eq!(second.rows.len(), 2);
    }

    #[test]
    fn disable_filters_accepts_numeric_flag() {
        let request: ReportRequest =
            serde_json::from_str(r#"{"sample_id": 1, "disable_filters": 1, "thresholds": {"threshold_nt_zscore": "10,"}}"#)
                .unwrap();
        assert!(request.disable_filters);
        let svc = service(EngineConfig::default());
        let response = svc.report(&request).unwrap();
        assert_eq!(response.rows_passing_filters, response.rows_total);
    }
}
