//src/filter.rs

//! Category / threshold filtering, sorting and truncation of one sample's tree.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::ReportError;
use crate::hierarchy::{GenusNode, ReportRow, TaxonTree};
use crate::types::{MetricName, SortDirection, SortSpec, TaxLevel, ThresholdFilter};

pub const THRESHOLD_PREFIX: &str = "threshold_";
/// Excluding this pseudo-category drops phages whatever their category.
pub const PHAGE_SUBCATEGORY: &str = "phage";

/// Everything the engine needs besides the tree itself.
#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub excluded_categories: Vec<String>,
    pub thresholds: Vec<ThresholdFilter>,
    pub sort: SortSpec,
    pub disable_filters: bool,
    pub view_level: TaxLevel,
    pub offset: usize,
    pub max_rows_to_render: usize,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            excluded_categories: Vec::new(),
            thresholds: Vec::new(),
            sort: SortSpec::default(),
            disable_filters: false,
            view_level: TaxLevel::Species,
            offset: 0,
            max_rows_to_render: usize::MAX,
        }
    }
}

/// One page of filtered and sorted rows plus untruncated counts.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredPage<'a> {
    pub rows_total: usize,
    pub rows_passing_filters: usize,
    pub rows: Vec<&'a ReportRow>,
}

impl FilteredPage<'_> {
    /// More rows passed than fit on this page.
    pub fn is_truncated(&self) -> bool {
        self.rows.len() < self.rows_passing_filters
    }
}

struct RowFilter {
    excluded: AHashSet<String>,
    exclude_phage: bool,
    thresholds: Vec<ThresholdFilter>,
}

impl RowFilter {
    fn new(options: &FilterOptions) -> Self {
        let excluded: AHashSet<String> = options
            .excluded_categories
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .collect();
        Self {
            exclude_phage: excluded.contains(PHAGE_SUBCATEGORY),
            excluded,
            thresholds: options.thresholds.clone(),
        }
    }

    fn passes(&self, row: &ReportRow) -> bool {
        if self.excluded.contains(&row.category_name.to_ascii_lowercase()) {
            return false;
        }
        if self.exclude_phage && row.is_phage {
            return false;
        }
        self.thresholds.iter().all(|t| t.accepts(row.value(t.metric)))
    }
}

fn compare_rows(a: &ReportRow, b: &ReportRow, sort: &SortSpec) -> Ordering {
    let by_metric = a.value(sort.metric).total_cmp(&b.value(sort.metric));
    let by_metric = match sort.direction {
        SortDirection::Highest => by_metric.reverse(),
        SortDirection::Lowest => by_metric,
    };
    by_metric.then_with(|| a.tax_id.cmp(&b.tax_id))
}

/// Filters, sorts and pages a tree.
///
/// A species passes when its category is not excluded and every threshold
/// holds. A genus passes only when at least one of its species passes, so a
/// genus with no species rows never survives active filters.
pub fn filter_and_sort<'a>(tree: &'a TaxonTree, options: &FilterOptions) -> FilteredPage<'a> {
    let rows_total = match options.view_level {
        TaxLevel::Species => tree.len(),
        TaxLevel::Genus => tree.genera.len(),
    };

    let row_filter = RowFilter::new(options);
    let mut kept: Vec<(&'a GenusNode, Vec<&'a ReportRow>)> = Vec::with_capacity(tree.genera.len());
    for node in &tree.genera {
        let species: Vec<&ReportRow> = if options.disable_filters {
            node.species.iter().collect()
        } else {
            node.species.iter().filter(|s| row_filter.passes(s)).collect()
        };
        if options.disable_filters || !species.is_empty() {
            kept.push((node, species));
        }
    }

    kept.sort_by(|(a, _), (b, _)| compare_rows(&a.genus, &b.genus, &options.sort));
    for (_, species) in &mut kept {
        species.sort_by(|a, b| compare_rows(a, b, &options.sort));
    }

    let rows_passing_filters = match options.view_level {
        TaxLevel::Species => kept.iter().map(|(_, s)| 1 + s.len()).sum(),
        TaxLevel::Genus => kept.len(),
    };

    let ordered = kept.into_iter().flat_map(|(node, species)| {
        let children = match options.view_level {
            TaxLevel::Species => species,
            TaxLevel::Genus => Vec::new(),
        };
        std::iter::once(&node.genus).chain(children)
    });
    let rows: Vec<&ReportRow> = ordered
        .skip(options.offset)
        .take(options.max_rows_to_render)
        .collect();

    FilteredPage { rows_total, rows_passing_filters, rows }
}

/// Parses `"<min>,<max>"`. Either side may be empty for an open bound.
pub fn parse_range(metric: MetricName, raw: &str) -> Result<ThresholdFilter, ReportError> {
    let malformed = || ReportError::MalformedThreshold { metric: metric.to_string(), raw: raw.to_string() };
    let (min, max) = raw.split_once(',').ok_or_else(malformed)?;
    let bound = |s: &str| -> Result<Option<f64>, ReportError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(malformed)
    };
    let filter = ThresholdFilter { metric, min: bound(min)?, max: bound(max)? };
    if let (Some(lo), Some(hi)) = (filter.min, filter.max) {
        if lo > hi {
            return Err(malformed());
        }
    }
    Ok(filter)
}

/// Normalizes a `threshold_<metric> -> "<min>,<max>"` request map.
///
/// Keys without the prefix are ignored. Unparseable entries are logged and
/// dropped, which leaves that metric unbounded.
pub fn thresholds_from_params(params: &BTreeMap<String, String>) -> Vec<ThresholdFilter> {
    let mut filters = Vec::new();
    for (key, raw) in params {
        let Some(metric_name) = key.strip_prefix(THRESHOLD_PREFIX) else {
            continue;
        };
        let parsed = metric_name
            .parse::<MetricName>()
            .map_err(|_| ReportError::MalformedThreshold { metric: metric_name.to_string(), raw: raw.clone() })
            .and_then(|metric| parse_range(metric, raw));
        match parsed {
            Ok(filter) => filters.push(filter),
            Err(e) => log::warn!("ignoring threshold: {e}"),
        }
    }
    filters
}

/// Threshold as the heatmap view sends it: `{"metric": "NT_zscore", "value": "5", "operator": ">="}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorThreshold {
    pub metric: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub operator: Option<String>,
}

impl OperatorThreshold {
    pub fn normalize(&self) -> Result<ThresholdFilter, ReportError> {
        let malformed = || ReportError::MalformedThreshold { metric: self.metric.clone(), raw: self.value.to_string() };
        let metric: MetricName = self.metric.parse().map_err(|_| malformed())?;
        let value = match &self.value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .ok_or_else(malformed)?;
        match self.operator.as_deref().unwrap_or(">=") {
            ">=" => Ok(ThresholdFilter { metric, min: Some(value), max: None }),
            "<=" => Ok(ThresholdFilter { metric, min: None, max: Some(value) }),
            _ => Err(malformed()),
        }
    }
}

/// Normalizes operator-style thresholds, dropping (and logging) bad ones.
pub fn thresholds_from_operators(raw: &[OperatorThreshold]) -> Vec<ThresholdFilter> {
    raw.iter()
        .filter_map(|t| match t.normalize() {
            Ok(filter) => Some(filter),
            Err(e) => {
                log::warn!("ignoring threshold: {e}");
                None
            }
        })
        .collect()
}

/// Parses a `"<direction>_<metric>"` sort, falling back to the default order.
pub fn sort_from_param(raw: Option<&str>) -> SortSpec {
    match raw.map(str::parse::<SortSpec>) {
        None => SortSpec::default(),
        Some(Ok(sort)) => sort,
        Some(Err(e)) => {
            log::warn!("unknown sort ({e}), using {}", SortSpec::default());
            SortSpec::default()
        }
    }
}
