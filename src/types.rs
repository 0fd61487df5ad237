//src/types.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type TaxId = i64;
pub type SampleId = u64;
pub type BackgroundId = u64;

/// Taxonomic level of a count row. Only genus and species are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaxLevel {
    Species = 1,
    Genus = 2,
}

impl From<TaxLevel> for u8 {
    fn from(level: TaxLevel) -> u8 {
        level as u8
    }
}

impl TryFrom<u8> for TaxLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaxLevel::Species),
            2 => Ok(TaxLevel::Genus),
            other => Err(format!("unsupported tax level {other}")),
        }
    }
}

impl FromStr for TaxLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "species" => Ok(TaxLevel::Species),
            "2" | "genus" => Ok(TaxLevel::Genus),
            other => Err(format!("unsupported tax level '{other}'")),
        }
    }
}

/// The two alignment databases every taxon is scored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CountType {
    #[serde(rename = "NT")]
    Nt,
    #[serde(rename = "NR")]
    Nr,
}

impl CountType {
    pub const ALL: [CountType; 2] = [CountType::Nt, CountType::Nr];

    /// Lowercase prefix used in metric names (`nt_zscore`).
    pub fn prefix(self) -> &'static str {
        match self {
            CountType::Nt => "nt",
            CountType::Nr => "nr",
        }
    }
}

impl fmt::Display for CountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountType::Nt => write!(f, "NT"),
            CountType::Nr => write!(f, "NR"),
        }
    }
}

impl FromStr for CountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NT" => Ok(CountType::Nt),
            "NR" => Ok(CountType::Nr),
            other => Err(format!("unknown count type '{other}'")),
        }
    }
}

pub const CATEGORY_UNCATEGORIZED: &str = "Uncategorized";

/// One raw row produced upstream for `(pipeline_run, tax_id, tax_level, count_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonCount {
    pub tax_id: TaxId,
    pub tax_level: TaxLevel,
    pub count_type: CountType,
    pub count: u64,
    pub percent_identity: f64,
    pub alignment_length: f64,
    pub neg_log_e_value: f64,
    #[serde(default)]
    pub percent_concordant: f64,
    pub name: String,
    pub genus_taxid: TaxId,
    #[serde(default)]
    pub is_phage: bool,
    pub category_name: String,
}

/// Everything the engine needs from one sample's latest pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub sample_id: SampleId,
    pub pipeline_run_id: u64,
    pub total_reads: u64,
    #[serde(default)]
    pub total_ercc_reads: u64,
    #[serde(default = "default_subsample_fraction")]
    pub subsample_fraction: f64,
    #[serde(default)]
    pub default_background_id: Option<BackgroundId>,
    pub counts: Vec<TaxonCount>,
}

fn default_subsample_fraction() -> f64 {
    1.0
}

impl SampleCounts {
    /// Reads left after removing spike-ins, scaled by the subsampling that
    /// happened before alignment. This is the rpm denominator.
    pub fn adjusted_total_reads(&self) -> f64 {
        let remaining = self.total_reads.saturating_sub(self.total_ercc_reads) as f64;
        remaining * self.subsample_fraction
    }
}

/// Description of a selectable background model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundInfo {
    pub id: BackgroundId,
    pub name: String,
    pub mass_normalized: bool,
}

/// Mean and standard deviation of a taxon's rpm across the reference samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundStat {
    pub mean: f64,
    pub stdev: f64,
    #[serde(default)]
    pub mean_mass_normalized: Option<f64>,
    #[serde(default)]
    pub stdev_mass_normalized: Option<f64>,
}

/// One metric cell of a row for one count type.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CountMetrics {
    pub r: u64,
    pub rpm: f64,
    pub zscore: f64,
    pub aggregatescore: f64,
    pub percentidentity: f64,
    pub alignmentlength: f64,
    pub neglogevalue: f64,
    pub percentconcordant: f64,
}

/// Metrics of a single count type, addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    R,
    Rpm,
    Zscore,
    Aggregatescore,
    Percentidentity,
    Alignmentlength,
    Neglogevalue,
    Percentconcordant,
}

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::R,
        MetricKind::Rpm,
        MetricKind::Zscore,
        MetricKind::Aggregatescore,
        MetricKind::Percentidentity,
        MetricKind::Alignmentlength,
        MetricKind::Neglogevalue,
        MetricKind::Percentconcordant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::R => "r",
            MetricKind::Rpm => "rpm",
            MetricKind::Zscore => "zscore",
            MetricKind::Aggregatescore => "aggregatescore",
            MetricKind::Percentidentity => "percentidentity",
            MetricKind::Alignmentlength => "alignmentlength",
            MetricKind::Neglogevalue => "neglogevalue",
            MetricKind::Percentconcordant => "percentconcordant",
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        // "logevalue" is the heatmap's historical spelling
        let wanted = if wanted == "logevalue" { "neglogevalue".to_string() } else { wanted };
        MetricKind::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| format!("unknown metric '{s}'"))
    }
}

impl CountMetrics {
    pub fn get(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::R => self.r as f64,
            MetricKind::Rpm => self.rpm,
            MetricKind::Zscore => self.zscore,
            MetricKind::Aggregatescore => self.aggregatescore,
            MetricKind::Percentidentity => self.percentidentity,
            MetricKind::Alignmentlength => self.alignmentlength,
            MetricKind::Neglogevalue => self.neglogevalue,
            MetricKind::Percentconcordant => self.percentconcordant,
        }
    }
}

/// A metric as named by callers: `nt_rpm`, `nr_zscore`, or the combined `aggregatescore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    /// `None` only for metrics combining both databases.
    pub count_type: Option<CountType>,
    pub metric: MetricKind,
}

impl MetricName {
    pub fn new(count_type: CountType, metric: MetricKind) -> Self {
        Self { count_type: Some(count_type), metric }
    }

    pub fn aggregate() -> Self {
        Self { count_type: None, metric: MetricKind::Aggregatescore }
    }

    /// Z-scores (and the score built from them) can only be computed once
    /// background stats are known.
    pub fn needs_background(&self) -> bool {
        matches!(self.metric, MetricKind::Zscore | MetricKind::Aggregatescore)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count_type {
            Some(ct) => write!(f, "{}_{}", ct.prefix(), self.metric.as_str()),
            None => write!(f, "{}", self.metric.as_str()),
        }
    }
}

impl FromStr for MetricName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(['_', '.']) {
            Some((ct, metric)) => {
                let count_type: CountType = ct.parse()?;
                let metric: MetricKind = metric.parse()?;
                Ok(MetricName::new(count_type, metric))
            }
            None => match s.parse::<MetricKind>()? {
                MetricKind::Aggregatescore => Ok(MetricName::aggregate()),
                other => Err(format!("metric '{}' needs a count type prefix", other.as_str())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Highest,
    Lowest,
}

/// `min <= value <= max` on one metric. Missing bounds are open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdFilter {
    pub metric: MetricName,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdFilter {
    pub fn accepts(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortSpec {
    pub metric: MetricName,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self { metric: MetricName::aggregate(), direction: SortDirection::Highest }
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            SortDirection::Highest => "highest",
            SortDirection::Lowest => "lowest",
        };
        write!(f, "{}_{}", dir, self.metric)
    }
}

impl FromStr for SortSpec {
    type Err = String;

    /// Parses `"<direction>_<metric>"`, e.g. `highest_nt_rpm`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dir, metric) = s
            .trim()
            .split_once('_')
            .ok_or_else(|| format!("sort '{s}' is not <direction>_<metric>"))?;
        let direction = match dir.to_ascii_lowercase().as_str() {
            "highest" => SortDirection::Highest,
            "lowest" => SortDirection::Lowest,
            other => return Err(format!("unknown sort direction '{other}'")),
        };
        Ok(SortSpec { metric: metric.parse()?, direction })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metric_names() {
        let m: MetricName = "nt_zscore".parse().unwrap();
        assert_eq!(m, MetricName::new(CountType::Nt, MetricKind::Zscore));
        let m: MetricName = "NR.logevalue".parse().unwrap();
        assert_eq!(m, MetricName::new(CountType::Nr, MetricKind::Neglogevalue));
        assert_eq!("aggregatescore".parse::<MetricName>().unwrap(), MetricName::aggregate());
        assert!("rpm".parse::<MetricName>().is_err());
        assert!("xx_rpm".parse::<MetricName>().is_err());
    }

    #[test]
    fn parses_sort_specs() {
        let s: SortSpec = "lowest_nt_zscore".parse().unwrap();
        assert_eq!(s.direction, SortDirection::Lowest);
        assert_eq!(s.metric, MetricName::new(CountType::Nt, MetricKind::Zscore));
        assert_eq!(s.to_string(), "lowest_nt_zscore");
        assert_eq!(SortSpec::default().to_string(), "highest_aggregatescore");
        assert!("sideways_nt_rpm".parse::<SortSpec>().is_err());
    }

    #[test]
    fn adjusted_total_removes_spike_ins() {
        let sample = SampleCounts {
            sample_id: 1,
            pipeline_run_id: 1,
            total_reads: 1_100,
            total_ercc_reads: 100,
            subsample_fraction: 0.5,
            default_background_id: None,
            counts: Vec::new(),
        };
        assert_eq!(sample.adjusted_total_reads(), 500.0);
    }
}
