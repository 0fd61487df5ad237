//src/counts.rs

use ahash::AHashMap;
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::background::{parse_error, parse_field};
use crate::error::{ReportError, Result};
use crate::types::{CountType, SampleCounts, SampleId, TaxLevel, TaxonCount};

/// Upstream contract: raw counts and read totals of a sample's latest run.
/// The engine never writes through this.
pub trait CountSource: Send + Sync {
    fn sample_counts(&self, sample_id: SampleId) -> Result<SampleCounts>;
}

/// Samples held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCounts {
    samples: AHashMap<SampleId, SampleCounts>,
}

impl InMemoryCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sample: SampleCounts) {
        self.samples.insert(sample.sample_id, sample);
    }

    pub fn sample_ids(&self) -> Vec<SampleId> {
        let mut ids: Vec<SampleId> = self.samples.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl CountSource for InMemoryCounts {
    fn sample_counts(&self, sample_id: SampleId) -> Result<SampleCounts> {
        let sample = self
            .samples
            .get(&sample_id)
            .ok_or(ReportError::SampleNotFound(sample_id))?;
        if sample.total_reads == 0 && sample.counts.is_empty() {
            return Err(ReportError::SampleDataUnavailable {
                sample_id,
                reason: "pipeline run has no results".into(),
            });
        }
        Ok(sample.clone())
    }
}

/// Opens a plain or `.gz` table for line-oriented reading.
pub fn open_table(path: &Path) -> Result<Box<dyn BufRead>> {
    let f = File::open(path)?;
    let is_gz = path.extension().map(|ext| ext == "gz").unwrap_or(false);
    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };
    Ok(reader)
}

const COLUMNS: usize = 12;

/// Parses one sample's count table:
/// ```text
/// #total_reads=<n>
/// #total_ercc_reads=<n>          (optional)
/// #subsample_fraction=<f>        (optional)
/// #pipeline_run_id=<n>           (optional)
/// #default_background_id=<n>     (optional)
/// tax_id tax_level count_type count percent_identity alignment_length neg_log_e_value percent_concordant name genus_taxid is_phage category
/// ```
/// Columns are tab separated; the header row is recognized by its first field.
pub fn load_sample_counts<P: AsRef<Path>>(sample_id: SampleId, path: P) -> Result<SampleCounts> {
    let reader = open_table(path.as_ref())?;
    let mut sample = SampleCounts {
        sample_id,
        pipeline_run_id: sample_id,
        total_reads: 0,
        total_ercc_reads: 0,
        subsample_fraction: 1.0,
        default_background_id: None,
        counts: Vec::new(),
    };

    for (idx, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(meta) = trimmed.strip_prefix('#') {
            let Some((key, value)) = meta.split_once('=') else {
                continue;
            };
            match key.trim() {
                "total_reads" => sample.total_reads = parse_field(value, line_no, "total_reads")?,
                "total_ercc_reads" => sample.total_ercc_reads = parse_field(value, line_no, "total_ercc_reads")?,
                "subsample_fraction" => sample.subsample_fraction = parse_field(value, line_no, "subsample_fraction")?,
                "pipeline_run_id" => sample.pipeline_run_id = parse_field(value, line_no, "pipeline_run_id")?,
                "default_background_id" => {
                    sample.default_background_id = Some(parse_field(value, line_no, "default_background_id")?)
                }
                other => log::debug!("line {line_no}: ignoring unknown key '{other}'"),
            }
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts[0].trim() == "tax_id" {
            continue;
        }
        if parts.len() < COLUMNS {
            return Err(parse_error(line_no, &format!("expected {COLUMNS} tab-separated fields, got {}", parts.len())));
        }
        sample.counts.push(parse_count_row(&parts, line_no)?);
    }

    log::debug!(
        "sample {}: {} count rows, {} total reads",
        sample_id,
        sample.counts.len(),
        sample.total_reads
    );
    Ok(sample)
}

fn parse_count_row(parts: &[&str], line_no: usize) -> Result<TaxonCount> {
    let tax_level: TaxLevel = parts[1].parse().map_err(|e: String| parse_error(line_no, &e))?;
    let count_type: CountType = parts[2].parse().map_err(|e: String| parse_error(line_no, &e))?;
    let is_phage = matches!(parts[10].trim(), "1" | "true" | "TRUE");
    Ok(TaxonCount {
        tax_id: parse_field(parts[0], line_no, "tax_id")?,
        tax_level,
        count_type,
        count: parse_field(parts[3], line_no, "count")?,
        percent_identity: parse_field(parts[4], line_no, "percent_identity")?,
        alignment_length: parse_field(parts[5], line_no, "alignment_length")?,
        neg_log_e_value: parse_field(parts[6], line_no, "neg_log_e_value")?,
        percent_concordant: parse_field(parts[7], line_no, "percent_concordant")?,
        name: parts[8].trim().to_string(),
        genus_taxid: parse_field(parts[9], line_no, "genus_taxid")?,
        is_phage,
        category_name: parts[11].trim().to_string(),
    })
}

/// Loads every `<sample_id>.tsv` / `<sample_id>.tsv.gz` in a directory.
/// Files whose stem is not a sample id are skipped with a warning.
pub fn load_counts_dir<P: AsRef<Path>>(dir: P) -> Result<InMemoryCounts> {
    let mut source = InMemoryCounts::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().map(|f| f.to_string_lossy().to_string()) else {
            continue;
        };
        let Some(stem) = file_name
            .strip_suffix(".tsv.gz")
            .or_else(|| file_name.strip_suffix(".tsv"))
        else {
            continue;
        };
        match stem.parse::<SampleId>() {
            Ok(sample_id) => source.insert(load_sample_counts(sample_id, &path)?),
            Err(_) => log::warn!("skipping {}: file name is not a sample id", path.display()),
        }
    }
    log::info!("Loaded counts for {} sample(s)", source.samples.len());
    Ok(source)
}
