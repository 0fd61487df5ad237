use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use taxon_report::background::{BackgroundStats, BackgroundStore, InMemoryBackgrounds};
use taxon_report::counts::{CountSource, InMemoryCounts};
use taxon_report::types::{
    BackgroundId, BackgroundInfo, BackgroundStat, CountType, SampleCounts, SampleId, TaxId, TaxLevel, TaxonCount,
};
use taxon_report::{EngineConfig, HeatmapRequest, ReportError, ReportService, Result};

/// Records every `stats` call so tests can check what was looked up.
struct CountingBackgrounds {
    inner: InMemoryBackgrounds,
    calls: Mutex<Vec<Vec<TaxId>>>,
}

impl BackgroundStore for CountingBackgrounds {
    fn backgrounds(&self) -> Vec<BackgroundInfo> {
        self.inner.backgrounds()
    }

    fn stats(&self, id: BackgroundId, tax_ids: &[TaxId]) -> Result<BackgroundStats> {
        self.calls.lock().push(tax_ids.to_vec());
        self.inner.stats(id, tax_ids)
    }
}

/// Fails for one sample id, delegates otherwise.
struct FlakySource {
    inner: InMemoryCounts,
    broken: SampleId,
}

impl CountSource for FlakySource {
    fn sample_counts(&self, sample_id: SampleId) -> Result<SampleCounts> {
        if sample_id == self.broken {
            return Err(ReportError::SampleDataUnavailable { sample_id, reason: "pipeline failed".into() });
        }
        self.inner.sample_counts(sample_id)
    }
}

/// Answers one sample id only after a delay.
struct SlowSource {
    inner: InMemoryCounts,
    slow: SampleId,
    delay: Duration,
}

impl CountSource for SlowSource {
    fn sample_counts(&self, sample_id: SampleId) -> Result<SampleCounts> {
        if sample_id == self.slow {
            thread::sleep(self.delay);
        }
        self.inner.sample_counts(sample_id)
    }
}

fn row(tax_id: TaxId, count: u64) -> TaxonCount {
    TaxonCount {
        tax_id,
        tax_level: TaxLevel::Species,
        count_type: CountType::Nt,
        count,
        percent_identity: 98.0,
        alignment_length: 120.0,
        neg_log_e_value: 20.0,
        percent_concordant: 0.0,
        name: format!("species {tax_id}"),
        genus_taxid: 7,
        is_phage: false,
        category_name: "Bacteria".into(),
    }
}

fn counts() -> InMemoryCounts {
    let mut counts = InMemoryCounts::new();
    for sample_id in 1..=5u64 {
        // every sample shares taxon 1000 and has two of its own
        let own = sample_id as TaxId * 100;
        counts.insert(SampleCounts {
            sample_id,
            pipeline_run_id: sample_id + 10,
            total_reads: 1_000_000,
            total_ercc_reads: 0,
            subsample_fraction: 1.0,
            default_background_id: Some(1),
            counts: vec![row(1000, 900), row(own, 50 + sample_id), row(own + 1, 40)],
        });
    }
    counts
}

fn backgrounds() -> Arc<CountingBackgrounds> {
    let mut inner = InMemoryBackgrounds::new();
    inner.add_background(BackgroundInfo { id: 1, name: "reference".into(), mass_normalized: false });
    inner.insert_stat(
        1,
        1000,
        CountType::Nt,
        BackgroundStat { mean: 10.0, stdev: 5.0, mean_mass_normalized: None, stdev_mass_normalized: None },
    );
    Arc::new(CountingBackgrounds { inner, calls: Mutex::new(Vec::new()) })
}

fn request() -> HeatmapRequest {
    HeatmapRequest { sample_ids: vec![1, 2, 3, 4, 5], ..HeatmapRequest::default() }
}

#[test]
fn one_failing_sample_does_not_spoil_the_batch() {
    let source = FlakySource { inner: counts(), broken: 3 };
    let service = ReportService::new(Arc::new(source), backgrounds(), EngineConfig::default()).unwrap();
    let response = service.heatmap(&request()).unwrap();

    assert_eq!(response.samples.len(), 5);
    assert_eq!(response.valid_samples(), 4);
    let failed: Vec<_> = response.samples.iter().filter(|s| s.error.is_some()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sample_id, 3);
    assert!(!response.results.contains_key(&3));
    assert_eq!(response.results.len(), 4);
    for sample_id in [1, 2, 4, 5] {
        assert!(response.results[&sample_id].contains_key(&1000));
    }
}

#[test]
fn background_is_fetched_once_for_exactly_the_union() {
    let bgs = backgrounds();
    let service = ReportService::new(Arc::new(counts()), bgs.clone(), EngineConfig::default()).unwrap();
    let response = service.heatmap(&request()).unwrap();

    let calls = bgs.calls.lock();
    assert_eq!(calls.len(), 1);
    // 1000 plus two own taxa per sample
    assert_eq!(response.metadata.union_size, 11);
    assert_eq!(calls[0].len(), response.metadata.union_size);
    assert_eq!(response.taxa.len(), 11);
}

#[test]
fn total_taxa_cap_reports_effective_rank() {
    let config = EngineConfig { max_total_taxa: 3, ..EngineConfig::default() };
    let bgs = backgrounds();
    let service = ReportService::new(Arc::new(counts()), bgs.clone(), config).unwrap();
    let response = service.heatmap(&request()).unwrap();

    // rank 1 is {1000} everywhere, rank 2 adds the five own taxa
    assert_eq!(response.metadata.effective_top_rank, Some(2));
    assert_eq!(response.metadata.union_size, 6);
    assert!(response.metadata.capped);
    assert_eq!(bgs.calls.lock()[0].len(), 6);
}

#[test]
fn repeated_request_is_served_from_cache() {
    let bgs = backgrounds();
    let service = ReportService::new(Arc::new(counts()), bgs.clone(), EngineConfig::default()).unwrap();
    let first = service.heatmap(&request()).unwrap();
    let second = service.heatmap(&request()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(bgs.calls.lock().len(), 1);

    let other_background = HeatmapRequest { background_id: Some(1), ..request() };
    service.heatmap(&other_background).unwrap();
    assert_eq!(bgs.calls.lock().len(), 2);
}

#[test]
fn csv_export_rows() {
    let service = ReportService::new(Arc::new(counts()), backgrounds(), EngineConfig::default()).unwrap();
    let mut out = Vec::new();
    service.heatmap_csv(&request(), &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    // header + 5 samples x 3 taxa
    assert_eq!(text.lines().count(), 16);
}

#[test]
fn slow_sample_is_marked_timed_out() {
    let source = SlowSource { inner: counts(), slow: 2, delay: Duration::from_millis(1500) };
    let config = EngineConfig { worker_threads: 8, sample_timeout_ms: 200, ..EngineConfig::default() };
    let service = ReportService::new(Arc::new(source), backgrounds(), config).unwrap();

    let started = Instant::now();
    let response = service.heatmap(&request()).unwrap();
    assert!(started.elapsed() < Duration::from_millis(1000), "took {:?}", started.elapsed());

    assert_eq!(response.valid_samples(), 4);
    let late = response.samples.iter().find(|s| s.sample_id == 2).unwrap();
    assert_eq!(late.error.as_deref(), Some("sample 2 did not finish within 200 ms"));
    assert!(!response.results.contains_key(&2));
}
