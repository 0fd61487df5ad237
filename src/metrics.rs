//src/metrics.rs

//! Per-taxon normalization against a background model.
//!
//! Everything here is a pure function of raw counts, the sample's read total
//! and the background statistics, so switching background only means running
//! these again.

use crate::types::{BackgroundStat, CountMetrics, TaxonCount};

/// Z-score for a taxon present in the sample whose background has zero variance.
pub const ZSCORE_ZERO_VARIANCE: f64 = 1_000_000.0;
/// Z-score for a taxon the background has never seen.
pub const ZSCORE_ABSENT_FROM_BACKGROUND: f64 = 100.0;
/// Marker for a metric that could not be computed (e.g. no NR row for the taxon).
pub const NOT_COMPUTED: f64 = -100.0;
pub const ZSCORE_MIN: f64 = -99.0;
pub const ZSCORE_MAX: f64 = 99.0;

/// Reads per million. A zero total yields 0 instead of a division error.
pub fn rpm(count: Option<u64>, total_reads: f64) -> f64 {
    match count {
        Some(count) if total_reads > 0.0 => count as f64 * 1_000_000.0 / total_reads,
        _ => 0.0,
    }
}

/// Deviation of `rpm` from the background mean in background stdev units.
///
/// Ordinary values are clamped to `[ZSCORE_MIN, ZSCORE_MAX]` so the
/// zero-variance sentinel always ranks above any real outlier.
pub fn zscore(rpm: Option<f64>, mean: f64, stdev: f64) -> f64 {
    let Some(rpm) = rpm else {
        return 0.0;
    };
    if stdev == 0.0 {
        // present in the sample, never varies in the background
        return if rpm == 0.0 { 0.0 } else { ZSCORE_ZERO_VARIANCE };
    }
    ((rpm - mean) / stdev).clamp(ZSCORE_MIN, ZSCORE_MAX)
}

/// Combined NT/NR score driving the default report order.
///
/// Each database contributes `max(zscore + 100, 0) * ln(1 + rpm)`; the score
/// is the sum of both contributions. Shifting the z-score by 100 keeps the
/// factor non-negative over the clamped range (and zero for `NOT_COMPUTED`),
/// so the score never decreases when any z-score or rpm grows, and swapping
/// NT with NR leaves it unchanged.
pub fn aggregatescore(nt: Option<&CountMetrics>, nr: Option<&CountMetrics>) -> f64 {
    fn contribution(m: Option<&CountMetrics>) -> f64 {
        m.map_or(0.0, |m| (m.zscore + 100.0).max(0.0) * m.rpm.max(0.0).ln_1p())
    }
    contribution(nt) + contribution(nr)
}

/// `true` when a value should render as blank rather than a real zero.
pub fn is_blank(value: f64) -> bool {
    value == 0.0 || value == NOT_COMPUTED
}

/// Value for display: `None` means blank/unknown.
pub fn display_value(value: f64) -> Option<f64> {
    if is_blank(value) {
        None
    } else {
        Some(value)
    }
}

/// Sample-level inputs shared by every taxon of one sample.
#[derive(Debug, Clone, Copy)]
pub struct Normalization {
    pub adjusted_total_reads: f64,
    pub total_ercc_reads: u64,
    pub mass_normalized: bool,
}

/// Metrics for one raw row. `aggregatescore` is filled once both count types are known.
pub fn count_metrics(
    row: &TaxonCount,
    stat: Option<&BackgroundStat>,
    norm: &Normalization,
) -> CountMetrics {
    let rpm_value = rpm(Some(row.count), norm.adjusted_total_reads);
    let z = match stat {
        None => ZSCORE_ABSENT_FROM_BACKGROUND,
        Some(stat) => match mass_normalized_pair(stat, norm) {
            Some((mean, stdev)) => {
                let per_ercc = row.count as f64 / norm.total_ercc_reads as f64;
                zscore(Some(per_ercc), mean, stdev)
            }
            None => zscore(Some(rpm_value), stat.mean, stat.stdev),
        },
    };
    CountMetrics {
        r: row.count,
        rpm: rpm_value,
        zscore: z,
        aggregatescore: 0.0,
        percentidentity: row.percent_identity,
        alignmentlength: row.alignment_length,
        neglogevalue: row.neg_log_e_value.abs(),
        percentconcordant: row.percent_concordant,
    }
}

fn mass_normalized_pair(stat: &BackgroundStat, norm: &Normalization) -> Option<(f64, f64)> {
    if !norm.mass_normalized || norm.total_ercc_reads == 0 {
        return None;
    }
    Some((stat.mean_mass_normalized?, stat.stdev_mass_normalized?))
}

/// Metrics of a count type that has no row for the taxon.
pub fn absent_metrics() -> CountMetrics {
    CountMetrics { zscore: NOT_COMPUTED, ..CountMetrics::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CountType, TaxLevel};

    fn row(count: u64) -> TaxonCount {
        TaxonCount {
            tax_id: 100,
            tax_level: TaxLevel::Species,
            count_type: CountType::Nt,
            count,
            percent_identity: 98.5,
            alignment_length: 140.0,
            neg_log_e_value: -42.0,
            percent_concordant: 0.0,
            name: "Taxon".into(),
            genus_taxid: 50,
            is_phage: false,
            category_name: "Bacteria".into(),
        }
    }

    fn metrics(zscore: f64, rpm: f64) -> CountMetrics {
        CountMetrics { zscore, rpm, ..CountMetrics::default() }
    }

    #[test]
    fn rpm_is_strictly_increasing_in_count() {
        let mut last = rpm(Some(0), 1_000.0);
        for count in 1..200 {
            let next = rpm(Some(count), 1_000.0);
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn rpm_division_guard() {
        assert_eq!(rpm(Some(100), 0.0), 0.0);
        assert_eq!(rpm(None, 1_000_000.0), 0.0);
    }

    #[test]
    fn zscore_zero_variance_sentinel() {
        assert_eq!(zscore(Some(5.0), 2.0, 0.0), 1_000_000.0);
        assert_eq!(zscore(Some(0.0), 2.0, 0.0), 0.0);
        assert_eq!(zscore(None, 2.0, 0.0), 0.0);
    }

    #[test]
    fn zscore_is_clamped_but_sentinel_is_not() {
        assert_eq!(zscore(Some(1e9), 0.0, 1.0), ZSCORE_MAX);
        assert_eq!(zscore(Some(0.0), 1e9, 1.0), ZSCORE_MIN);
        assert!(ZSCORE_ZERO_VARIANCE > ZSCORE_ABSENT_FROM_BACKGROUND);
        assert!(ZSCORE_ABSENT_FROM_BACKGROUND > ZSCORE_MAX);
    }

    #[test]
    fn end_to_end_row_metrics() {
        let norm = Normalization { adjusted_total_reads: 1_000_000.0, total_ercc_reads: 0, mass_normalized: false };
        let stat = BackgroundStat { mean: 100.0, stdev: 50.0, mean_mass_normalized: None, stdev_mass_normalized: None };
        let m = count_metrics(&row(500), Some(&stat), &norm);
        assert_eq!(m.rpm, 500.0);
        assert_eq!(m.zscore, 8.0);
        assert_eq!(m.neglogevalue, 42.0);

        let unseen = count_metrics(&row(500), None, &norm);
        assert_eq!(unseen.zscore, ZSCORE_ABSENT_FROM_BACKGROUND);
    }

    #[test]
    fn mass_normalized_background_uses_spike_ins() {
        let norm = Normalization { adjusted_total_reads: 1_000_000.0, total_ercc_reads: 100, mass_normalized: true };
        let stat = BackgroundStat { mean: 100.0, stdev: 50.0, mean_mass_normalized: Some(1.0), stdev_mass_normalized: Some(2.0) };
        // 500 / 100 = 5 reads per ERCC read, (5 - 1) / 2 = 2
        assert_eq!(count_metrics(&row(500), Some(&stat), &norm).zscore, 2.0);

        let no_spike_ins = Normalization { total_ercc_reads: 0, ..norm };
        assert_eq!(count_metrics(&row(500), Some(&stat), &no_spike_ins).zscore, 8.0);
    }

    #[test]
    fn aggregatescore_is_monotonic() {
        let grid = [-100.0, -99.0, -5.0, 0.0, 3.0, 99.0, 100.0, 1_000_000.0];
        let rpms = [0.0, 0.5, 10.0, 1e4];
        let other = metrics(2.0, 30.0);
        for &rpm_v in &rpms {
            for pair in grid.windows(2) {
                let lo = aggregatescore(Some(&metrics(pair[0], rpm_v)), Some(&other));
                let hi = aggregatescore(Some(&metrics(pair[1], rpm_v)), Some(&other));
                assert!(hi >= lo, "zscore {} -> {} at rpm {}", pair[0], pair[1], rpm_v);
            }
        }
        for &z in &grid {
            for pair in rpms.windows(2) {
                let lo = aggregatescore(Some(&other), Some(&metrics(z, pair[0])));
                let hi = aggregatescore(Some(&other), Some(&metrics(z, pair[1])));
                assert!(hi >= lo, "rpm {} -> {} at zscore {}", pair[0], pair[1], z);
            }
        }
    }

    #[test]
    fn aggregatescore_is_symmetric() {
        let a = metrics(4.0, 120.0);
        let b = metrics(-3.0, 7.0);
        assert_eq!(aggregatescore(Some(&a), Some(&b)), aggregatescore(Some(&b), Some(&a)));
        assert_eq!(aggregatescore(Some(&a), None), aggregatescore(None, Some(&a)));
        assert_eq!(aggregatescore(None, None), 0.0);
    }

    #[test]
    fn blank_values() {
        assert_eq!(display_value(0.0), None);
        assert_eq!(display_value(NOT_COMPUTED), None);
        assert_eq!(display_value(-3.5), Some(-3.5));
        assert!(absent_metrics().zscore == NOT_COMPUTED);
    }
}
