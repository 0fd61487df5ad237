use std::fs;

use taxon_report::background::{load_backgrounds, BackgroundStore};
use taxon_report::counts::{load_counts_dir, CountSource};
use taxon_report::types::CountType;
use taxon_report::ReportError;

#[test]
fn background_table_with_mass_normalized_columns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bg.tsv");
    fs::write(
        &path,
        "#background\t4\tERCC normalized\t1\n\n4\t562\tNT\t12.5\t3\t0.2\t0.05\n4\t562\tNR\t8\t2\n",
    )
    .unwrap();

    let store = load_backgrounds(&path).unwrap();
    let info = store.background(4).unwrap();
    assert!(info.mass_normalized);
    assert_eq!(info.name, "ERCC normalized");

    let stats = store.stats(4, &[562]).unwrap();
    assert_eq!(stats[&(562, CountType::Nt)].mean_mass_normalized, Some(0.2));
    assert_eq!(stats[&(562, CountType::Nr)].stdev_mass_normalized, None);
}

#[test]
fn malformed_background_line_reports_its_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bg.tsv");
    fs::write(&path, "#background\t4\tbg\t0\n4\t562\tNT\tlots\t3\n").unwrap();
    match load_backgrounds(&path) {
        Err(ReportError::Parse { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn counts_dir_picks_up_plain_tables() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("7.tsv"),
        "#total_reads=2000\n#total_ercc_reads=1000\n#subsample_fraction=0.5\n\
         562\t1\tNR\t10\t90\t40\t12\t0\tEscherichia coli\t561\t0\tBacteria\n",
    )
    .unwrap();
    fs::write(dir.path().join("readme.tsv"), "ignored").unwrap();

    let source = load_counts_dir(dir.path()).unwrap();
    assert_eq!(source.sample_ids(), vec![7]);
    let sample = source.sample_counts(7).unwrap();
    assert_eq!(sample.adjusted_total_reads(), 500.0);
    assert_eq!(sample.counts[0].count_type, CountType::Nr);
    assert!(matches!(source.sample_counts(8), Err(ReportError::SampleNotFound(8))));
}
