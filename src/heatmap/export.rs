// src/heatmap/export.rs

use std::io::Write;

use super::HeatmapResponse;
use crate::error::Result;

/// Writes one CSV row per (sample, taxon) cell group.
///
/// Columns are the sample and taxon identification followed by one column per
/// requested `(count_type, metric)`, e.g. `NT_rpm`. Metrics a sample has no
/// row for are left empty.
pub fn write_heatmap_csv<W: Write>(response: &HeatmapResponse, writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header: Vec<String> = ["sample_id", "tax_id", "name", "tax_level", "genus_taxid", "category", "is_phage"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for ct in &response.count_types {
        for metric in &response.metrics {
            header.push(format!("{}_{}", ct, metric.as_str()));
        }
    }
    csv.write_record(&header)?;

    let mut rows = 0usize;
    for (sample_id, cells) in &response.results {
        for (tax_id, by_type) in cells {
            let info = response.taxa.iter().find(|t| t.tax_id == *tax_id);
            let mut record = vec![
                sample_id.to_string(),
                tax_id.to_string(),
                info.map(|t| t.name.clone()).unwrap_or_default(),
                info.map(|t| (t.tax_level as u8).to_string()).unwrap_or_default(),
                info.map(|t| t.genus_taxid.to_string()).unwrap_or_default(),
                info.map(|t| t.category_name.clone()).unwrap_or_default(),
                info.map(|t| (t.is_phage as u8).to_string()).unwrap_or_default(),
            ];
            for ct in &response.count_types {
                for metric in &response.metrics {
                    let value = by_type.get(ct).and_then(|m| m.get(metric));
                    record.push(value.map(|v| v.to_string()).unwrap_or_default());
                }
            }
            csv.write_record(&record)?;
            rows += 1;
        }
    }
    csv.flush()?;
    log::debug!("wrote {} heatmap csv rows", rows);
    Ok(())
}
