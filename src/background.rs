//src/background.rs

use ahash::AHashMap;
use std::io::BufRead;
use std::path::Path;

use crate::counts::open_table;
use crate::error::{ReportError, Result};
use crate::types::{BackgroundId, BackgroundInfo, BackgroundStat, CountType, TaxId};

/// Background stats for one request, keyed by `(tax_id, count_type)`.
pub type BackgroundStats = AHashMap<(TaxId, CountType), BackgroundStat>;

/// Read-only access to precomputed background models.
pub trait BackgroundStore: Send + Sync {
    /// All selectable backgrounds.
    fn backgrounds(&self) -> Vec<BackgroundInfo>;

    fn background(&self, id: BackgroundId) -> Option<BackgroundInfo> {
        self.backgrounds().into_iter().find(|b| b.id == id)
    }

    /// Stats for exactly `tax_ids` under background `id`, in one batch.
    /// Taxa the background has never seen are simply missing from the result.
    fn stats(&self, id: BackgroundId, tax_ids: &[TaxId]) -> Result<BackgroundStats>;
}

/// Backgrounds held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackgrounds {
    infos: Vec<BackgroundInfo>,
    stats: AHashMap<BackgroundId, BackgroundStats>,
}

impl InMemoryBackgrounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_background(&mut self, info: BackgroundInfo) {
        self.stats.entry(info.id).or_default();
        match self.infos.iter_mut().find(|b| b.id == info.id) {
            Some(existing) => *existing = info,
            None => self.infos.push(info),
        }
    }

    pub fn insert_stat(&mut self, id: BackgroundId, tax_id: TaxId, count_type: CountType, stat: BackgroundStat) {
        self.stats.entry(id).or_default().insert((tax_id, count_type), stat);
    }

    pub fn len_stats(&self, id: BackgroundId) -> usize {
        self.stats.get(&id).map_or(0, |s| s.len())
    }
}

impl BackgroundStore for InMemoryBackgrounds {
    fn backgrounds(&self) -> Vec<BackgroundInfo> {
        let mut infos = self.infos.clone();
        infos.sort_by_key(|b| b.id);
        infos
    }

    fn stats(&self, id: BackgroundId, tax_ids: &[TaxId]) -> Result<BackgroundStats> {
        let all = self
            .stats
            .get(&id)
            .ok_or(ReportError::BackgroundModelNotFound(id))?;
        let mut found = BackgroundStats::with_capacity(tax_ids.len() * 2);
        for &tax_id in tax_ids {
            for ct in CountType::ALL {
                if let Some(stat) = all.get(&(tax_id, ct)) {
                    found.insert((tax_id, ct), *stat);
                }
            }
        }
        Ok(found)
    }
}

/// Parses a background table (optionally gzipped):
/// ```text
/// #background\t<id>\t<name>\t<mass_normalized 0|1>
/// <background_id>\t<tax_id>\t<count_type>\t<mean>\t<stdev>[\t<mean_mn>\t<stdev_mn>]
/// ```
/// Blank lines are skipped; any other malformed line is an error.
pub fn load_backgrounds<P: AsRef<Path>>(path: P) -> Result<InMemoryBackgrounds> {
    let reader = open_table(path.as_ref())?;
    let mut store = InMemoryBackgrounds::new();

    for (idx, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('\t').map(str::trim).collect();

        if parts[0] == "#background" {
            if parts.len() < 4 {
                return Err(parse_error(line_no, "background header needs id, name, mass_normalized"));
            }
            store.add_background(BackgroundInfo {
                id: parse_field(parts[1], line_no, "background id")?,
                name: parts[2].to_string(),
                mass_normalized: parts[3] == "1" || parts[3].eq_ignore_ascii_case("true"),
            });
            continue;
        }
        if parts[0].starts_with('#') {
            continue;
        }
        if parts.len() < 5 {
            return Err(parse_error(line_no, "expected at least 5 tab-separated fields"));
        }

        let id: BackgroundId = parse_field(parts[0], line_no, "background id")?;
        let tax_id: TaxId = parse_field(parts[1], line_no, "tax id")?;
        let count_type: CountType = parts[2].parse().map_err(|e: String| parse_error(line_no, &e))?;
        let optional = |i: usize| -> Result<Option<f64>> {
            match parts.get(i) {
                Some(v) if !v.is_empty() => Ok(Some(parse_field(v, line_no, "mass normalized stat")?)),
                _ => Ok(None),
            }
        };
        let stat = BackgroundStat {
            mean: parse_field(parts[3], line_no, "mean")?,
            stdev: parse_field(parts[4], line_no, "stdev")?,
            mean_mass_normalized: optional(5)?,
            stdev_mass_normalized: optional(6)?,
        };
        if !store.infos.iter().any(|b| b.id == id) {
            log::warn!("line {line_no}: stats for undeclared background {id}");
            store.add_background(BackgroundInfo { id, name: format!("background {id}"), mass_normalized: false });
        }
        store.insert_stat(id, tax_id, count_type, stat);
    }

    log::info!("Loaded {} background model(s)", store.infos.len());
    Ok(store)
}

pub(crate) fn parse_field<T: std::str::FromStr>(raw: &str, line: usize, what: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| parse_error(line, &format!("invalid {what} '{raw}'")))
}

pub(crate) fn parse_error(line: usize, message: &str) -> ReportError {
    ReportError::Parse { line, message: message.to_string() }
}
