use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use taxon_report::filter::OperatorThreshold;
use taxon_report::heatmap::RankBy;
use taxon_report::types::{CountType, MetricKind, TaxLevel};
use taxon_report::{open_service, HeatmapRequest, ReportRequest};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Directory of `<sample_id>.tsv[.gz]` count tables
    #[arg(long)]
    counts: PathBuf,
    /// Background model table
    #[arg(long)]
    backgrounds: PathBuf,
    /// JSON engine config
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write output here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Single-sample report as JSON
    Report {
        #[arg(long)]
        sample: u64,
        #[arg(long)]
        background: Option<u64>,
        /// species or genus
        #[arg(long, default_value = "species")]
        view: TaxLevel,
        /// e.g. highest_nt_zscore
        #[arg(long)]
        sort: Option<String>,
        /// Category to exclude, repeatable
        #[arg(long = "exclude")]
        excluded: Vec<String>,
        /// `<metric>=<min>,<max>`, repeatable, e.g. nt_zscore=5,
        #[arg(long = "threshold")]
        thresholds: Vec<String>,
        #[arg(long)]
        disable_filters: bool,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        per_page: Option<usize>,
        #[arg(long)]
        genus: Option<i64>,
    },
    /// Cross-sample heatmap as JSON or CSV
    Heatmap {
        /// Sample ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        samples: Vec<u64>,
        #[arg(long)]
        background: Option<u64>,
        #[arg(long = "category")]
        categories: Vec<String>,
        #[arg(long)]
        include_phage: bool,
        /// Metrics to report, comma separated (default all)
        #[arg(long, value_delimiter = ',')]
        metrics: Vec<MetricKind>,
        /// NT, NR or both (default both)
        #[arg(long = "count-type", value_delimiter = ',')]
        count_types: Vec<CountType>,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        min_reads: Option<u64>,
        #[arg(long, default_value = "reads")]
        rank_by: RankBy,
        #[arg(long)]
        read_specificity: bool,
        #[arg(long)]
        tax_level: Option<TaxLevel>,
        /// `<metric>>=<value>` or `<metric><=<value>`, repeatable, e.g. NT_zscore>=5
        #[arg(long = "threshold")]
        thresholds: Vec<String>,
        /// Taxon order, e.g. NT.rpm or lowest_nr_zscore
        #[arg(long)]
        sort: Option<String>,
        /// Detail call for these taxa, comma separated
        #[arg(long, value_delimiter = ',')]
        taxa: Option<Vec<i64>>,
        #[arg(long)]
        csv: bool,
    },
}

fn spinner(color: &str, message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let template = format!("{{spinner:.{color}}} {{msg}}");
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template(&template)
    {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message.to_string());
    spinner
}

fn operator_threshold(raw: &str) -> Option<OperatorThreshold> {
    let parsed = [">=", "<="].into_iter().find_map(|op| {
        raw.split_once(op).map(|(metric, value)| OperatorThreshold {
            metric: metric.trim().to_string(),
            value: serde_json::Value::String(value.trim().to_string()),
            operator: Some(op.to_string()),
        })
    });
    if parsed.is_none() {
        log::warn!("ignoring threshold '{raw}', expected <metric>>=<value> or <metric><=<value>");
    }
    parsed
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    // 1. Load tables
    let loading = spinner("blue", "Loading count and background tables...");
    let service = open_service(&cli.counts, &cli.backgrounds, cli.config.as_deref())?;
    loading.finish_with_message(format!("Loaded {} background model(s).", service.backgrounds().len()));

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    // 2. Run the request
    match cli.command {
        Command::Report {
            sample,
            background,
            view,
            sort,
            excluded,
            thresholds,
            disable_filters,
            page,
            per_page,
            genus,
        } => {
            let mut threshold_map = BTreeMap::new();
            for raw in thresholds {
                match raw.split_once('=') {
                    Some((metric, range)) => {
                        threshold_map.insert(format!("threshold_{metric}"), range.to_string());
                    }
                    None => log::warn!("ignoring threshold '{raw}', expected <metric>=<min>,<max>"),
                }
            }
            let request = ReportRequest {
                sample_id: sample,
                background_id: background,
                view_level: Some(view),
                excluded_categories: excluded,
                sort_by: sort,
                thresholds: threshold_map,
                threshold_filters: Vec::new(),
                disable_filters,
                page,
                per_page,
                searched_genus: genus,
            };
            let running = spinner("green", &format!("Building report for sample {sample}..."));
            let response = service.report(&request)?;
            running.finish_with_message(format!(
                "{} of {} rows pass filters.",
                response.rows_passing_filters, response.rows_total
            ));
            serde_json::to_writer_pretty(&mut out, response.as_ref())?;
            writeln!(out)?;
        }
        Command::Heatmap {
            samples,
            background,
            categories,
            include_phage,
            metrics,
            count_types,
            top_n,
            min_reads,
            rank_by,
            read_specificity,
            tax_level,
            thresholds,
            sort,
            taxa,
            csv,
        } => {
            let mut subcategories = BTreeMap::new();
            if include_phage {
                subcategories.insert("Viruses".to_string(), vec!["Phage".to_string()]);
            }
            let request = HeatmapRequest {
                sample_ids: samples,
                background_id: background,
                categories,
                subcategories,
                metrics,
                count_types,
                top_n_per_sample: top_n,
                min_reads_threshold: min_reads,
                rank_by,
                read_specificity,
                tax_level,
                threshold_filters: thresholds.iter().filter_map(|raw| operator_threshold(raw)).collect(),
                sort_by: sort,
                taxon_ids: taxa,
                removed_taxon_ids: Vec::new(),
            };
            let running = spinner("green", &format!("Building heatmap for {} sample(s)...", request.sample_ids.len()));
            let response = service.heatmap(&request)?;
            running.finish_with_message(format!(
                "{} of {} sample(s) valid, {} taxa.",
                response.valid_samples(),
                response.samples.len(),
                response.metadata.union_size
            ));
            if csv {
                service.heatmap_csv(&request, &mut out)?;
            } else {
                serde_json::to_writer_pretty(&mut out, response.as_ref())?;
                writeln!(out)?;
            }
        }
    }

    // 3. Done
    out.flush()?;
    let done = spinner("cyan", "All done!");
    done.finish_with_message("All done!");
    Ok(())
}
