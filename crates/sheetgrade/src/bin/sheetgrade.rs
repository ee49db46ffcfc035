use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::error;
use sheetgrade::align::FeatureType;
use sheetgrade::scoring::ScoringRules;
use sheetgrade::{BatchOrchestrator, CodeSettings, GradingConfig};

fn parse_feature_type(s: &str) -> Result<FeatureType, String> {
    FeatureType::parse(s).ok_or_else(|| format!("unknown method `{s}`, expected ORB, SIFT or AKAZE"))
}

fn parse_confidence(s: &str) -> Result<f32, String> {
    let v: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{v} is outside [0, 1]"))
    }
}

/// Grade a folder of photographed answer sheets.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Folder with sheet images.
    input_dir: PathBuf,

    /// Template descriptor (JSON).
    #[arg(short, long)]
    template: PathBuf,

    /// Bubble detector model (ONNX).
    #[arg(short = 'm', long = "yolo-model")]
    model: PathBuf,

    /// Minimum detection confidence.
    #[arg(short = 'c', long = "conf", default_value = "0.25", value_parser = parse_confidence)]
    confidence: f32,

    /// Worker threads; derived from the CPU count when omitted.
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    workers: Option<u32>,

    /// Upper bound for the derived worker count.
    #[arg(long, default_value_t = 8)]
    max_workers: usize,

    /// Align each sheet to a reference scan before reading bubbles.
    #[arg(long, requires = "align_reference")]
    auto_align: bool,

    /// Reference scan of a blank sheet.
    #[arg(short = 'r', long)]
    align_reference: Option<PathBuf>,

    /// Feature type used for alignment [default: template setting, else ORB].
    #[arg(long, value_parser = parse_feature_type)]
    align_method: Option<FeatureType>,

    /// Write a match visualisation next to every result.
    #[arg(long)]
    align_debug: bool,

    /// Answer key (JSON or CSV).
    #[arg(long = "answer-key-excel", visible_alias = "answer-key")]
    answer_key: PathBuf,

    /// Student directory (JSON or CSV) used to match student numbers.
    #[arg(long)]
    students: Option<PathBuf>,

    /// Only match students of this class; repeatable.
    #[arg(long = "class")]
    classes: Vec<String>,

    /// Output folder for per-sheet results and the batch summary.
    #[arg(short, long, default_value = "results")]
    output_dir: PathBuf,

    /// Trailing digits compared when matching student numbers.
    #[arg(long, default_value_t = 6)]
    recognition_length: usize,

    /// Points of a perfect sheet.
    #[arg(long, default_value_t = 10.0)]
    total_points: f64,

    /// Per-sheet time limit in seconds.
    #[arg(long, default_value_t = 60.0)]
    deadline_secs: f64,

    /// Structured JSON logs (needs the `tracing` feature).
    #[arg(long)]
    json_logs: bool,

    /// More output per occurrence (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> GradingConfig {
        let mut config = GradingConfig {
            template: self.template,
            model: Some(self.model),
            auto_align: self.auto_align,
            align_reference: self.align_reference,
            align_method: self.align_method,
            align_debug: self.align_debug,
            answer_key: Some(self.answer_key),
            students: self.students,
            classes: self.classes,
            scoring: ScoringRules {
                total_points: self.total_points,
                ..ScoringRules::default()
            },
            codes: CodeSettings {
                recognition_length: self.recognition_length,
                ..CodeSettings::default()
            },
            deadline_secs: self.deadline_secs,
            workers: self.workers.map(|w| w as usize),
            max_workers: self.max_workers,
            output_dir: Some(self.output_dir),
            ..GradingConfig::default()
        };
        config.classifier.confidence = self.confidence;
        config
    }
}

fn init_logging(verbose: u8, json: bool) {
    #[cfg(feature = "tracing")]
    if json {
        sheetgrade::core::init_tracing(true);
        return;
    }
    if let Err(e) = sheetgrade::core::init_with_level(sheetgrade::core::level_from_verbosity(verbose)) {
        eprintln!("failed to install logger: {e}");
    }
    #[cfg(not(feature = "tracing"))]
    if json {
        log::warn!("--json-logs needs the `tracing` feature; using plain logs");
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let input_dir = cli.input_dir.clone();
    let config = cli.into_config();
    let batch = BatchOrchestrator::from_config(&config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let report = batch.run_dir(&input_dir).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let s = &report.summary;
    println!(
        "batch {}: {}/{} sheets graded, {} failed, {:.0} ms ({:.0} ms/sheet, {} workers)",
        s.batch_id, s.successful, s.total, s.failed, s.elapsed_ms, s.avg_ms_per_image, s.workers
    );
    for f in &s.errors {
        println!("  {}: {}", f.file, f.error);
    }
}
