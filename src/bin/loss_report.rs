use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Device, Tensor};
use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use seqloss::{
    DenseLabels, LossKind, OutputLayer, OutputLayerBuilder, OutputLayerConfig, StepAlignments,
    StepInput, StepPhase, Targets, ValidityMask,
};

#[derive(Debug, Parser)]
#[command(name = "loss_report")]
#[command(about = "Evaluate an output layer on recorded score tensors and report losses and errors")]
struct Args {
    /// Output layer configuration (JSON).
    #[arg(long, env = "SEQLOSS_REPORT_CONFIG")]
    config: PathBuf,
    /// Cases file: `{"cases": [{"id", "scores", "lengths", "labels"}]}`.
    #[arg(long, env = "SEQLOSS_REPORT_CASES_FILE")]
    cases_file: PathBuf,
    #[arg(long, env = "SEQLOSS_REPORT_OUT")]
    out: Option<PathBuf>,
    #[arg(long, env = "SEQLOSS_REPORT_LIMIT")]
    limit: Option<usize>,
    #[arg(long, env = "SEQLOSS_REPORT_OFFSET", default_value_t = 0)]
    offset: usize,
    #[arg(long, env = "SEQLOSS_REPORT_EPOCH", default_value_t = 1)]
    epoch: u32,
    /// Evaluation phase (source index instead of target padding).
    #[arg(long, env = "SEQLOSS_REPORT_EVAL", default_value_t = false)]
    eval: bool,
    /// Fold every case into the running prior, in file order.
    #[arg(long, env = "SEQLOSS_REPORT_UPDATE_PRIORS", default_value_t = false)]
    update_priors: bool,
}

#[derive(Debug, Deserialize)]
struct CasesFile {
    cases: Vec<Case>,
}

#[derive(Debug, Deserialize)]
struct Case {
    id: String,
    /// `[time][batch][class]` raw scores.
    scores: Vec<Vec<Vec<f32>>>,
    /// Valid frames per batch item.
    lengths: Vec<usize>,
    /// Reference per batch item: one label per frame for framewise losses,
    /// the label sequence otherwise.
    #[serde(default)]
    labels: Vec<Vec<u32>>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    meta: Meta,
    cases: Vec<CaseReport>,
    totals: Totals,
}

#[derive(Debug, Serialize)]
struct Meta {
    generated_at: String,
    config_path: String,
    cases_file: String,
    layer: String,
    loss: String,
    n_out: usize,
    phase: &'static str,
    case_count: usize,
}

#[derive(Debug, Serialize)]
struct CaseReport {
    id: String,
    frames: usize,
    batch: usize,
    loss_cells: usize,
    norm: f32,
    loss: Option<f32>,
    errors: Option<f32>,
    elapsed_ms: f64,
}

#[derive(Debug, Default, Serialize)]
struct Totals {
    loss: f32,
    errors: f32,
    loss_cells: usize,
    error_rate: Option<f32>,
    log_prior: Option<Vec<f32>>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let config_path = resolve_path(&repo_root, &args.config);
    let cases_path = resolve_path(&repo_root, &args.cases_file);
    let out_path = resolve_out_path(&repo_root, args.out.as_ref());

    let config = OutputLayerConfig::load(&config_path)
        .map_err(|err| format!("{}: {err}", config_path.display()))?;
    let mut layer = OutputLayerBuilder::new(config)
        .build()
        .map_err(|err| format!("Failed to build output layer: {err}"))?;
    layer.set_epoch(args.epoch);

    let mut cases = load_cases(&cases_path)?;
    if args.offset > 0 {
        cases = cases.into_iter().skip(args.offset).collect();
    }
    if let Some(limit) = args.limit {
        cases.truncate(limit);
    }
    if cases.is_empty() {
        return Err("No cases selected after applying offset/limit.".to_string());
    }

    let phase = if args.eval {
        StepPhase::Eval
    } else {
        StepPhase::Train
    };
    let progress = ProgressBar::new(cases.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );

    let mut reports = Vec::with_capacity(cases.len());
    let mut totals = Totals::default();
    for case in &cases {
        progress.set_message(case.id.clone());
        let report = evaluate_case(&mut layer, case, phase, args.update_priors)
            .map_err(|err| format!("{}: {err}", case.id))?;
        totals.loss += report.loss.unwrap_or(0.0);
        totals.errors += report.errors.unwrap_or(0.0);
        totals.loss_cells += report.loss_cells;
        reports.push(report);
        progress.inc(1);
    }
    progress.finish_with_message("done");
    if totals.loss_cells > 0 && reports.iter().any(|r| r.errors.is_some()) {
        totals.error_rate = Some(totals.errors / totals.loss_cells as f32);
    }
    totals.log_prior = layer.log_prior();

    let config = layer.config();
    let report = Report {
        meta: Meta {
            generated_at: Utc::now().to_rfc3339(),
            config_path: config_path.display().to_string(),
            cases_file: cases_path.display().to_string(),
            layer: config.name.clone(),
            loss: config.loss.to_string(),
            n_out: config.n_out,
            phase: if args.eval { "eval" } else { "train" },
            case_count: reports.len(),
        },
        cases: reports,
        totals,
    };
    write_report(&out_path, &report)?;
    println!("{}", out_path.display());
    Ok(())
}

fn evaluate_case(
    layer: &mut OutputLayer,
    case: &Case,
    phase: StepPhase,
    update_priors: bool,
) -> Result<CaseReport, String> {
    let time = case.scores.len();
    let batch = case.lengths.len();
    let index = ValidityMask::from_lengths(&case.lengths, time).map_err(|e| e.to_string())?;
    let scores = to_tensor(&case.scores, batch)?;
    let targets = build_targets(layer.config(), case, time)?;

    let started = Instant::now();
    let input = StepInput {
        scores: &scores,
        index: &index,
        targets,
        phase,
        tags: &case.tags,
    };
    let mut alignments = StepAlignments::default();
    let step = layer
        .step(&input, &mut alignments)
        .map_err(|e| e.to_string())?;
    if update_priors {
        layer.update_priors(&step).map_err(|e| e.to_string())?;
    }
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    Ok(CaseReport {
        id: case.id.clone(),
        frames: time,
        batch,
        loss_cells: step.prepared.loss_mask.count(),
        norm: step.prepared.norm,
        loss: step.loss_value().map_err(|e| e.to_string())?,
        errors: step.errors,
        elapsed_ms,
    })
}

fn to_tensor(scores: &[Vec<Vec<f32>>], batch: usize) -> Result<Tensor, String> {
    let time = scores.len();
    let classes = scores
        .first()
        .and_then(|frame| frame.first())
        .map_or(0, Vec::len);
    let ragged = scores
        .iter()
        .any(|frame| frame.len() != batch || frame.iter().any(|row| row.len() != classes));
    if ragged {
        return Err(format!("scores are not a {time}x{batch}x{classes} tensor"));
    }
    let data: Vec<f32> = scores.iter().flatten().flatten().copied().collect();
    Tensor::from_vec(data, (time, batch, classes), &Device::Cpu).map_err(|e| e.to_string())
}

fn build_targets(config: &OutputLayerConfig, case: &Case, time: usize) -> Result<Targets, String> {
    if case.labels.is_empty() {
        return Ok(Targets::None);
    }
    if case.labels.len() != case.lengths.len() {
        return Err(format!(
            "{} label rows for {} sequences",
            case.labels.len(),
            case.lengths.len()
        ));
    }
    let sequence_labels = config.loss.uses_label_sequences() || config.loss == LossKind::FastBw;
    if sequence_labels {
        return DenseLabels::from_sequences(&case.labels)
            .map(Targets::Dense)
            .map_err(|e| e.to_string());
    }
    let batch = case.labels.len();
    let mut labels = vec![0u32; time * batch];
    let mut lengths = Vec::with_capacity(batch);
    for (b, row) in case.labels.iter().enumerate() {
        if row.len() > time {
            return Err(format!("{} framewise labels for {time} frames", row.len()));
        }
        for (t, &label) in row.iter().enumerate() {
            labels[t * batch + b] = label;
        }
        lengths.push(row.len());
    }
    let mask = ValidityMask::from_lengths(&lengths, time).map_err(|e| e.to_string())?;
    DenseLabels::new(labels, mask)
        .map(Targets::Dense)
        .map_err(|e| e.to_string())
}

fn load_cases(path: &Path) -> Result<Vec<Case>, String> {
    let data = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read cases file '{}': {err}", path.display()))?;
    let file: CasesFile = serde_json::from_str(&data)
        .map_err(|err| format!("Failed to parse cases file '{}': {err}", path.display()))?;
    Ok(file.cases)
}

fn write_report(path: &Path, report: &Report) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create '{}': {err}", parent.display()))?;
    }
    let file = File::create(path)
        .map_err(|err| format!("Failed to create report '{}': {err}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .map_err(|err| format!("Failed to serialize report '{}': {err}", path.display()))?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .map_err(|err| format!("Failed to write report '{}': {err}", path.display()))
}

fn resolve_out_path(repo_root: &Path, out: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = out {
        return resolve_path(repo_root, path);
    }
    let run_id = Utc::now().format("%Y%m%dT%H%M%SZ");
    repo_root
        .join("target")
        .join("loss_reports")
        .join(format!("loss-report-{run_id}.json"))
}

fn resolve_path(repo_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}
