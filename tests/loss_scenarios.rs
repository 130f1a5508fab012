use candle_core::{Device, Tensor, Var};
use libtest_mimic::{Arguments, Failed, Trial};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seqloss::{
    DenseLabels, LossKind, OutputLayer, OutputLayerBuilder, OutputLayerConfig, SparseEntry,
    SparseTargets, StepAlignments, StepInput, StepOutput, StepPhase, Targets, TimeLimit,
    ValidityMask,
};

const SUITE_NAME: &str = "loss_scenarios";
const DEFAULT_PROPERTY_SEED: u64 = 42;
const PROPERTY_ROUNDS: usize = 16;

fn main() {
    let args = Arguments::from_args();
    let seed = std::env::var("SEQLOSS_IT_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PROPERTY_SEED);

    let scenarios: Vec<(&str, fn() -> Result<(), Failed>)> = vec![
        ("ce::matches_hand_computation", ce_matches_hand_computation),
        ("ce::counts_reference_mismatches", ce_counts_reference_mismatches),
        ("ce::frame_limit_truncates", ce_frame_limit_truncates),
        ("ce::sparse_agrees_with_dense", ce_sparse_agrees_with_dense),
        ("fast_bw::alignment_rows_sum_to_one", fast_bw_alignment_rows_sum_to_one),
        ("prior::uniform_update_is_stable", prior_uniform_update_is_stable),
        ("ctc::prefers_the_label_order", ctc_prefers_the_label_order),
    ];
    let mut tests: Vec<Trial> = scenarios
        .into_iter()
        .map(|(name, run)| Trial::test(format!("{SUITE_NAME}::{name}"), run))
        .collect();
    tests.push(Trial::test(
        format!("{SUITE_NAME}::property::argmax_reference_has_no_errors"),
        move || argmax_reference_has_no_errors(seed),
    ));
    tests.push(Trial::test(
        format!("{SUITE_NAME}::property::ctc_score_gradient_rows_cancel"),
        move || ctc_score_gradient_rows_cancel(seed),
    ));

    libtest_mimic::run(&args, tests).exit();
}

/// Scores whose softmax reproduces `probs` exactly (`z = ln p`).
fn log_scores(probs: &[Vec<f32>]) -> Result<Tensor, Failed> {
    let classes = probs.first().map_or(0, Vec::len);
    let data: Vec<f32> = probs.iter().flatten().map(|p| p.ln()).collect();
    Ok(Tensor::from_vec(data, (probs.len(), 1, classes), &Device::Cpu)?)
}

fn framewise(labels: &[u32]) -> Result<Targets, Failed> {
    let rows: Vec<Vec<u32>> = labels.iter().map(|&l| vec![l]).collect();
    Ok(Targets::Dense(DenseLabels::framewise(&rows)?))
}

fn build(config: OutputLayerConfig) -> Result<OutputLayer, Failed> {
    Ok(OutputLayerBuilder::new(config).build()?)
}

fn run_step(
    layer: &OutputLayer,
    scores: &Tensor,
    targets: Targets,
    alignments: &mut StepAlignments,
) -> Result<StepOutput, Failed> {
    let (time, batch, _) = scores.dims3()?;
    let index = ValidityMask::all_valid(time, batch);
    let input = StepInput {
        scores,
        index: &index,
        targets,
        phase: StepPhase::Train,
        tags: &[],
    };
    Ok(layer.step(&input, alignments)?)
}

fn loss_of(step: &StepOutput) -> Result<f32, Failed> {
    step.loss_value()?
        .ok_or_else(|| Failed::from("step produced no loss"))
}

fn ensure_close(name: &str, actual: f32, expected: f32, tol: f32) -> Result<(), Failed> {
    if (actual - expected).abs() > tol {
        return Err(format!("{name}: expected {expected}, got {actual}").into());
    }
    Ok(())
}

fn scenario_probs() -> Vec<Vec<f32>> {
    vec![vec![0.9, 0.1], vec![0.2, 0.8], vec![0.95, 0.05]]
}

fn ce_matches_hand_computation() -> Result<(), Failed> {
    let layer = build(OutputLayerConfig::new("output", 2, LossKind::Ce))?;
    let scores = log_scores(&scenario_probs())?;
    let step = run_step(
        &layer,
        &scores,
        framewise(&[0, 1, 0])?,
        &mut StepAlignments::default(),
    )?;
    let expected = -(0.9f32.ln() + 0.8f32.ln() + 0.95f32.ln());
    ensure_close("ce loss", loss_of(&step)?, expected, 1e-4)?;
    ensure_close("ce errors", step.errors.unwrap_or(f32::NAN), 0.0, 0.0)
}

fn ce_counts_reference_mismatches() -> Result<(), Failed> {
    let layer = build(OutputLayerConfig::new("output", 2, LossKind::Ce))?;
    let scores = log_scores(&scenario_probs())?;
    let step = run_step(
        &layer,
        &scores,
        framewise(&[1, 0, 0])?,
        &mut StepAlignments::default(),
    )?;
    ensure_close("ce errors", step.errors.unwrap_or(f32::NAN), 2.0, 0.0)
}

fn ce_frame_limit_truncates() -> Result<(), Failed> {
    let mut config = OutputLayerConfig::new("output", 2, LossKind::Ce);
    config.time_limit = TimeLimit::Frames(3);
    let layer = build(config)?;
    let scores = log_scores(&vec![vec![0.9, 0.1]; 5])?;
    let step = run_step(
        &layer,
        &scores,
        framewise(&[0; 5])?,
        &mut StepAlignments::default(),
    )?;
    if step.prepared.loss_mask.count() != 3 {
        return Err(format!("{} loss cells after truncation", step.prepared.loss_mask.count()).into());
    }
    ensure_close("norm", step.prepared.norm, 5.0 / 3.0, 1e-6)?;
    ensure_close("loss", loss_of(&step)?, -3.0 * 0.9f32.ln() * 5.0 / 3.0, 1e-4)
}

fn ce_sparse_agrees_with_dense() -> Result<(), Failed> {
    let layer = build(OutputLayerConfig::new("output", 2, LossKind::Ce))?;
    let scores = log_scores(&scenario_probs())?;
    let dense = run_step(
        &layer,
        &scores,
        framewise(&[0, 1, 0])?,
        &mut StepAlignments::default(),
    )?;
    let entries = [0usize, 1, 0]
        .iter()
        .enumerate()
        .map(|(time, &class)| SparseEntry {
            time,
            class,
            weight: 1.0,
        })
        .collect();
    let sparse = SparseTargets::new(3, vec![entries])?;
    let sparse = run_step(
        &layer,
        &scores,
        Targets::Sparse(sparse),
        &mut StepAlignments::default(),
    )?;
    ensure_close("sparse vs dense", loss_of(&sparse)?, loss_of(&dense)?, 1e-4)
}

fn fast_bw_alignment_rows_sum_to_one() -> Result<(), Failed> {
    let layer = build(OutputLayerConfig::new("bw", 3, LossKind::FastBw))?;
    let scores = log_scores(&[
        vec![0.6, 0.1, 0.3],
        vec![0.4, 0.2, 0.4],
        vec![0.1, 0.7, 0.2],
        vec![0.2, 0.5, 0.3],
    ])?;
    let targets = Targets::Dense(DenseLabels::from_sequences(&[vec![0, 1]])?);
    let mut alignments = StepAlignments::default();
    let step = run_step(&layer, &scores, targets, &mut alignments)?;
    if !loss_of(&step)?.is_finite() {
        return Err("fast_bw loss is not finite".into());
    }
    let bw = alignments
        .get("bw")
        .ok_or_else(|| Failed::from("no alignment cached under the layer name"))?;
    let rows: Vec<Vec<Vec<f32>>> = bw.to_vec3()?;
    for (t, frame) in rows.iter().enumerate() {
        ensure_close(&format!("frame {t}"), frame[0].iter().sum(), 1.0, 1e-4)?;
    }
    Ok(())
}

fn prior_uniform_update_is_stable() -> Result<(), Failed> {
    let mut config = OutputLayerConfig::new("output", 4, LossKind::Ce);
    config.priors.compute_priors = true;
    let mut layer = build(config)?;
    let scores = log_scores(&vec![vec![0.25; 4]; 3])?;
    let step = run_step(
        &layer,
        &scores,
        framewise(&[0, 1, 2])?,
        &mut StepAlignments::default(),
    )?;
    layer.update_priors(&step)?;
    let priors = layer
        .prior()
        .ok_or_else(|| Failed::from("no running prior"))?
        .priors()
        .to_vec();
    for (c, p) in priors.iter().enumerate() {
        ensure_close(&format!("prior {c}"), *p, 0.25, 1e-5)?;
    }
    Ok(())
}

fn ctc_prefers_the_label_order() -> Result<(), Failed> {
    let layer = build(OutputLayerConfig::new("ctc", 3, LossKind::Ctc))?;
    let forward = log_scores(&[
        vec![0.8, 0.1, 0.1],
        vec![0.7, 0.1, 0.2],
        vec![0.1, 0.7, 0.2],
        vec![0.1, 0.8, 0.1],
    ])?;
    let reversed = log_scores(&[
        vec![0.1, 0.8, 0.1],
        vec![0.1, 0.7, 0.2],
        vec![0.7, 0.1, 0.2],
        vec![0.8, 0.1, 0.1],
    ])?;
    let labels = || -> Result<Targets, Failed> {
        Ok(Targets::Dense(DenseLabels::from_sequences(&[vec![0, 1]])?))
    };
    let good = run_step(&layer, &forward, labels()?, &mut StepAlignments::default())?;
    let bad = run_step(&layer, &reversed, labels()?, &mut StepAlignments::default())?;
    let (good_loss, bad_loss) = (loss_of(&good)?, loss_of(&bad)?);
    if good_loss >= bad_loss {
        return Err(format!("ordered path {good_loss} not below reversed {bad_loss}").into());
    }
    ensure_close("ordered errors", good.errors.unwrap_or(f32::NAN), 0.0, 0.0)
}

fn random_probs(rng: &mut StdRng, time: usize, classes: usize) -> Vec<Vec<f32>> {
    (0..time)
        .map(|_| {
            let raw: Vec<f32> = (0..classes).map(|_| rng.gen_range(0.05f32..1.0)).collect();
            let total: f32 = raw.iter().sum();
            raw.into_iter().map(|v| v / total).collect()
        })
        .collect()
}

fn argmax(row: &[f32]) -> u32 {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0 as u32
}

fn argmax_reference_has_no_errors(seed: u64) -> Result<(), Failed> {
    let mut rng = StdRng::seed_from_u64(seed);
    let layer = build(OutputLayerConfig::new("output", 5, LossKind::Ce))?;
    for round in 0..PROPERTY_ROUNDS {
        let time = rng.gen_range(1..12);
        let probs = random_probs(&mut rng, time, 5);
        let reference: Vec<u32> = probs.iter().map(|row| argmax(row)).collect();
        let step = run_step(
            &layer,
            &log_scores(&probs)?,
            framewise(&reference)?,
            &mut StepAlignments::default(),
        )?;
        ensure_close(
            &format!("round {round} errors"),
            step.errors.unwrap_or(f32::NAN),
            0.0,
            0.0,
        )?;
        let expected: f32 = probs
            .iter()
            .zip(&reference)
            .map(|(row, &label)| -row[label as usize].ln())
            .sum();
        ensure_close(&format!("round {round} loss"), loss_of(&step)?, expected, 1e-3)?;
    }
    Ok(())
}

fn ctc_score_gradient_rows_cancel(seed: u64) -> Result<(), Failed> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let layer = build(OutputLayerConfig::new("ctc", 4, LossKind::Ctc))?;
    for round in 0..PROPERTY_ROUNDS {
        let labels: Vec<u32> = (0..rng.gen_range(1..4)).map(|_| rng.gen_range(0..3)).collect();
        // Repeated labels need a separating blank.
        let min_frames = labels.len() + labels.windows(2).filter(|w| w[0] == w[1]).count();
        let time = min_frames + rng.gen_range(0..5);
        let scores = Var::from_tensor(&log_scores(&random_probs(&mut rng, time, 4))?)?;
        let targets = Targets::Dense(DenseLabels::from_sequences(&[labels])?);
        let step = run_step(
            &layer,
            scores.as_tensor(),
            targets,
            &mut StepAlignments::default(),
        )?;
        let grad = step
            .score_gradient(scores.as_tensor())?
            .ok_or_else(|| Failed::from("ctc produced no score gradient"))?;
        let rows: Vec<Vec<Vec<f32>>> = grad.to_vec3()?;
        for (t, frame) in rows.iter().enumerate() {
            ensure_close(
                &format!("round {round} frame {t}"),
                frame[0].iter().sum(),
                0.0,
                1e-4,
            )?;
        }
    }
    Ok(())
}
