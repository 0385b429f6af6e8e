// =============================================================================
// Train Loop — a linear classifier driven by a cadence workflow
// =============================================================================
//
// Trains a softmax linear classifier on synthetic Gaussian blobs. The loop is
// a unit graph run tick by tick; Decision stops it once the validation error
// stops improving (or at max_epochs) and keeps the best snapshot on disk.
//
//   start → repeater → loader → forward → evaluator → decision → gd ─┐
//              ↑                                          └→ end_point │
//              └───────────────────────────────────────────────────────┘
//
// Ctrl-C blocks the gd unit: the current tick finishes, the loop drains and
// the current parameters are written to `train_loop_interrupted.ckpt`, next
// to the best snapshot.
//
// Usage:
//   cargo run -p train-loop                              # defaults
//   cargo run -p train-loop -- --config run.json         # JSON config
//   cargo run -p train-loop -- --resume snapshots/x.ckpt --epochs 80
//   RUST_LOG=debug cargo run -p train-loop -- --profile  # per-unit timings

mod units;

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use cadence::checkpoint;
use cadence::metrics::MIN_SENTINEL;
use cadence::prelude::*;
use cadence::{DeviceRef, MirrorDevice};

use units::{Evaluator, Forward, GradientDescent};

// Configuration

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    samples: usize,
    dims: usize,
    labels: usize,
    spread: f64,
    seed: u64,
    learning_rate: f64,
    loader: LoaderConfig,
    decision: DecisionConfig,
    checkpoint_dir: PathBuf,
    /// Run buffers through a mirrored device instead of the host.
    mirror_device: bool,
    max_ticks: Option<u64>,
    profile: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            samples: 3000,
            dims: 8,
            labels: 4,
            spread: 1.5,
            seed: 42,
            learning_rate: 0.5,
            loader: LoaderConfig::default()
                .minibatch_size(100)
                .class_samples(500, 500, 2000),
            decision: DecisionConfig::default().fail_iterations(5).max_epochs(50),
            checkpoint_dir: PathBuf::from("snapshots"),
            mirror_device: false,
            max_ticks: None,
            profile: false,
        }
    }
}

struct Args {
    config: Config,
    resume: Option<PathBuf>,
}

fn usage() {
    println!("Train a linear classifier with a cadence workflow");
    println!();
    println!("Options:");
    println!("  --config <path>    JSON config (missing fields use defaults)");
    println!("  --resume <path>    Continue from a .ckpt snapshot");
    println!("  --epochs <n>       Override decision.max_epochs");
    println!("  --mirror           Mirror buffers onto a simulated device");
    println!("  --profile          Print the per-unit timing report");
}

fn parse_args() -> Result<Args> {
    let mut config = Config::default();
    let mut resume = None;
    let mut epochs = None;
    let mut mirror = false;
    let mut profile = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| Error::msg(format!("{flag} needs a value")))
        };
        match arg.as_str() {
            "--config" => {
                let path = value("--config")?;
                let text = std::fs::read_to_string(&path)?;
                config = serde_json::from_str(&text)
                    .map_err(|e| Error::msg(format!("invalid config {path}: {e}")))?;
            }
            "--resume" => resume = Some(PathBuf::from(value("--resume")?)),
            "--epochs" => {
                let n = value("--epochs")?;
                epochs = Some(
                    n.parse()
                        .map_err(|_| Error::msg(format!("invalid --epochs: {n}")))?,
                );
            }
            "--mirror" => mirror = true,
            "--profile" => profile = true,
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => return Err(Error::msg(format!("unknown argument: {other}"))),
        }
    }

    if let Some(n) = epochs {
        config.decision.max_epochs = Some(n);
    }
    config.mirror_device |= mirror;
    config.profile |= profile;
    Ok(Args { config, resume })
}

// Training

fn run(args: Args) -> Result<()> {
    let cfg = args.config;
    info!("config: {}", serde_json::to_string(&cfg).unwrap_or_default());

    let dataset = SyntheticBlobs::new(cfg.samples, cfg.dims, cfg.labels, cfg.spread, cfg.seed)?;
    let loader = ClassLoader::new(Box::new(dataset), cfg.loader.clone());
    let minibatch = loader.minibatch();
    let (rows, k, d) = (cfg.loader.minibatch_size, cfg.labels, cfg.dims);

    let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
    let init: Vec<f64> = (0..k * d).map(|_| rng.gen_range(-0.01..0.01)).collect();
    let weights = Buffer::from_vec("weights", [k, d], init)?;
    let bias = Buffer::zeros("bias", [k]);
    let output = Buffer::zeros("output", [rows, k]);
    let err_output = Buffer::zeros("err_output", [rows, k]);
    let n_err = Buffer::zeros("minibatch_n_err", [1]);
    let metrics = Buffer::from_vec("minibatch_metrics", [3], vec![0.0, 0.0, MIN_SENTINEL])?;
    let confusion = Buffer::zeros("minibatch_confusion_matrix", [k, k]);
    let mse = Buffer::zeros("minibatch_mse", [rows]);

    let mut decision = Decision::new(
        cfg.decision.clone(),
        minibatch.clone(),
        cfg.loader.class_samples,
    )
    .with_parameters(vec![
        ("weights".to_string(), weights.clone()),
        ("bias".to_string(), bias.clone()),
    ])
    .with_writer(Box::new(FileCheckpointWriter::new(
        &cfg.checkpoint_dir,
        "train_loop",
    )));
    if let Some(path) = &args.resume {
        let snapshot = checkpoint::load(path)?;
        let restored = decision.restore_snapshot(&snapshot)?;
        info!(
            "resumed from {} (epoch {}, {} parameters)",
            path.display(),
            snapshot.epoch_number,
            restored
        );
    }
    let complete = decision.complete();
    let gd_skip = decision.gd_skip();
    let eval_class = cfg.loader.class_samples.evaluation_class();

    // Graph

    let mut wf = Workflow::new("train_loop");
    let data = loader.data();
    let labels = loader.labels();
    let loader = wf.add(loader);
    let forward = wf.add(Forward::new(minibatch.clone()));
    let evaluator = wf.add(Evaluator::new(minibatch.clone()));
    let decision = wf.add(decision);
    let gd = wf.add(GradientDescent::new(minibatch, cfg.learning_rate));

    wf.link_from(loader, &[wf.repeater()])?;
    wf.link_from(forward, &[loader])?;
    wf.link_from(evaluator, &[forward])?;
    wf.link_from(decision, &[evaluator])?;
    wf.link_from(gd, &[decision])?;
    wf.link_from(wf.repeater(), &[gd])?;
    wf.link_from(wf.end_point(), &[decision])?;

    wf.bind(forward, "input", &data, Access::Read)?;
    wf.bind(forward, "weights", &weights, Access::Read)?;
    wf.bind(forward, "bias", &bias, Access::Read)?;
    wf.bind(forward, "output", &output, Access::Write)?;

    wf.bind(evaluator, "output", &output, Access::Read)?;
    wf.bind(evaluator, "labels", &labels, Access::Read)?;
    wf.bind(evaluator, "err_output", &err_output, Access::Write)?;
    wf.bind(evaluator, "minibatch_n_err", &n_err, Access::ReadWrite)?;
    wf.bind(evaluator, "minibatch_metrics", &metrics, Access::ReadWrite)?;
    wf.bind(evaluator, "minibatch_confusion_matrix", &confusion, Access::ReadWrite)?;
    wf.bind(evaluator, "minibatch_mse", &mse, Access::Write)?;

    wf.bind(decision, "minibatch_n_err", &n_err, Access::Read)?;
    wf.bind(decision, "minibatch_metrics", &metrics, Access::Read)?;
    wf.bind(decision, "minibatch_confusion_matrix", &confusion, Access::Read)?;
    wf.bind(decision, "minibatch_mse", &mse, Access::Read)?;
    wf.bind(decision, "sample_input", &data, Access::Read)?;
    wf.bind(decision, "sample_output", &output, Access::Read)?;

    wf.bind(gd, "input", &data, Access::Read)?;
    wf.bind(gd, "err_output", &err_output, Access::Read)?;
    wf.bind(gd, "weights", &weights, Access::ReadWrite)?;
    wf.bind(gd, "bias", &bias, Access::ReadWrite)?;

    wf.set_gate_block(loader, Gate::on(complete.clone()))?;
    wf.set_gate_block(wf.end_point(), Gate::unless(complete))?;
    wf.set_gate_skip(gd, Gate::on(gd_skip))?;

    let interrupt = Signal::new("interrupt", false);
    let interrupted = interrupt.reader();
    wf.set_gate_block(gd, Gate::from(&interrupt))?;
    ctrlc::set_handler(move || interrupt.set(true))
        .map_err(|e| Error::msg(format!("cannot install Ctrl-C handler: {e}")))?;

    // Run

    let mut runtime = RuntimeConfig::default().with_profiling(cfg.profile);
    if cfg.mirror_device {
        let device: DeviceRef = Arc::new(MirrorDevice::new(0));
        runtime = runtime.with_device(device);
    }
    if let Some(n) = cfg.max_ticks {
        runtime = runtime.with_max_ticks(n);
    }
    wf.initialize(runtime)?;
    let report = wf.run()?;

    let decision = wf.unit::<Decision>(decision)?;
    if interrupted.get() {
        warn!("interrupted at epoch {}", decision.epoch_number());
        FileCheckpointWriter::new(&cfg.checkpoint_dir, "train_loop")
            .write_aside(&decision.capture()?, "interrupted")?;
    } else if !report.finished {
        warn!("stopped at the tick limit after {} ticks", report.ticks);
    }

    let state = decision.state();
    println!();
    println!(
        "epochs: {}  best epoch: {}  snapshots: {}",
        state.epoch_number,
        state
            .best_epoch
            .map_or_else(|| "-".to_string(), |e| e.to_string()),
        decision.snapshots_written()
    );
    for class in MinibatchClass::ALL {
        if cfg.loader.class_samples.get(class) > 0 {
            println!(
                "  {:<10} {:>6.2}% errors",
                class.as_str(),
                state.epoch_n_err_pt[class.index()]
            );
        }
    }
    if let Some(all) = decision.all_mse(eval_class) {
        let worst = all.iter().copied().fold(0.0, f64::max);
        println!("  worst {eval_class} sample error {worst:.4}");
    }
    if let (Some(x), Some(y)) = (decision.sample_input(), decision.sample_output()) {
        println!("  sample {x:.2?} scored {y:.2?}");
    }
    if let Some(cm) = decision.confusion_matrix(eval_class) {
        println!();
        println!(
            "{} confusion matrix ({:.2}% accurate):",
            eval_class,
            100.0 * cm.accuracy()
        );
        print!("{}", cm.to_string_table());
    }
    if let Some(profile) = wf.profile_report() {
        println!();
        println!("{profile}");
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = parse_args().and_then(run) {
        log::error!("{e}");
        std::process::exit(1);
    }
}
