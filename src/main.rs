use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, bail};
use asl_translator::{
    config::AppConfig,
    dataset::{self, DatasetLayout, collect::CollectMode},
    evaluation,
    logging,
    model_download::{ModelKind, ModelStatus, ensure_model_ready},
    pipeline::{
        ModelSearch,
        camera::{CaptureSettings, SupervisedCamera, default_provider},
    },
    tester::{self, Command, LoopMode, TesterLoop, TesterSnapshot},
    web::{self, AppState},
};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

#[derive(Debug, Parser)]
#[command(name = "asl-translator", version, about = "Real-time American Sign Language recognition")]
struct Cli {
    /// TOML configuration file (defaults to ./asl.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `asl_translator=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Live recognition from the webcam.
    Tester {
        /// Print results to the terminal instead of opening a window.
        #[arg(long)]
        headless: bool,
        /// Camera index to try first.
        #[arg(long)]
        camera: Option<u32>,
    },
    /// JSON API for browser clients.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Record training samples for each sign.
    Collect {
        #[arg(value_enum)]
        mode: CollectArg,
        #[arg(long)]
        headless: bool,
        /// Dataset root directory.
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Score a classifier on the recorded landmark dataset.
    Evaluate {
        /// 100 samples per class and a few individual predictions.
        #[arg(long)]
        quick: bool,
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long)]
        data: Option<PathBuf>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Report which models, cameras and players are available.
    Check,
    /// Fetch the hand tracking models.
    DownloadModels,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CollectArg {
    Raw,
    Landmarks,
}

impl From<CollectArg> for CollectMode {
    fn from(arg: CollectArg) -> Self {
        match arg {
            CollectArg::Raw => CollectMode::Raw,
            CollectArg::Landmarks => CollectMode::Landmarks,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(filter) = cli.log_level {
        config.logging.filter = filter;
    }
    logging::init(&config.logging);

    match cli.command.unwrap_or(Cmd::Tester {
        headless: false,
        camera: None,
    }) {
        Cmd::Tester { headless, camera } => {
            if let Some(index) = camera {
                config.camera.indices.retain(|i| *i != index);
                config.camera.indices.insert(0, index);
            }
            run_loop(config, None, headless, "ASL Real-time Tester")
        }
        Cmd::Serve { host, port, workers } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            config.validate()?;
            serve(&config)
        }
        Cmd::Collect { mode, headless, data } => {
            if let Some(root) = data {
                config.dataset.root = root;
            }
            let title = match mode {
                CollectArg::Raw => "ASL Data Collection (raw)",
                CollectArg::Landmarks => "ASL Data Collection (landmarks)",
            };
            run_loop(config, Some(mode.into()), headless, title)
        }
        Cmd::Evaluate { quick, model, data, json } => {
            if model.is_some() {
                config.model.path = model;
            }
            if let Some(root) = data {
                config.dataset.root = root;
            }
            evaluate(&config, quick, json)
        }
        Cmd::Check => {
            check(&config);
            Ok(())
        }
        Cmd::DownloadModels => {
            for (kind, path) in [
                (ModelKind::PalmDetector, &config.tracker.palm_model),
                (ModelKind::HandposeEstimator, &config.tracker.handpose_model),
            ] {
                match ensure_model_ready(kind, path)? {
                    ModelStatus::AlreadyPresent => println!("{} model present: {}", kind.label(), path.display()),
                    ModelStatus::Downloaded { bytes } => {
                        println!("{} model downloaded: {} ({bytes} bytes)", kind.label(), path.display())
                    }
                }
            }
            Ok(())
        }
    }
}

fn serve(config: &AppConfig) -> Result<()> {
    let state = Arc::new(AppState::from_config(config));
    if !state.load_model() {
        log::warn!("starting without a sign classifier; POST /api/model/reload to retry");
    }
    state.spawn_janitor()?;
    web::serve(state)
}

fn run_loop(config: AppConfig, collect: Option<CollectMode>, headless: bool, title: &str) -> Result<()> {
    let mode = match collect {
        Some(mode) => tester::collect_mode(&config, mode)?,
        None => LoopMode::Recognize,
    };
    let (cmd_tx, cmd_rx) = unbounded();
    let (snap_tx, snap_rx) = bounded(1);
    let worker = tester::spawn_worker(move || TesterLoop::from_config(&config, mode), cmd_rx, snap_tx);

    if headless || !cfg!(feature = "desktop") {
        run_headless(snap_rx, cmd_tx);
    } else {
        run_window(title, snap_rx, cmd_tx, collect.is_some());
    }

    if worker.join().is_err() {
        bail!("tester worker panicked");
    }
    Ok(())
}

#[cfg(feature = "desktop")]
fn run_window(title: &str, snapshots: Receiver<TesterSnapshot>, commands: Sender<Command>, collecting: bool) {
    let title = title.to_string();
    gpui::Application::new()
        .with_assets(gpui_component_assets::Assets)
        .run(move |app| {
            gpui_component::init(app);

            if let Err(err) = asl_translator::ui::launch_ui(app, &title, snapshots, commands, collecting) {
                log::error!("failed to launch ui: {err:?}");
            }
        });
}

#[cfg(not(feature = "desktop"))]
fn run_window(_title: &str, snapshots: Receiver<TesterSnapshot>, commands: Sender<Command>, _collecting: bool) {
    run_headless(snapshots, commands);
}

/// Reads one key per line from stdin and prints status changes.
fn run_headless(snapshots: Receiver<TesterSnapshot>, commands: Sender<Command>) {
    println!("keys: q quit, c clear, r restart camera, d debug, e emergency, s capture, n/p next/prev sign");
    let input = commands.clone();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let key = line.trim().to_lowercase();
            match Command::from_key(&key) {
                Some(command) => {
                    if input.send(command).is_err() {
                        break;
                    }
                }
                None if key.is_empty() => {}
                None => println!("unknown key {key:?}"),
            }
        }
    });

    let mut last_status = String::new();
    let mut last_capture: Option<String> = None;
    for snapshot in snapshots.iter() {
        if snapshot.status != last_status {
            match &snapshot.banner {
                Some(banner) => println!("{}", banner.lines().join(" | ")),
                None if snapshot.hand_detected && snapshot.collect.is_none() => println!(
                    "{} ({:.0}%) fps {:.1}",
                    snapshot.status,
                    snapshot.confidence * 100.0,
                    snapshot.fps
                ),
                None => println!("{}", snapshot.status),
            }
            last_status = snapshot.status.clone();
        }
        let capture = snapshot.collect.and_then(|(_, last)| last);
        if capture.is_some() && capture != last_capture {
            println!("{}", capture.as_deref().unwrap_or_default());
            last_capture = capture;
        }
        for line in &snapshot.debug {
            println!("  {line}");
        }
    }
    drop(commands);
}

fn evaluate(config: &AppConfig, quick: bool, json: bool) -> Result<()> {
    let mut model = ModelSearch::from(&config.model).load_ort()?;
    println!("Loaded model: {}", model.path.display());
    let layout = DatasetLayout::new(&config.dataset.root);
    let signs = model.mapping.names().to_vec();

    if quick {
        let samples = dataset::load_landmarks(&layout, &signs, config.dataset.quick_samples_per_class)?;
        let quick = evaluation::quick_test(&mut model, &samples, 5)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&quick.report)?);
            return Ok(());
        }
        println!("Test Accuracy: {:.4}", quick.report.accuracy);
        println!("Test Samples: {}", quick.report.total);
        println!();
        println!("Sample Predictions:");
        for example in &quick.examples {
            let mark = if example.truth == example.predicted { "ok " } else { "bad" };
            println!(
                "  {mark} True: {:10} | Pred: {:10} | Conf: {:.4}",
                example.truth, example.predicted, example.confidence
            );
        }
        return Ok(());
    }

    let samples = dataset::load_landmarks(&layout, &signs, config.dataset.max_per_class)?;
    let split = dataset::stratified_split(&samples, config.dataset.test_fraction);
    let test = if split.test.is_empty() { samples } else { split.test };
    let report = evaluation::evaluate(&mut model, &test)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        print!("{report}");
    }
    Ok(())
}

fn check(config: &AppConfig) {
    let mark = |ok: bool| if ok { "[ok]     " } else { "[missing]" };

    println!("Hand tracking models:");
    for path in [&config.tracker.palm_model, &config.tracker.handpose_model] {
        println!("  {} {}", mark(path.is_file()), path.display());
    }

    println!("Sign classifiers (in load order):");
    let candidates = ModelSearch::from(&config.model).candidates();
    if candidates.is_empty() {
        println!("  {} no .onnx classifier found", mark(false));
    }
    for path in candidates {
        println!("  {} {}", mark(true), path.display());
    }

    println!("Cameras:");
    let camera = SupervisedCamera::new(default_provider(), CaptureSettings::from(&config.camera));
    match camera.list_devices() {
        Ok(devices) if !devices.is_empty() => {
            for device in devices {
                println!("  {} {}: {}", mark(true), device.index, device.label);
            }
        }
        Ok(_) => println!("  {} no cameras detected", mark(false)),
        Err(err) => println!("  {} {err:#}", mark(false)),
    }

    println!("Audio players:");
    for command in &config.tts.players {
        let Some(program) = command.first() else { continue };
        let found = std::process::Command::new(program)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        println!("  {} {program}", mark(found));
    }

    let layout = DatasetLayout::new(&config.dataset.root);
    println!("Dataset ({}):", layout.root().display());
    for sign in &config.dataset.signs {
        println!(
            "  {sign:10} raw {:5}  annotated {:5}  landmarks {:5}",
            layout.count_raw(sign),
            layout.count_annotated(sign),
            layout.landmark_files(sign).len()
        );
    }
}
