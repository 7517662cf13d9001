use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

use crate::recovery::{RetryPolicy, retry};

/// Published MediaPipe hand tracking weights used by the landmark extractor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    PalmDetector,
    HandposeEstimator,
}

const MODEL_BASE_URL: &str =
    "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models";

const DOWNLOAD_POLICY: RetryPolicy = RetryPolicy::fixed(3, Duration::from_secs(2));

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::PalmDetector, ModelKind::HandposeEstimator];

    pub fn filename(&self) -> &'static str {
        match self {
            ModelKind::PalmDetector => "palm_detection_mediapipe_2023feb.onnx",
            ModelKind::HandposeEstimator => "handpose_estimation_mediapipe_2023feb.onnx",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelKind::PalmDetector => "palm detector",
            ModelKind::HandposeEstimator => "hand landmark",
        }
    }

    pub fn url(&self) -> String {
        format!("{MODEL_BASE_URL}/{}", self.filename())
    }

    pub fn default_path(&self) -> PathBuf {
        PathBuf::from("models").join(self.filename())
    }

    /// Tracker weights share the model directory with sign classifiers; the
    /// classifier search must not pick them up.
    pub fn is_tracker_file(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        ModelKind::ALL.iter().any(|kind| kind.filename() == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelStatus {
    AlreadyPresent,
    Downloaded { bytes: u64 },
}

/// Makes sure `path` exists, fetching it with a terminal progress bar when
/// missing. Failed transfers are retried.
pub fn ensure_model_ready(model: ModelKind, path: &Path) -> Result<ModelStatus> {
    if path.is_file() {
        log::debug!("{} model already present at {}", model.label(), path.display());
        return Ok(ModelStatus::AlreadyPresent);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()
        .context("failed to build http client")?;
    let what = format!("{} model download", model.label());
    let bytes = retry(&DOWNLOAD_POLICY, &what, |_| download(&client, model, path))?;
    log::info!("{} model ready ({bytes} bytes)", model.label());
    Ok(ModelStatus::Downloaded { bytes })
}

pub fn ensure_tracker_models(palm: &Path, handpose: &Path) -> Result<()> {
    ensure_model_ready(ModelKind::PalmDetector, palm)?;
    ensure_model_ready(ModelKind::HandposeEstimator, handpose)?;
    Ok(())
}

/// Streams into `<dest>.download` and renames once complete, so an
/// interrupted transfer never leaves a truncated model behind.
fn download(client: &Client, model: ModelKind, dest: &Path) -> Result<u64> {
    let url = model.url();
    log::info!("downloading {} model from {url}", model.label());
    let mut response = client
        .get(&url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let partial = dest.with_extension("download");
    let file = File::create(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let progress = progress_bar(model, response.content_length());
    let mut writer = progress.wrap_write(BufWriter::new(file));

    let copied = io::copy(&mut response, &mut writer);
    let finished = copied.and_then(|bytes| writer.flush().map(|()| bytes));
    let bytes = match finished {
        Ok(bytes) => bytes,
        Err(err) => {
            progress.abandon_with_message("download interrupted");
            let _ = fs::remove_file(&partial);
            return Err(err).context("failed while writing model to disk");
        }
    };
    drop(writer);

    fs::rename(&partial, dest).with_context(|| {
        format!("failed to move {} into place at {}", partial.display(), dest.display())
    })?;
    progress.finish_with_message(format!("{} model ready", model.label()));
    Ok(bytes)
}

fn progress_bar(model: ModelKind, total: Option<u64>) -> ProgressBar {
    let Some(total) = total.filter(|t| *t > 0) else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg} {bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("downloading {} model", model.label()));
        pb.enable_steady_tick(Duration::from_millis(100));
        return pb;
    };
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{msg:20} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .map(|style| style.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(model.label());
    pb
}
