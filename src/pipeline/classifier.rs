use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use ndarray::Array2;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use crate::classes::ClassMapping;
use crate::config::ModelConfig;
use crate::error::ResourceError;
use crate::model_download::ModelKind;
use crate::recovery::first_success;
use crate::types::{FEATURE_LEN, LandmarkVector, Prediction};

/// Maps a landmark vector to a probability distribution over sign classes.
pub trait SignClassifier: Send {
    fn predict(&mut self, input: &LandmarkVector) -> Result<Vec<f32>>;
}

pub struct OrtSignClassifier {
    session: Session,
}

impl OrtSignClassifier {
    pub fn load(path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(path)
            .with_context(|| format!("failed to load sign classifier from {}", path.display()))?;
        Ok(Self { session })
    }
}

impl SignClassifier for OrtSignClassifier {
    fn predict(&mut self, input: &LandmarkVector) -> Result<Vec<f32>> {
        let array = Array2::from_shape_vec((1, FEATURE_LEN), input.as_slice().to_vec())
            .map_err(|err| anyhow!("failed to build classifier input: {err}"))?;
        let tensor = Tensor::from_array(array)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run sign classifier")?;
        if outputs.len() < 1 {
            bail!("sign classifier returned no outputs");
        }
        let raw: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        Ok(to_probabilities(raw))
    }
}

/// Exported models may or may not end in a softmax layer.
pub fn to_probabilities(raw: Vec<f32>) -> Vec<f32> {
    let sum: f32 = raw.iter().sum();
    let is_distribution = raw.iter().all(|p| (0.0..=1.0).contains(p)) && (sum - 1.0).abs() < 1e-3;
    if raw.is_empty() || is_distribution {
        return raw;
    }
    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = raw.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / total).collect()
}

/// A classifier that passed its dry run, together with the class names it predicts.
pub struct LoadedModel {
    pub classifier: Box<dyn SignClassifier>,
    pub path: PathBuf,
    pub mapping: ClassMapping,
}

impl LoadedModel {
    pub fn predict(&mut self, input: &LandmarkVector) -> Result<Prediction> {
        let probabilities = self.classifier.predict(input)?;
        let mapping = &self.mapping;
        Prediction::from_probabilities(probabilities, |idx| {
            mapping
                .name(idx)
                .map(str::to_string)
                .unwrap_or_else(|| format!("class_{idx}"))
        })
        .ok_or_else(|| anyhow!("classifier returned an empty distribution"))
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("path", &self.path)
            .field("mapping", &self.mapping)
            .finish()
    }
}

/// Where to look for the sign classifier and its class mapping.
#[derive(Clone, Debug)]
pub struct ModelSearch {
    pub explicit: Option<PathBuf>,
    pub dirs: Vec<PathBuf>,
    pub patterns: Vec<String>,
    pub mapping_paths: Vec<PathBuf>,
}

impl From<&ModelConfig> for ModelSearch {
    fn from(config: &ModelConfig) -> Self {
        let mut mapping_paths = Vec::new();
        if let Some(path) = &config.class_mapping {
            mapping_paths.push(path.clone());
        }
        if let Some(parent) = config.path.as_ref().and_then(|p| p.parent()) {
            mapping_paths.push(parent.join("class_mapping.json"));
        }
        mapping_paths.extend(config.search_dirs.iter().map(|d| d.join("class_mapping.json")));
        mapping_paths.push(PathBuf::from("class_mapping.json"));
        Self {
            explicit: config.path.clone(),
            dirs: config.search_dirs.clone(),
            patterns: config.patterns.clone(),
            mapping_paths,
        }
    }
}

impl ModelSearch {
    /// Explicit path first, then each pattern tier across all directories,
    /// newest file name first within a tier. Tracker weights are skipped.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = Vec::new();
        if let Some(path) = &self.explicit {
            if path.is_file() {
                found.push(path.clone());
            } else {
                log::warn!("configured model {path:?} does not exist");
            }
        }
        for pattern in &self.patterns {
            let mut tier = Vec::new();
            for dir in &self.dirs {
                let query = dir.join(pattern);
                let Some(query) = query.to_str() else {
                    continue;
                };
                match glob::glob(query) {
                    Ok(paths) => tier.extend(paths.filter_map(Result::ok).filter(|p| p.is_file())),
                    Err(err) => log::warn!("invalid model pattern {query:?}: {err}"),
                }
            }
            tier.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
            for path in tier {
                if ModelKind::is_tracker_file(&path) || found.contains(&path) {
                    continue;
                }
                found.push(path);
            }
        }
        found
    }

    /// Loads the first candidate that survives a dry run on a zero vector.
    pub fn load<F>(&self, mut loader: F) -> Result<LoadedModel, ResourceError>
    where
        F: FnMut(&Path) -> Result<Box<dyn SignClassifier>>,
    {
        let candidates = self.candidates();
        let (classifier, path) = first_success(&candidates, "sign classifier", |path| {
            let mut classifier = loader(path)?;
            let probabilities = classifier
                .predict(&LandmarkVector::zeros())
                .context("dry run failed")?;
            if probabilities.is_empty() {
                bail!("dry run returned an empty distribution");
            }
            Ok(classifier)
        })?;
        let mapping = ClassMapping::load_first(&self.mapping_paths);
        Ok(LoadedModel {
            classifier,
            path,
            mapping,
        })
    }

    pub fn load_ort(&self) -> Result<LoadedModel, ResourceError> {
        self.load(|path| Ok(Box::new(OrtSignClassifier::load(path)?) as Box<dyn SignClassifier>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixed(Vec<f32>);

    impl SignClassifier for Fixed {
        fn predict(&mut self, _input: &LandmarkVector) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn search(dir: &Path) -> ModelSearch {
        ModelSearch::from(&ModelConfig {
            search_dirs: vec![dir.to_path_buf()],
            ..ModelConfig::default()
        })
    }

    #[test]
    fn softmax_only_when_needed() {
        let dist = vec![0.2, 0.3, 0.5];
        assert_eq!(to_probabilities(dist.clone()), dist);
        let logits = to_probabilities(vec![2.0, 1.0, 0.0]);
        assert!((logits.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(logits[0] > logits[1] && logits[1] > logits[2]);
    }

    #[test]
    fn candidate_tiers_and_ordering() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "asl_model_20240101.onnx",
            "best_asl_model_20240101.onnx",
            "best_asl_model_20240301.onnx",
            "other.onnx",
            ModelKind::PalmDetector.filename(),
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<String> = search(dir.path())
            .candidates()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "best_asl_model_20240301.onnx",
                "best_asl_model_20240101.onnx",
                "asl_model_20240101.onnx",
                "other.onnx",
            ]
        );
    }

    #[test]
    fn explicit_path_comes_first() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom.onnx");
        fs::write(&explicit, b"x").unwrap();
        fs::write(dir.path().join("final_asl_model_1.onnx"), b"x").unwrap();
        let mut s = search(dir.path());
        s.explicit = Some(explicit.clone());
        let candidates = s.candidates();
        assert_eq!(candidates[0], explicit);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn rejects_candidates_failing_the_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("final_asl_model_2.onnx"), b"x").unwrap();
        fs::write(dir.path().join("final_asl_model_1.onnx"), b"x").unwrap();
        fs::write(
            dir.path().join("class_mapping.json"),
            r#"{"0": "a", "1": "b"}"#,
        )
        .unwrap();

        let model = search(dir.path())
            .load(|path| {
                if path.ends_with("final_asl_model_2.onnx") {
                    Ok(Box::new(Fixed(Vec::new())) as Box<dyn SignClassifier>)
                } else {
                    Ok(Box::new(Fixed(vec![0.1, 0.9])) as Box<dyn SignClassifier>)
                }
            })
            .unwrap();
        assert!(model.path.ends_with("final_asl_model_1.onnx"));
        assert_eq!(model.mapping.names(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_directory_has_no_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let err = search(dir.path())
            .load(|_| Ok(Box::new(Fixed(vec![1.0])) as Box<dyn SignClassifier>))
            .unwrap_err();
        assert!(matches!(err, ResourceError::NoCandidates { .. }));
    }

    #[test]
    fn prediction_uses_mapping_names() {
        let mut model = LoadedModel {
            classifier: Box::new(Fixed(vec![0.1, 0.7, 0.2])),
            path: PathBuf::from("m.onnx"),
            mapping: ClassMapping::default(),
        };
        let p = model.predict(&LandmarkVector::zeros()).unwrap();
        assert_eq!(p.label, "hello");
        assert!((p.confidence - 0.7).abs() < 1e-6);
    }
}
