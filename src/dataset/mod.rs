pub mod collect;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ndarray::{Array1, ArrayD};
use ndarray_npy::{read_npy, write_npy};

use crate::types::{FEATURE_LEN, LandmarkVector};

/// On-disk layout shared by the collectors and the evaluation harness.
#[derive(Clone, Debug)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, sign: &str) -> PathBuf {
        self.root.join("raw").join(sign)
    }

    pub fn images_dir(&self, sign: &str) -> PathBuf {
        self.root.join("processed").join(sign).join("images")
    }

    pub fn landmarks_dir(&self, sign: &str) -> PathBuf {
        self.root.join("processed").join(sign).join("landmarks")
    }

    pub fn raw_image_path(&self, sign: &str, index: usize) -> PathBuf {
        self.raw_dir(sign).join(format!("{sign}_{index:04}.jpg"))
    }

    pub fn annotated_image_path(&self, sign: &str, index: usize) -> PathBuf {
        self.images_dir(sign)
            .join(format!("{sign}_mediapipe_{index:04}.jpg"))
    }

    pub fn landmark_path(&self, sign: &str, index: usize) -> PathBuf {
        self.landmarks_dir(sign)
            .join(format!("{sign}_landmarks_{index:04}.npy"))
    }

    pub fn count_raw(&self, sign: &str) -> usize {
        count_with_extension(&self.raw_dir(sign), "jpg")
    }

    pub fn count_annotated(&self, sign: &str) -> usize {
        count_with_extension(&self.images_dir(sign), "jpg")
    }

    pub fn landmark_files(&self, sign: &str) -> Vec<PathBuf> {
        let mut files = files_with_extension(&self.landmarks_dir(sign), "npy");
        files.sort();
        files
    }
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
        })
        .collect()
}

fn count_with_extension(dir: &Path, ext: &str) -> usize {
    files_with_extension(dir, ext).len()
}

/// Reads a landmark array of any shape. NumPy writes float64 by default;
/// float32 files are accepted too.
pub fn read_landmark_file(path: &Path) -> Result<Vec<f32>> {
    match read_npy::<_, ArrayD<f64>>(path) {
        Ok(array) => Ok(array.iter().map(|v| *v as f32).collect()),
        Err(f64_err) => {
            let array: ArrayD<f32> = read_npy(path).with_context(|| {
                format!("failed to read landmarks {path:?} as f64 ({f64_err}) or f32")
            })?;
            Ok(array.iter().copied().collect())
        }
    }
}

pub fn write_landmark_file(path: &Path, vector: &LandmarkVector) -> Result<()> {
    let array: Array1<f64> = vector.as_slice().iter().map(|v| *v as f64).collect();
    write_npy(path, &array).with_context(|| format!("failed to write landmarks {path:?}"))
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledSample {
    pub label: usize,
    pub vector: LandmarkVector,
}

/// Loads up to `max_per_class` landmark vectors per sign, in file name order.
/// Files of the wrong length or all zeros are skipped.
pub fn load_landmarks(layout: &DatasetLayout, signs: &[String], max_per_class: usize) -> Result<Vec<LabeledSample>> {
    let mut samples = Vec::new();
    for (label, sign) in signs.iter().enumerate() {
        let mut loaded = 0;
        let mut skipped = 0;
        for path in layout.landmark_files(sign) {
            if loaded >= max_per_class {
                break;
            }
            let values = match read_landmark_file(&path) {
                Ok(values) => values,
                Err(err) => {
                    log::warn!("{err:#}");
                    skipped += 1;
                    continue;
                }
            };
            if values.len() != FEATURE_LEN {
                skipped += 1;
                continue;
            }
            let vector = match LandmarkVector::try_from_values(&values) {
                Ok(vector) if !vector.is_all_zero() => vector,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            samples.push(LabeledSample { label, vector });
            loaded += 1;
        }
        log::info!("{sign}: loaded {loaded} samples, skipped {skipped}");
    }
    if samples.is_empty() {
        bail!("no landmark data found under {:?}", layout.root());
    }
    Ok(samples)
}

#[derive(Clone, Debug, Default)]
pub struct Split {
    pub train: Vec<LabeledSample>,
    pub test: Vec<LabeledSample>,
}

/// Per-class split that takes evenly spaced samples for the test set, so the
/// same dataset always yields the same split.
pub fn stratified_split(samples: &[LabeledSample], test_fraction: f32) -> Split {
    let classes = samples.iter().map(|s| s.label + 1).max().unwrap_or(0);
    let mut split = Split::default();
    for class in 0..classes {
        let members: Vec<&LabeledSample> = samples.iter().filter(|s| s.label == class).collect();
        let n = members.len();
        let mut n_test = (n as f32 * test_fraction).round() as usize;
        if n_test == 0 && test_fraction > 0.0 && n >= 2 {
            n_test = 1;
        }
        let n_test = n_test.min(n.saturating_sub(1));
        let test_idx: Vec<usize> = (0..n_test)
            .map(|k| ((k as f32 + 0.5) * n as f32 / n_test as f32) as usize)
            .collect();
        for (idx, sample) in members.into_iter().enumerate() {
            if test_idx.contains(&idx) {
                split.test.push(sample.clone());
            } else {
                split.train.push(sample.clone());
            }
        }
    }
    split
}

/// First `per_class` samples of every class.
pub fn take_per_class(samples: &[LabeledSample], per_class: usize) -> Vec<LabeledSample> {
    let mut counts = std::collections::HashMap::new();
    samples
        .iter()
        .filter(|s| {
            let seen = counts.entry(s.label).or_insert(0usize);
            *seen += 1;
            *seen <= per_class
        })
        .cloned()
        .collect()
}

pub fn class_counts(samples: &[LabeledSample], classes: usize) -> Vec<usize> {
    let mut counts = vec![0; classes];
    for sample in samples {
        if let Some(slot) = counts.get_mut(sample.label) {
            *slot += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(label: usize, seed: f32) -> LabeledSample {
        LabeledSample {
            label,
            vector: LandmarkVector::from_slice_padded(&[seed; FEATURE_LEN]),
        }
    }

    #[test]
    fn paths_follow_dataset_naming() {
        let layout = DatasetLayout::new("dataset");
        assert_eq!(
            layout.raw_image_path("hello", 7),
            PathBuf::from("dataset/raw/hello/hello_0007.jpg")
        );
        assert_eq!(
            layout.annotated_image_path("yes", 12),
            PathBuf::from("dataset/processed/yes/images/yes_mediapipe_0012.jpg")
        );
        assert_eq!(
            layout.landmark_path("no", 1234),
            PathBuf::from("dataset/processed/no/landmarks/no_landmarks_1234.npy")
        );
    }

    #[test]
    fn loader_filters_bad_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        let signs = vec!["bye".to_string(), "hello".to_string()];
        for sign in &signs {
            fs::create_dir_all(layout.landmarks_dir(sign)).unwrap();
        }
        write_landmark_file(&layout.landmark_path("bye", 0), &LandmarkVector::from_slice_padded(&[0.3; 63])).unwrap();
        write_landmark_file(&layout.landmark_path("bye", 1), &LandmarkVector::zeros()).unwrap();
        let short: Array1<f64> = Array1::from_elem(10, 0.5);
        write_npy(layout.landmark_path("bye", 2), &short).unwrap();
        let f32_grid: ndarray::Array2<f32> = ndarray::Array2::from_elem((21, 3), 0.25);
        write_npy(layout.landmark_path("hello", 0), &f32_grid).unwrap();
        fs::write(layout.landmark_path("hello", 1), b"garbage").unwrap();

        let samples = load_landmarks(&layout, &signs, 1000).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label, 0);
        assert!((samples[0].vector.as_slice()[5] - 0.3).abs() < 1e-6);
        assert_eq!(samples[1].label, 1);
        assert_eq!(samples[1].vector.as_slice()[62], 0.25);
    }

    #[test]
    fn loader_respects_class_cap_and_reports_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        let signs = vec!["yes".to_string()];
        assert!(load_landmarks(&layout, &signs, 10).is_err());

        fs::create_dir_all(layout.landmarks_dir("yes")).unwrap();
        for i in 0..5 {
            write_landmark_file(&layout.landmark_path("yes", i), &LandmarkVector::from_slice_padded(&[1.0; 63])).unwrap();
        }
        assert_eq!(load_landmarks(&layout, &signs, 3).unwrap().len(), 3);
        assert_eq!(layout.landmark_files("yes").len(), 5);
    }

    #[test]
    fn split_is_stratified_and_deterministic() {
        let mut samples = Vec::new();
        for i in 0..20 {
            samples.push(sample(0, i as f32 + 1.0));
        }
        for i in 0..10 {
            samples.push(sample(1, i as f32 + 100.0));
        }
        let a = stratified_split(&samples, 0.15);
        let b = stratified_split(&samples, 0.15);
        assert_eq!(a.test, b.test);
        assert_eq!(class_counts(&a.test, 2), vec![3, 2]);
        assert_eq!(a.train.len() + a.test.len(), samples.len());
    }

    #[test]
    fn tiny_classes_keep_a_training_sample() {
        let samples = vec![sample(0, 1.0)];
        let split = stratified_split(&samples, 0.5);
        assert_eq!(split.train.len(), 1);
        assert!(split.test.is_empty());
    }

    #[test]
    fn per_class_subset() {
        let samples: Vec<_> = (0..10).map(|i| sample(i % 2, i as f32 + 1.0)).collect();
        let subset = take_per_class(&samples, 2);
        assert_eq!(class_counts(&subset, 2), vec![2, 2]);
    }
}
