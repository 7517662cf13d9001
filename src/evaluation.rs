use std::fmt;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::classes::ClassMapping;
use crate::dataset::LabeledSample;
use crate::pipeline::classifier::LoadedModel;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub name: String,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub support: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ConfidenceSummary {
    pub count: usize,
    pub mean: f32,
    pub min: f32,
    pub max: f32,
}

impl ConfidenceSummary {
    fn from_values(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f32 = values.iter().sum();
        Some(Self {
            count: values.len(),
            mean: sum / values.len() as f32,
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SamplePrediction {
    pub truth: String,
    pub predicted: String,
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct EvaluationReport {
    pub class_names: Vec<String>,
    pub total: usize,
    pub correct: usize,
    pub accuracy: f32,
    /// `confusion[truth][predicted]`.
    pub confusion: Vec<Vec<usize>>,
    pub per_class: Vec<ClassMetrics>,
    pub correct_confidence: Option<ConfidenceSummary>,
    pub incorrect_confidence: Option<ConfidenceSummary>,
    /// Samples the classifier failed on; not part of the totals.
    pub failed: usize,
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 { 0.0 } else { num as f32 / den as f32 }
}

pub fn report_from_predictions(
    truth: &[usize],
    predicted: &[usize],
    confidence: &[f32],
    mapping: &ClassMapping,
) -> EvaluationReport {
    let n = truth.len().min(predicted.len()).min(confidence.len());
    let classes = truth[..n]
        .iter()
        .chain(&predicted[..n])
        .map(|c| c + 1)
        .max()
        .unwrap_or(0)
        .max(mapping.len());
    let class_names: Vec<String> = (0..classes)
        .map(|idx| {
            mapping
                .name(idx)
                .map(str::to_string)
                .unwrap_or_else(|| format!("class_{idx}"))
        })
        .collect();

    let mut confusion = vec![vec![0usize; classes]; classes];
    let mut right = Vec::new();
    let mut wrong = Vec::new();
    for i in 0..n {
        confusion[truth[i]][predicted[i]] += 1;
        if truth[i] == predicted[i] {
            right.push(confidence[i]);
        } else {
            wrong.push(confidence[i]);
        }
    }

    let per_class = (0..classes)
        .map(|c| {
            let tp = confusion[c][c];
            let support: usize = confusion[c].iter().sum();
            let predicted_as: usize = confusion.iter().map(|row| row[c]).sum();
            let precision = ratio(tp, predicted_as);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                name: class_names[c].clone(),
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect();

    EvaluationReport {
        class_names,
        total: n,
        correct: right.len(),
        accuracy: ratio(right.len(), n),
        confusion,
        per_class,
        correct_confidence: ConfidenceSummary::from_values(&right),
        incorrect_confidence: ConfidenceSummary::from_values(&wrong),
        failed: 0,
    }
}

fn predict_all(model: &mut LoadedModel, samples: &[LabeledSample]) -> (Vec<usize>, Vec<usize>, Vec<f32>, usize) {
    let mut truth = Vec::with_capacity(samples.len());
    let mut predicted = Vec::with_capacity(samples.len());
    let mut confidence = Vec::with_capacity(samples.len());
    let mut failed = 0;
    for sample in samples {
        match model.predict(&sample.vector) {
            Ok(prediction) => {
                truth.push(sample.label);
                predicted.push(prediction.class_index);
                confidence.push(prediction.confidence);
            }
            Err(err) => {
                log::warn!("prediction failed for a '{}' sample: {err:#}", sample.label);
                failed += 1;
            }
        }
    }
    (truth, predicted, confidence, failed)
}

pub fn evaluate(model: &mut LoadedModel, samples: &[LabeledSample]) -> Result<EvaluationReport> {
    if samples.is_empty() {
        bail!("no samples to evaluate");
    }
    let (truth, predicted, confidence, failed) = predict_all(model, samples);
    if truth.is_empty() {
        bail!("every prediction failed ({failed} samples)");
    }
    let mut report = report_from_predictions(&truth, &predicted, &confidence, &model.mapping);
    report.failed = failed;
    log::info!(
        "evaluated {} samples: accuracy {:.4}",
        report.total,
        report.accuracy
    );
    Ok(report)
}

/// Accuracy on a small subset plus a handful of individual predictions.
pub struct QuickTest {
    pub report: EvaluationReport,
    pub examples: Vec<SamplePrediction>,
}

pub fn quick_test(model: &mut LoadedModel, samples: &[LabeledSample], shown: usize) -> Result<QuickTest> {
    let report = evaluate(model, samples)?;
    let step = (samples.len() / shown.max(1)).max(1);
    let mut examples = Vec::new();
    for sample in samples.iter().step_by(step).take(shown) {
        let prediction = model.predict(&sample.vector)?;
        examples.push(SamplePrediction {
            truth: report
                .class_names
                .get(sample.label)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", sample.label)),
            predicted: prediction.label,
            confidence: prediction.confidence,
        });
    }
    Ok(QuickTest { report, examples })
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ASL classifier evaluation")?;
        writeln!(f, "=========================")?;
        writeln!(
            f,
            "Accuracy: {:.4} ({}/{})",
            self.accuracy, self.correct, self.total
        )?;
        if self.failed > 0 {
            writeln!(f, "Failed predictions: {}", self.failed)?;
        }
        writeln!(f)?;

        let width = self
            .class_names
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max(9);
        writeln!(
            f,
            "{:<width$}  {:>9}  {:>9}  {:>9}  {:>7}",
            "class", "precision", "recall", "f1-score", "support"
        )?;
        for m in &self.per_class {
            writeln!(
                f,
                "{:<width$}  {:>9.3}  {:>9.3}  {:>9.3}  {:>7}",
                m.name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        writeln!(f)?;

        writeln!(f, "Confusion matrix (rows = true, columns = predicted)")?;
        write!(f, "{:<width$}", "")?;
        for name in &self.class_names {
            write!(f, " {:>6.6}", name)?;
        }
        writeln!(f)?;
        for (name, row) in self.class_names.iter().zip(&self.confusion) {
            write!(f, "{:<width$}", name)?;
            for count in row {
                write!(f, " {:>6}", count)?;
            }
            writeln!(f)?;
        }
        writeln!(f)?;

        for (title, summary) in [
            ("Correct", &self.correct_confidence),
            ("Incorrect", &self.incorrect_confidence),
        ] {
            match summary {
                Some(s) => writeln!(
                    f,
                    "{title} predictions: {} (confidence mean {:.3}, min {:.3}, max {:.3})",
                    s.count, s.mean, s.min, s.max
                )?,
                None => writeln!(f, "{title} predictions: 0")?,
            }
        }
        Ok(())
    }
}
