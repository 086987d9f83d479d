use std::{fmt::Display, iter::zip};

use crate::{
    error::{CrfError, Result},
    quark::{Quark, StringTable},
};

/// Label-wise performance values.
#[derive(Debug, Default, Clone)]
struct LabelMeasure {
    /// Number of correct predictions.
    num_correct: usize,
    /** Number of occurrences of the label in the gold-standard data. */
    num_observation: usize,
    /** Number of predictions. */
    num_prediction: usize,
    /** Precision. */
    precision: f64,
    /** Recall. */
    recall: f64,
    /** F1 score. */
    fmeasure: f64,
}

/// An overall performance values.
#[derive(Debug, Default, Clone)]
pub struct Evaluation {
    /** Label names, indexed by label id. */
    names: Vec<String>,
    /** Array of label-wise evaluations. */
    tbl: Vec<LabelMeasure>,

    /** Number of correctly predicted items. */
    item_total_correct: usize,
    /** Total number of items. */
    item_total_num: usize,
    /** Total number of occurrences of labels in the gold-standard data. */
    item_total_observation: usize,
    /** Total number of predictions. */
    item_total_prediction: usize,
    /** Item-level accuracy. */
    item_accuracy: f64,

    /** Number of correctly predicted instances. */
    inst_total_correct: usize,
    /** Total number of instances. */
    inst_total_num: usize,
    /** Instance-level accuracy. */
    inst_accuracy: f64,

    /** Macro-averaged precision. */
    macro_precision: f64,
    /** Macro-averaged recall. */
    macro_recall: f64,
    /** Macro-averaged F1 score. */
    macro_fmeasure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimation {
    pub item_accuracy: f64,
    pub instance_accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub fmeasure: f64,
}

impl Evaluation {
    pub fn new(labels: &Quark) -> Self {
        Self {
            names: labels.iter().map(str::to_string).collect(),
            tbl: vec![LabelMeasure::default(); labels.len()],
            ..Default::default()
        }
    }

    #[inline]
    pub fn num_labels(&self) -> usize {
        self.names.len()
    }

    /// Adds one instance: the reference labels and the predicted ones.
    pub fn accumulate(&mut self, reference: &[usize], prediction: &[usize]) -> Result<()> {
        if reference.len() != prediction.len() {
            return Err(CrfError::DimensionMismatch {
                what: "predicted labels",
                expected: reference.len(),
                found: prediction.len(),
            });
        }
        let num_labels = self.tbl.len();
        if let Some(&label) = reference.iter().chain(prediction).find(|&&l| l >= num_labels) {
            return Err(CrfError::InvalidLabel { label, num_labels });
        }
        let mut matched = 0;
        for (&r, &p) in zip(reference, prediction) {
            self.tbl[r].num_observation += 1;
            self.tbl[p].num_prediction += 1;
            if r == p {
                self.tbl[r].num_correct += 1;
                matched += 1;
            }
            self.item_total_num += 1;
        }

        if matched == prediction.len() {
            self.inst_total_correct += 1;
        }
        self.inst_total_num += 1;
        Ok(())
    }

    pub fn evaluate(&mut self) -> Estimation {
        self.item_total_correct = 0;
        self.item_total_prediction = 0;
        self.item_total_observation = 0;
        self.macro_precision = 0.0;
        self.macro_recall = 0.0;
        self.macro_fmeasure = 0.0;

        for lev in &mut self.tbl {
            lev.precision = 0.0;
            lev.recall = 0.0;
            lev.fmeasure = 0.0;
            if lev.num_observation == 0 {
                continue;
            }
            self.item_total_correct += lev.num_correct;
            self.item_total_prediction += lev.num_prediction;
            self.item_total_observation += lev.num_observation;

            if lev.num_prediction > 0 {
                lev.precision = lev.num_correct as f64 / lev.num_prediction as f64;
            }
            lev.recall = lev.num_correct as f64 / lev.num_observation as f64;
            if lev.precision + lev.recall > 0.0 {
                lev.fmeasure = lev.precision * lev.recall * 2.0 / (lev.precision + lev.recall);
            }
            self.macro_precision += lev.precision;
            self.macro_recall += lev.recall;
            self.macro_fmeasure += lev.fmeasure;
        }

        if !self.tbl.is_empty() {
            let n = self.tbl.len() as f64;
            self.macro_precision /= n;
            self.macro_recall /= n;
            self.macro_fmeasure /= n;
        }

        self.item_accuracy = 0.0;
        if self.item_total_num > 0 {
            self.item_accuracy = self.item_total_correct as f64 / self.item_total_num as f64;
        }
        self.inst_accuracy = 0.0;
        if self.inst_total_num > 0 {
            self.inst_accuracy = self.inst_total_correct as f64 / self.inst_total_num as f64;
        }
        Estimation {
            item_accuracy: self.item_accuracy,
            instance_accuracy: self.inst_accuracy,
            precision: self.macro_precision,
            recall: self.macro_recall,
            fmeasure: self.macro_fmeasure,
        }
    }
}

impl Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Performance by label (#match, #model, #ref) (precision, recall, F1):")?;
        for (label, lev) in zip(&self.names, &self.tbl) {
            if lev.num_observation == 0 {
                writeln!(
                    f,
                    "    {}: ({}, {}, {}) (******, ******, ******)",
                    label, lev.num_correct, lev.num_prediction, lev.num_observation
                )?;
            } else {
                writeln!(
                    f,
                    "    {}: ({}, {}, {}) ({:.4}, {:.4}, {:.4})",
                    label,
                    lev.num_correct,
                    lev.num_prediction,
                    lev.num_observation,
                    lev.precision,
                    lev.recall,
                    lev.fmeasure
                )?;
            }
        }
        writeln!(
            f,
            "Macro-average precision, recall, F1: ({:.6}, {:.6}, {:.6})",
            self.macro_precision, self.macro_recall, self.macro_fmeasure
        )?;
        writeln!(
            f,
            "Item accuracy: {} / {} ({:.4})",
            self.item_total_correct, self.item_total_num, self.item_accuracy
        )?;
        write!(
            f,
            "Instance accuracy: {} / {} ({:.4})",
            self.inst_total_correct, self.inst_total_num, self.inst_accuracy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Quark {
        Quark::from(vec!["sunny".to_string(), "rainy".to_string(), "foggy".to_string()])
    }

    #[test]
    fn evaluate() {
        let mut e = Evaluation::new(&labels());
        e.accumulate(&[0, 0, 1], &[0, 0, 1]).unwrap();
        e.accumulate(&[0, 1, 1], &[0, 0, 1]).unwrap();
        let est = e.evaluate();
        assert_eq!(est.item_accuracy, 5.0 / 6.0);
        assert_eq!(est.instance_accuracy, 0.5);
        // sunny: p = 3/4, r = 1; rainy: p = 1, r = 2/3; foggy unseen
        assert!((est.precision - (0.75 + 1.0) / 3.0).abs() < 1e-12);
        assert!((est.recall - (1.0 + 2.0 / 3.0) / 3.0).abs() < 1e-12);
        // evaluating twice gives the same numbers
        assert_eq!(e.evaluate(), est);
        let s = e.to_string();
        assert!(s.contains("sunny: (3, 4, 3)"));
        assert!(s.contains("foggy: (0, 0, 0) (******"));
    }

    #[test]
    fn invalid() {
        let mut e = Evaluation::new(&labels());
        assert!(matches!(e.accumulate(&[0], &[0, 1]), Err(CrfError::DimensionMismatch { .. })));
        assert!(matches!(e.accumulate(&[3], &[0]), Err(CrfError::InvalidLabel { label: 3, .. })));
    }
}
