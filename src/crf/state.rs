//! Flat transition state shared by the accumulate, merge and apply steps.
//!
//! The blob is a plain `Vec<f64>` laid out as
//!
//! ```text
//! [iteration, N, L,
//!  coef[N], diag[N], gradient[N], workspace[N(2m+1)+2m],
//!  num_rows, loglikelihood, lbfgs[21], linesearch[25]]
//! ```
//!
//! Every offset is derived from `N`, `L` and `m` by [`StateLayout`].

use std::ops::Range;

use super::lbfgs::{LBFGS_SLOTS, LINESEARCH_SLOTS};
use crate::error::{CrfError, Result};

const HEADER: usize = 3;
const SCALARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    num_features: usize,
    num_labels: usize,
    memory: usize,
}

impl StateLayout {
    pub fn bind(num_features: usize, num_labels: usize, memory: usize) -> Result<Self> {
        if num_features == 0 || num_labels == 0 || memory == 0 {
            return Err(CrfError::InvalidParameters(format!(
                "state dimensions must be positive (N = {num_features}, L = {num_labels}, m = {memory})"
            )));
        }
        Ok(Self {
            num_features,
            num_labels,
            memory,
        })
    }

    /// Re-derives the layout from the header and length of an existing blob.
    pub fn of_blob(blob: &[f64]) -> Result<Self> {
        if blob.len() < HEADER {
            return Err(CrfError::DimensionMismatch {
                what: "state header",
                expected: HEADER,
                found: blob.len(),
            });
        }
        let n = header_count(blob[1], "N")?;
        let l = header_count(blob[2], "L")?;
        let fixed = HEADER + 4 * n + SCALARS + LBFGS_SLOTS + LINESEARCH_SLOTS;
        // workspace contributes n(2m+1)+2m, of which n is counted in `fixed`
        let per_memory = 2 * (n + 1);
        let rest = blob.len().checked_sub(fixed).filter(|r| r % per_memory == 0 && *r > 0);
        let m = match rest {
            Some(r) => r / per_memory,
            None => {
                return Err(CrfError::DimensionMismatch {
                    what: "state blob length",
                    expected: fixed + per_memory,
                    found: blob.len(),
                })
            }
        };
        Self::bind(n, l, m)
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    #[inline]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline]
    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn workspace_len(&self) -> usize {
        self.num_features * (2 * self.memory + 1) + 2 * self.memory
    }

    fn coef(&self) -> Range<usize> {
        HEADER..HEADER + self.num_features
    }

    fn gradient(&self) -> Range<usize> {
        let start = HEADER + 2 * self.num_features;
        start..start + self.num_features
    }

    fn num_rows(&self) -> usize {
        HEADER + 3 * self.num_features + self.workspace_len()
    }

    fn loglikelihood(&self) -> usize {
        self.num_rows() + 1
    }

    pub fn len(&self) -> usize {
        self.num_rows() + SCALARS + LBFGS_SLOTS + LINESEARCH_SLOTS
    }
}

fn header_count(v: f64, what: &str) -> Result<usize> {
    if v.is_finite() && v >= 1.0 && v.fract() == 0.0 {
        Ok(v as usize)
    } else {
        Err(CrfError::InvalidParameters(format!(
            "state header {what} is not a positive count: {v}"
        )))
    }
}

/// Mutable views into the regions of a state blob.
#[derive(Debug)]
pub struct StateParts<'a> {
    pub iteration: &'a mut f64,
    pub coef: &'a mut [f64],
    pub diag: &'a mut [f64],
    pub gradient: &'a mut [f64],
    pub workspace: &'a mut [f64],
    pub num_rows: &'a mut f64,
    pub loglikelihood: &'a mut f64,
    pub lbfgs: &'a mut [f64],
    pub linesearch: &'a mut [f64],
}

/// Accumulator and optimizer state of one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionState {
    layout: StateLayout,
    blob: Vec<f64>,
}

impl TransitionState {
    /// A zeroed state at iteration 0 with all-zero weights.
    pub fn new(num_features: usize, num_labels: usize, memory: usize) -> Result<Self> {
        let layout = StateLayout::bind(num_features, num_labels, memory)?;
        let mut blob = vec![0.0; layout.len()];
        blob[1] = num_features as f64;
        blob[2] = num_labels as f64;
        Ok(Self { layout, blob })
    }

    pub fn from_blob(blob: Vec<f64>) -> Result<Self> {
        let layout = StateLayout::of_blob(&blob)?;
        let this = Self { layout, blob };
        let iteration = this.blob[0];
        if !(iteration.is_finite() && iteration >= 0.0 && iteration.fract() == 0.0) {
            return Err(CrfError::InvalidParameters(format!(
                "state iteration is not a count: {iteration}"
            )));
        }
        // history depth recorded by the optimizer must agree with the length
        let recorded = this.blob[layout.num_rows() + SCALARS + super::lbfgs::MEMORY_SLOT];
        if recorded != 0.0 && recorded != layout.memory as f64 {
            return Err(CrfError::DimensionMismatch {
                what: "history depth",
                expected: layout.memory,
                found: recorded as usize,
            });
        }
        Ok(this)
    }

    /// Little-endian encoding of the blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.blob.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 8 != 0 {
            return Err(CrfError::DimensionMismatch {
                what: "state byte length",
                expected: bytes.len() / 8 * 8,
                found: bytes.len(),
            });
        }
        let blob = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b)
            })
            .collect();
        Self::from_blob(blob)
    }

    pub fn as_blob(&self) -> &[f64] {
        &self.blob
    }

    pub fn into_blob(self) -> Vec<f64> {
        self.blob
    }

    #[inline]
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn iteration(&self) -> usize {
        self.blob[0] as usize
    }

    pub fn num_features(&self) -> usize {
        self.layout.num_features
    }

    pub fn num_labels(&self) -> usize {
        self.layout.num_labels
    }

    pub fn num_rows(&self) -> u64 {
        self.blob[self.layout.num_rows()] as u64
    }

    pub fn loglikelihood(&self) -> f64 {
        self.blob[self.layout.loglikelihood()]
    }

    pub fn coef(&self) -> &[f64] {
        &self.blob[self.layout.coef()]
    }

    pub fn gradient(&self) -> &[f64] {
        &self.blob[self.layout.gradient()]
    }

    /// Sets the starting weights; only allowed before the first step.
    pub fn set_coef(&mut self, coef: &[f64]) -> Result<()> {
        if coef.len() != self.layout.num_features {
            return Err(CrfError::DimensionMismatch {
                what: "weights",
                expected: self.layout.num_features,
                found: coef.len(),
            });
        }
        if self.iteration() != 0 {
            return Err(CrfError::InvalidParameters(
                "weights can only be seeded before the first iteration".into(),
            ));
        }
        let range = self.layout.coef();
        self.blob[range].copy_from_slice(coef);
        Ok(())
    }

    /// An empty accumulator for the next pass over the data: the optimizer
    /// part is carried over, the per-pass sums are zeroed.
    pub fn begin_pass(&self) -> Self {
        let mut next = self.clone();
        next.reset();
        next
    }

    pub fn reset(&mut self) {
        let gradient = self.layout.gradient();
        self.blob[gradient].iter_mut().for_each(|v| *v = 0.0);
        let rows = self.layout.num_rows();
        self.blob[rows] = 0.0;
        self.blob[rows + 1] = 0.0;
    }

    pub fn parts(&mut self) -> StateParts<'_> {
        let n = self.layout.num_features;
        let ws = self.layout.workspace_len();
        let (header, rest) = self.blob.split_at_mut(HEADER);
        let (coef, rest) = rest.split_at_mut(n);
        let (diag, rest) = rest.split_at_mut(n);
        let (gradient, rest) = rest.split_at_mut(n);
        let (workspace, rest) = rest.split_at_mut(ws);
        let (num_rows, rest) = rest.split_at_mut(1);
        let (loglikelihood, rest) = rest.split_at_mut(1);
        let (lbfgs, linesearch) = rest.split_at_mut(LBFGS_SLOTS);
        StateParts {
            iteration: &mut header[0],
            coef,
            diag,
            gradient,
            workspace,
            num_rows: &mut num_rows[0],
            loglikelihood: &mut loglikelihood[0],
            lbfgs,
            linesearch,
        }
    }

    /// Combines two partial accumulations of the same iteration.
    ///
    /// A state that has seen no rows is the identity and the other side is
    /// returned untouched.
    pub fn merge(self, other: Self) -> Result<Self> {
        if self.num_rows() == 0 {
            return Ok(other);
        }
        if other.num_rows() == 0 {
            return Ok(self);
        }
        if self.layout.num_features != other.layout.num_features {
            return Err(CrfError::DimensionMismatch {
                what: "feature count",
                expected: self.layout.num_features,
                found: other.layout.num_features,
            });
        }
        if self.layout.num_labels != other.layout.num_labels {
            return Err(CrfError::DimensionMismatch {
                what: "label count",
                expected: self.layout.num_labels,
                found: other.layout.num_labels,
            });
        }
        if self.layout.memory != other.layout.memory {
            return Err(CrfError::DimensionMismatch {
                what: "history depth",
                expected: self.layout.memory,
                found: other.layout.memory,
            });
        }
        let mut merged = self;
        let gradient = merged.layout.gradient();
        for (a, b) in merged.blob[gradient.clone()].iter_mut().zip(&other.blob[gradient]) {
            *a += b;
        }
        let rows = merged.layout.num_rows();
        merged.blob[rows] += other.blob[rows];
        merged.blob[rows + 1] += other.blob[rows + 1];
        Ok(merged)
    }
}

pub fn merge(a: TransitionState, b: TransitionState) -> Result<TransitionState> {
    a.merge(b)
}

/// Absolute change in log-likelihood between two states.
pub fn state_distance(a: &TransitionState, b: &TransitionState) -> f64 {
    (a.loglikelihood() - b.loglikelihood()).abs()
}
