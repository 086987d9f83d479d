use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{CrfError, Result};

/// Markov order of the chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChainOrder {
    #[default]
    First,
    Second,
}

/// The lattice over which the forward-backward recursion runs.
///
/// A first-order chain has one lattice state per label. A second-order chain
/// has one state per (previous, current) label pair, numbered
/// `prev * L + label`, with `outside` standing in for the label before the
/// first item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    num_labels: usize,
    order: ChainOrder,
    outside: usize,
}

impl LabelSpace {
    pub fn new(num_labels: usize, order: ChainOrder) -> Result<Self> {
        if num_labels == 0 {
            return Err(CrfError::InvalidParameters(
                "the label count must be positive".into(),
            ));
        }
        Ok(Self {
            num_labels,
            order,
            outside: num_labels - 1,
        })
    }

    pub fn first_order(num_labels: usize) -> Result<Self> {
        Self::new(num_labels, ChainOrder::First)
    }

    /// Sets the label assumed before the first item of a second-order chain.
    pub fn with_outside(mut self, outside: usize) -> Result<Self> {
        self.outside = self.check_label(outside)?;
        Ok(self)
    }

    #[inline]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline]
    pub fn order(&self) -> ChainOrder {
        self.order
    }

    #[inline]
    pub fn outside(&self) -> usize {
        self.outside
    }

    /// Number of lattice states (K).
    #[inline]
    pub fn num_states(&self) -> usize {
        match self.order {
            ChainOrder::First => self.num_labels,
            ChainOrder::Second => self.num_labels * self.num_labels,
        }
    }

    #[inline]
    pub fn compound(&self, prev: usize, label: usize) -> usize {
        prev * self.num_labels + label
    }

    /// The current label carried by a lattice state.
    #[inline]
    pub fn label_of(&self, state: usize) -> usize {
        state % self.num_labels
    }

    /// The previous label carried by a second-order lattice state.
    #[inline]
    pub fn prev_of(&self, state: usize) -> usize {
        state / self.num_labels
    }

    /// Whether a path may move from lattice state `p` to `s`: a second-order
    /// pair must hand its current label over as the next previous one.
    #[inline]
    pub fn connects(&self, p: usize, s: usize) -> bool {
        match self.order {
            ChainOrder::First => true,
            ChainOrder::Second => self.label_of(p) == self.prev_of(s),
        }
    }

    /// Whether a path may start in lattice state `s`.
    #[inline]
    pub fn starts(&self, s: usize) -> bool {
        match self.order {
            ChainOrder::First => true,
            ChainOrder::Second => self.prev_of(s) == self.outside,
        }
    }

    pub fn check_label(&self, label: usize) -> Result<usize> {
        if label < self.num_labels {
            Ok(label)
        } else {
            Err(CrfError::InvalidLabel {
                label,
                num_labels: self.num_labels,
            })
        }
    }

    pub fn check_state(&self, state: usize) -> Result<usize> {
        if state < self.num_states() {
            Ok(state)
        } else {
            Err(CrfError::InvalidLabel {
                label: state,
                num_labels: self.num_states(),
            })
        }
    }

    /// Lattice state of the gold labelling at position `t`.
    pub fn gold_state(&self, labels: &[usize], t: usize) -> usize {
        match self.order {
            ChainOrder::First => labels[t],
            ChainOrder::Second => {
                let prev = if t == 0 { self.outside } else { labels[t - 1] };
                self.compound(prev, labels[t])
            }
        }
    }

    /// Maps a lattice path back to base labels.
    pub fn to_labels(&self, states: &[usize]) -> Vec<usize> {
        states.iter().map(|&s| self.label_of(s)).collect()
    }
}
