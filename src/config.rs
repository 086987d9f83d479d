use std::path::{Path, PathBuf};

use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};

use crate::{
    crf::{feature::FeatureOptions, labels::ChainOrder, lbfgs::LbfgsParams},
    error::{CrfError, Result},
};

/// Every knob of a training run.
///
/// Built from command-line flags or read from a JSON file; missing JSON keys
/// take the same defaults as the flags.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Order of the label chain.
    #[arg(long, value_enum, default_value_t = ChainOrder::First)]
    pub order: ChainOrder,
    /// Label assumed before the first item of a second-order chain.
    #[arg(long)]
    pub outside_label: Option<String>,
    /// Variance of the Gaussian prior on the weights.
    #[arg(long, default_value_t = 10.0)]
    pub sigma2: f64,
    /// Number of corrections kept by L-BFGS.
    #[arg(long, default_value_t = 6)]
    pub memory: usize,
    /// Convergence tolerance on ||g|| / max(1, ||w||).
    #[arg(long, default_value_t = 1e-5)]
    pub epsilon: f64,
    #[arg(long, default_value_t = 1e-16)]
    pub xtol: f64,
    #[arg(long, default_value_t = 1e-4)]
    pub ftol: f64,
    #[arg(long, default_value_t = 0.9)]
    pub gtol: f64,
    #[arg(long, default_value_t = 1e-20)]
    pub stpmin: f64,
    #[arg(long, default_value_t = 1e20)]
    pub stpmax: f64,
    /// Maximum number of evaluations per line search.
    #[arg(long, default_value_t = 20)]
    pub max_linesearch: usize,
    /// Maximum number of passes over the data; set from the command line by
    /// the `train` subcommand so that a resumed run keeps its own.
    #[arg(skip = 100usize)]
    pub max_iterations: usize,
    /// Stop once the log-likelihood moves less than this between passes (0 disables).
    #[arg(long, default_value_t = 0.0)]
    pub delta: f64,
    /// Rescale forward/backward vectors.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub scaling: bool,
    /// Number of data partitions accumulated in parallel (0: one per thread).
    #[arg(long, default_value_t = 0)]
    pub partitions: usize,
    #[arg(long, default_value_t = 0.0)]
    pub min_freq: f64,
    /// Connect every attribute with every label.
    #[arg(long)]
    pub possible_states: bool,
    /// Generate transitions between every pair of states.
    #[arg(long)]
    pub possible_transitions: bool,
    /// Data group held out for evaluation.
    #[arg(long)]
    pub holdout: Option<usize>,
    /// Checkpoint written after every step.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        let lbfgs = LbfgsParams::default();
        Self {
            order: ChainOrder::First,
            outside_label: None,
            sigma2: 10.0,
            memory: lbfgs.memory,
            epsilon: lbfgs.epsilon,
            xtol: lbfgs.xtol,
            ftol: lbfgs.ftol,
            gtol: lbfgs.gtol,
            stpmin: lbfgs.stpmin,
            stpmax: lbfgs.stpmax,
            max_linesearch: lbfgs.max_linesearch,
            max_iterations: 100,
            delta: 0.0,
            scaling: true,
            partitions: 0,
            min_freq: 0.0,
            possible_states: false,
            possible_transitions: false,
            holdout: None,
            checkpoint: None,
        }
    }
}

impl TrainingOptions {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let opts: Self = serde_json::from_slice(&std::fs::read(path)?)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sigma2", self.sigma2),
            ("epsilon", self.epsilon),
            ("ftol", self.ftol),
            ("gtol", self.gtol),
            ("stpmin", self.stpmin),
            ("stpmax", self.stpmax),
        ];
        for (name, v) in positive {
            if !(v > 0.0 && v.is_finite()) {
                return Err(CrfError::InvalidParameters(format!("{name} must be positive, got {v}")));
            }
        }
        if !(self.xtol >= 0.0) {
            return Err(CrfError::InvalidParameters(format!("xtol must not be negative, got {}", self.xtol)));
        }
        if self.stpmin >= self.stpmax {
            return Err(CrfError::InvalidParameters(format!(
                "stpmin ({}) must be below stpmax ({})",
                self.stpmin, self.stpmax
            )));
        }
        if self.memory == 0 {
            return Err(CrfError::InvalidParameters("memory must be positive".into()));
        }
        if self.max_linesearch == 0 {
            return Err(CrfError::InvalidParameters("max_linesearch must be positive".into()));
        }
        if !(self.delta >= 0.0) {
            return Err(CrfError::InvalidParameters(format!("delta must not be negative, got {}", self.delta)));
        }
        Ok(())
    }

    pub fn lbfgs_params(&self) -> LbfgsParams {
        LbfgsParams {
            memory: self.memory,
            epsilon: self.epsilon,
            xtol: self.xtol,
            ftol: self.ftol,
            gtol: self.gtol,
            stpmin: self.stpmin,
            stpmax: self.stpmax,
            max_linesearch: self.max_linesearch,
        }
    }

    pub fn feature_options(&self) -> FeatureOptions {
        FeatureOptions {
            possible_states: self.possible_states,
            possible_transitions: self.possible_transitions,
            min_freq: self.min_freq,
        }
    }
}
