use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
    time::Instant,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{
    crf1d::{
        context::{Crf1dContext, CtxOpt},
        model::Crf1dModel,
        tagger::Crf1dTagger,
    },
    feature::{Crf1dFeatures, FeatureLookup},
    labels::LabelSpace,
    lbfgs::{Lbfgs, LbfgsStatus, LineSearch},
    state::TransitionState,
    tagger::Tagger,
};
use crate::{
    config::TrainingOptions,
    dataset::{Dataset, Sequence},
    error::{ensure_finite, CrfError, Result},
    evaluation::{Estimation, Evaluation},
    quark::{Quark, StringTable},
};

/// Accumulates log-likelihood and gradient of `seqs` at the weights of
/// `prev`, splitting the sequences into `partitions` chunks (0: one per
/// worker thread) that are merged back together.
///
/// The result carries the optimizer part of `prev` untouched.
pub fn accumulate<F: FeatureLookup + Sync>(
    seqs: &[&Sequence],
    lookup: &F,
    space: LabelSpace,
    prev: &TransitionState,
    scaling: bool,
    partitions: usize,
) -> Result<TransitionState> {
    let flag = if scaling {
        CtxOpt::CTXF_ALL
    } else {
        CtxOpt::CTXF_MARGINALS
    };
    let partitions = if partitions == 0 {
        rayon::current_num_threads()
    } else {
        partitions
    };
    let chunk = seqs.len().div_ceil(partitions).max(1);
    seqs.par_chunks(chunk)
        .map(|part| {
            let mut ctx = Crf1dContext::new(flag, space);
            let mut acc = prev.begin_pass();
            for seq in part {
                ctx.accumulate(seq, lookup, &mut acc)?;
            }
            Ok(acc)
        })
        .try_reduce(|| prev.begin_pass(), TransitionState::merge)
}

/// Applies the Gaussian prior to a fully merged accumulation and advances
/// the optimizer by one evaluation.
///
/// On success the returned state holds the next weights to evaluate (or the
/// converged ones), the regularised log-likelihood of the evaluated weights,
/// and an iteration counter advanced by one.
pub fn apply_step(mut state: TransitionState, opts: &TrainingOptions) -> Result<(TransitionState, LbfgsStatus)> {
    if state.num_rows() == 0 {
        return Err(CrfError::EmptyTrainingSet);
    }
    let params = opts.lbfgs_params();
    let memory = state.layout().memory();
    let first = state.iteration() == 0;
    let sigma2 = opts.sigma2;
    let parts = state.parts();

    ensure_finite("weights", parts.coef)?;
    ensure_finite("gradient", parts.gradient)?;
    let mut norm = 0.0;
    for (g, &w) in parts.gradient.iter_mut().zip(parts.coef.iter()) {
        *g -= w / sigma2;
        norm += w * w;
    }
    *parts.loglikelihood -= norm / (2.0 * sigma2);

    /* L-BFGS minimises, so hand it the negated objective. */
    let f = -*parts.loglikelihood;
    parts.gradient.iter_mut().for_each(|g| *g = -*g);

    let mut lbfgs = if first {
        Lbfgs::new(&params)?
    } else {
        Lbfgs::from_slots(parts.lbfgs)?
    };
    if lbfgs.memory() != memory {
        return Err(CrfError::DimensionMismatch {
            what: "history depth",
            expected: memory,
            found: lbfgs.memory(),
        });
    }
    let mut ls = LineSearch::from_slots(parts.linesearch)?;
    let status = lbfgs.step(
        &mut ls,
        parts.coef,
        f,
        parts.gradient,
        parts.diag,
        parts.workspace,
        params.epsilon,
        params.xtol,
    )?;
    ensure_finite("weights", parts.coef)?;
    lbfgs.to_slots(parts.lbfgs)?;
    ls.to_slots(parts.linesearch)?;
    *parts.iteration += 1.0;
    log::debug!(
        "lbfgs: iterations {}, evaluations {}, searching {}, gnorm {:.6}",
        lbfgs.iterations(),
        lbfgs.evaluations(),
        lbfgs.is_searching(),
        lbfgs.gnorm()
    );
    Ok((state, status))
}

/// Training options and optimizer state, saved after every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub options: TrainingOptions,
    pub state: Vec<f64>,
}

impl Checkpoint {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let doc = bson::to_document(self)?;
        let tmp = path.with_extension("tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        doc.to_writer(&mut out)?;
        out.flush()?;
        drop(out);
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let doc = bson::Document::from_reader(BufReader::new(File::open(path)?))?;
        Ok(bson::from_document(doc)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The gradient test of L-BFGS passed.
    Converged,
    MaxIterations,
    /// The log-likelihood moved less than `delta` between two passes.
    Delta,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub stop: StopReason,
    /// Passes over the data, counted from the start of the run (a resumed
    /// run includes the passes made before the checkpoint).
    pub iterations: usize,
    /// Regularised log-likelihood of the last evaluated weights.
    pub loglikelihood: f64,
    /// Final weights: the best ones on the holdout group if there is one,
    /// otherwise the last evaluated ones.
    pub weights: Vec<f64>,
    /// Holdout evaluation of `weights`.
    pub holdout: Option<Estimation>,
    pub state: TransitionState,
}

/// Decodes `seqs` with `weights` and scores the predictions.
pub fn evaluate<F: FeatureLookup>(
    seqs: &[&Sequence],
    lookup: &F,
    space: LabelSpace,
    labels: &Quark,
    weights: &[f64],
) -> Result<Evaluation> {
    let mut tagger = Crf1dTagger::new(space, lookup, weights);
    let mut eval = Evaluation::new(labels);
    for seq in seqs {
        let (predicted, _) = tagger.viterbi(seq)?;
        eval.accumulate(&seq.labels, &predicted)?;
    }
    eval.evaluate();
    Ok(eval)
}

pub trait Crf1dTrainer {
    /// Trains on `ds` and writes the model to `path`.
    fn train(&mut self, ds: &Dataset, path: &Path) -> Result<TrainingOutcome>;
}

/// Maximum-likelihood training with L-BFGS.
#[derive(Debug, Clone)]
pub struct LbfgsTrainer {
    opts: TrainingOptions,
    resume: Option<TransitionState>,
}

impl LbfgsTrainer {
    pub fn new(opts: TrainingOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self { opts, resume: None })
    }

    /// Continues the run saved in `checkpoint`, with the options it was
    /// started with.
    pub fn resume(checkpoint: Checkpoint) -> Result<Self> {
        checkpoint.options.validate()?;
        let state = TransitionState::from_blob(checkpoint.state)?;
        Ok(Self {
            opts: checkpoint.options,
            resume: Some(state),
        })
    }

    pub fn options(&self) -> &TrainingOptions {
        &self.opts
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) {
        self.opts.max_iterations = max_iterations;
    }

    fn label_space(&self, labels: &Quark) -> Result<LabelSpace> {
        let space = LabelSpace::new(labels.len(), self.opts.order)?;
        match &self.opts.outside_label {
            Some(name) => {
                let id = labels
                    .to_id(name)
                    .ok_or_else(|| CrfError::UnknownLabel(name.clone()))?;
                space.with_outside(id)
            }
            None => Ok(space),
        }
    }

    fn initial_state(&self, features: &Crf1dFeatures, space: &LabelSpace) -> Result<TransitionState> {
        let N = features.num_features();
        let L = space.num_labels();
        match &self.resume {
            Some(state) => {
                if state.num_features() != N {
                    return Err(CrfError::DimensionMismatch {
                        what: "checkpoint feature count",
                        expected: N,
                        found: state.num_features(),
                    });
                }
                if state.num_labels() != L {
                    return Err(CrfError::DimensionMismatch {
                        what: "checkpoint label count",
                        expected: L,
                        found: state.num_labels(),
                    });
                }
                log::info!("resuming from iteration {}", state.iteration());
                Ok(state.clone())
            }
            None => TransitionState::new(N, L, self.opts.memory),
        }
    }

    /// Runs the iteration loop and returns the model with its training summary.
    pub fn fit(&self, ds: &Dataset) -> Result<(Crf1dModel, TrainingOutcome)> {
        let opts = &self.opts;
        let space = self.label_space(&ds.labels)?;
        let (train, holdout) = ds.split_holdout(opts.holdout);
        if train.is_empty() {
            return Err(CrfError::EmptyTrainingSet);
        }
        log::info!(
            "training (L: {}, A: {}, N: {}, holdout: {}, T: {})",
            space.num_labels(),
            ds.num_attrs(),
            train.len(),
            holdout.len(),
            ds.max_seq_length()
        );
        let features = Crf1dFeatures::generate(train.iter().copied(), space, &opts.feature_options())?;
        let mut state = self.initial_state(&features, &space)?;
        log::info!("{opts:?}");

        let mut weights = state.coef().to_vec();
        let mut loglikelihood = state.loglikelihood();
        let mut best: Option<(Estimation, Vec<f64>)> = None;
        let mut prev_ll: Option<f64> = None;
        let begin = Instant::now();
        let stop = loop {
            let iteration = state.iteration();
            if iteration >= opts.max_iterations {
                break StopReason::MaxIterations;
            }
            let ts = Instant::now();
            let (next, status) = accumulate(&train, &features, space, &state, opts.scaling, opts.partitions)
                .and_then(|acc| {
                    weights.copy_from_slice(acc.coef());
                    apply_step(acc, opts)
                })
                .map_err(|e| e.at_iteration(iteration))?;
            state = next;
            loglikelihood = state.loglikelihood();
            let norm = weights.iter().map(|w| w * w).sum::<f64>().sqrt();
            log::info!(
                "iteration {}: loglikelihood {:.6}, rows {}, feature norm {:.6}, status {:?}, time {:?}",
                iteration + 1,
                loglikelihood,
                state.num_rows(),
                norm,
                status,
                ts.elapsed()
            );

            if !holdout.is_empty() {
                let mut eval = evaluate(&holdout, &features, space, &ds.labels, &weights)
                    .map_err(|e| e.at_iteration(iteration))?;
                let est = eval.evaluate();
                log::info!("holdout evaluation:\n{eval}");
                if best.as_ref().map_or(true, |(b, _)| est.item_accuracy > b.item_accuracy) {
                    best = Some((est, weights.clone()));
                }
            }

            if let Some(path) = &opts.checkpoint {
                Checkpoint {
                    options: opts.clone(),
                    state: state.as_blob().to_vec(),
                }
                .save(path)
                .map_err(|e| e.at_iteration(iteration))?;
            }

            if status == LbfgsStatus::Converged {
                break StopReason::Converged;
            }
            if opts.delta > 0.0 {
                if let Some(prev) = prev_ll {
                    if (loglikelihood - prev).abs() < opts.delta {
                        break StopReason::Delta;
                    }
                }
            }
            prev_ll = Some(loglikelihood);
        };
        log::info!(
            "training stopped ({stop:?}) after {} iterations, loglikelihood {:.6}, time {:?}",
            state.iteration(),
            loglikelihood,
            begin.elapsed()
        );

        let (weights, estimation) = match best {
            Some((est, w)) => (w, Some(est)),
            None => (weights, None),
        };
        let model = Crf1dModel::new(ds.labels.clone(), ds.attrs.clone(), features, weights.clone())?;
        let outcome = TrainingOutcome {
            stop,
            iterations: state.iteration(),
            loglikelihood,
            weights,
            holdout: estimation,
            state,
        };
        Ok((model, outcome))
    }
}

impl Crf1dTrainer for LbfgsTrainer {
    fn train(&mut self, ds: &Dataset, path: &Path) -> Result<TrainingOutcome> {
        let (model, outcome) = self.fit(ds)?;
        model.save(path)?;
        Ok(outcome)
    }
}
