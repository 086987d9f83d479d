use bitflags::bitflags;

use super::scores::ScoreMatrices;
use crate::{
    crf::{
        feature::{FeatType, Feature, FeatureLookup},
        labels::LabelSpace,
        state::TransitionState,
    },
    dataset::Sequence,
    error::{CrfError, Result},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtxOpt: u32 {
        /// Rescale forward/backward vectors at every position.
        const CTXF_SCALING = 0x01;
        /// Keep the backward table needed for expected counts.
        const CTXF_MARGINALS = 0x02;
        const CTXF_ALL = Self::CTXF_SCALING.bits() | Self::CTXF_MARGINALS.bits();
    }
}

#[derive(Debug)]
pub struct Crf1dContext {
    /// Flag specifying the functionality.
    flag: CtxOpt,
    space: LabelSpace,
    /**
     * The number of items (T) in the instance.
     */
    num_items: usize,
    /**
     * The maximum number of items the tables are sized for.
     */
    cap_items: usize,
    /**
     * Logarithm of the normalization factor of the last instance.
     */
    log_norm: f64,
    /**
     * Score matrices of the position being processed.
     */
    scores: ScoreMatrices,
    /**
     * Beta score matrix.
     *  This is a [T][K] matrix whose element [t][s] is the scaled total
     *  score of paths leaving state #s at #t and reaching the end.
     */
    beta_score: Vec<f64>,
    /**
     * Scale factor vector.
     *  This is a [T] vector whose element [t] is the divisor applied to
     *  the beta and alpha scores at #t.
     */
    scale_factor: Vec<f64>,
    /**
     * Forward vector of the previous position, already rescaled.
     */
    alpha: Vec<f64>,
    /**
     * Forward vector of the current position before rescaling.
     */
    next_alpha: Vec<f64>,
    /**
     * Row vector (work space) of length K.
     */
    row: Vec<f64>,
    /**
     * Active features of the position being processed.
     */
    feats: Vec<Feature>,
    /**
     * (feature index, observed value, unnormalised expectation) of every
     * feature occurrence in the instance; folded into the gradient once the
     * whole instance has been scored.
     */
    events: Vec<(usize, f64, f64)>,
}

impl Crf1dContext {
    pub fn new(flag: CtxOpt, space: LabelSpace) -> Self {
        let K = space.num_states();
        Self {
            flag,
            space,
            num_items: 0,
            cap_items: 0,
            log_norm: 0.0,
            scores: ScoreMatrices::new(&space),
            beta_score: Vec::new(),
            scale_factor: Vec::new(),
            alpha: vec![0.0; K],
            next_alpha: vec![0.0; K],
            row: vec![0.0; K],
            feats: Vec::new(),
            events: Vec::new(),
        }
    }

    #[inline]
    pub fn space(&self) -> &LabelSpace {
        &self.space
    }

    pub fn set_num_items(&mut self, T: usize) {
        let K = self.space.num_states();
        self.num_items = T;
        if self.cap_items < T {
            self.scale_factor.resize(T, 0.0);
            if self.flag.contains(CtxOpt::CTXF_MARGINALS) {
                self.beta_score.resize(T * K, 0.0);
            }
            self.cap_items = T;
        }
    }

    /// Logarithm of the normalization factor of the last processed instance.
    pub fn lognorm_value(&self) -> f64 {
        self.log_norm
    }

    fn check_labels(&self, seq: &Sequence) -> Result<()> {
        if seq.labels.len() != seq.len() {
            return Err(CrfError::DimensionMismatch {
                what: "sequence labels",
                expected: seq.len(),
                found: seq.labels.len(),
            });
        }
        for &y in &seq.labels {
            self.space.check_label(y)?;
        }
        Ok(())
    }

    /// Builds exponentiated scores of position `t` from the active features.
    fn load<F: FeatureLookup>(&mut self, seq: &Sequence, lookup: &F, t: usize, w: &[f64]) -> Result<()> {
        self.feats.clear();
        self.feats.extend(lookup.features_at(seq, t));
        self.scores.build(&self.space, t, &self.feats, w)?;
        self.scores.exp();
        Ok(())
    }

    /// next_alpha = (Mi^T alpha) * Vi, or Vi at the first position.
    fn forward(&mut self, t: usize) {
        let K = self.space.num_states();
        for s in 0..K {
            let inflow = if t == 0 {
                1.0
            } else {
                (0..K).map(|p| self.scores.m(p, s) * self.alpha[p]).sum::<f64>()
            };
            self.next_alpha[s] = inflow * self.scores.v(s);
        }
    }

    fn beta_score<F: FeatureLookup>(&mut self, seq: &Sequence, lookup: &F, w: &[f64]) -> Result<()> {
        let T = self.num_items;
        let K = self.space.num_states();
        let scaling = self.flag.contains(CtxOpt::CTXF_SCALING);

        /* Compute the beta scores at (T-1, *). */
        let last = T - 1;
        self.scale_factor[last] = if scaling { K as f64 } else { 1.0 };
        for s in 0..K {
            self.beta_score[K * last + s] = 1.0 / self.scale_factor[last];
        }

        /* Compute the beta scores at (t-1, *) from (t, *). */
        for t in (1..T).rev() {
            self.load(seq, lookup, t, w)?;
            for s in 0..K {
                self.row[s] = self.beta_score[K * t + s] * self.scores.v(s);
            }
            let mut sum = 0.0;
            for p in 0..K {
                let b: f64 = (0..K).map(|s| self.scores.m(p, s) * self.row[s]).sum();
                self.beta_score[K * (t - 1) + p] = b;
                sum += b;
            }
            let c = if scaling { sum } else { 1.0 };
            if !(c > 0.0 && c.is_finite()) {
                return Err(CrfError::NonFiniteValue("backward scale factor"));
            }
            self.scale_factor[t - 1] = c;
            for p in 0..K {
                self.beta_score[K * (t - 1) + p] /= c;
            }
        }
        Ok(())
    }

    /// Adds the log-likelihood and gradient of one labelled sequence to
    /// `state`, evaluated at the weights held by `state`.
    ///
    /// Nothing is written to `state` unless the whole sequence is processed
    /// successfully. An empty sequence contributes nothing. Returns the
    /// sequence log-likelihood.
    pub fn accumulate<F: FeatureLookup>(
        &mut self,
        seq: &Sequence,
        lookup: &F,
        state: &mut TransitionState,
    ) -> Result<f64> {
        if !self.flag.contains(CtxOpt::CTXF_MARGINALS) {
            return Err(CrfError::InvalidParameters(
                "accumulation needs a context with CTXF_MARGINALS".into(),
            ));
        }
        let T = seq.len();
        if T == 0 {
            return Ok(0.0);
        }
        if state.num_labels() != self.space.num_labels() {
            return Err(CrfError::DimensionMismatch {
                what: "label count",
                expected: self.space.num_labels(),
                found: state.num_labels(),
            });
        }
        self.check_labels(seq)?;
        let K = self.space.num_states();
        let L = self.space.num_labels();

        let parts = state.parts();
        let w: &[f64] = parts.coef;
        self.set_num_items(T);
        self.beta_score(seq, lookup, w)?;

        /* Forward pass with observed and expected feature counts. */
        self.events.clear();
        let mut logli = 0.0;
        for j in 0..T {
            self.load(seq, lookup, j, w)?;
            self.forward(j);
            let beta = &self.beta_score[K * j..K * (j + 1)];
            for f in &self.feats {
                let observed = f.is_observed(&self.space, &seq.labels, j);
                if observed {
                    logli += w[f.index] * f.value;
                }
                let expected = match f.ftype {
                    FeatType::FT_STATE => self.next_alpha[f.label] * f.value * beta[f.label],
                    FeatType::FT_LABEL => {
                        let mass: f64 = (f.label..K)
                            .step_by(L)
                            .map(|s| self.next_alpha[s] * beta[s])
                            .sum();
                        mass * f.value
                    }
                    FeatType::FT_TRANS if j > 0 => {
                        self.alpha[f.prev]
                            * self.scores.v(f.label)
                            * self.scores.m(f.prev, f.label)
                            * f.value
                            * beta[f.label]
                    }
                    FeatType::FT_TRANS => 0.0,
                };
                self.events
                    .push((f.index, if observed { f.value } else { 0.0 }, expected));
            }
            let c = self.scale_factor[j];
            for s in 0..K {
                self.alpha[s] = self.next_alpha[s] / c;
            }
        }

        let zx: f64 = self.alpha.iter().sum();
        let log_scale: f64 = self.scale_factor[..T].iter().map(|c| c.ln()).sum();
        let log_norm = zx.ln() + log_scale;
        logli -= log_norm;
        if !(zx > 0.0 && logli.is_finite()) {
            return Err(CrfError::NonFiniteValue("sequence log-likelihood"));
        }

        for &(k, obs, exp) in &self.events {
            parts.gradient[k] += obs - exp / zx;
        }
        *parts.loglikelihood += logli;
        *parts.num_rows += 1.0;
        self.log_norm = log_norm;
        Ok(logli)
    }

    /// Logarithm of the partition function of `seq` under weights `w`.
    pub fn lognorm<F: FeatureLookup>(&mut self, seq: &Sequence, lookup: &F, w: &[f64]) -> Result<f64> {
        let T = seq.len();
        let K = self.space.num_states();
        self.set_num_items(T);
        let mut log_norm = 0.0;
        for t in 0..T {
            self.load(seq, lookup, t, w)?;
            self.forward(t);
            let sum: f64 = self.next_alpha.iter().sum();
            if !(sum > 0.0 && sum.is_finite()) {
                return Err(CrfError::NonFiniteValue("forward scale factor"));
            }
            for s in 0..K {
                self.alpha[s] = self.next_alpha[s] / sum;
            }
            log_norm += sum.ln();
        }
        self.log_norm = log_norm;
        Ok(log_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::{feature::ExplicitFeatures, labels::ChainOrder};

    fn first_order() -> (LabelSpace, ExplicitFeatures, Sequence, Vec<f64>) {
        let trans = vec![
            Feature::trans(6, 0, 1, 1.0),
            Feature::trans(7, 1, 2, 1.0),
            Feature::trans(8, 2, 2, 1.0),
            Feature::trans(9, 0, 0, 1.0),
        ];
        let mut positions = vec![
            vec![
                Feature::state(0, 0, 1.0),
                Feature::state(1, 1, 0.5),
                Feature::state(2, 2, 1.0),
            ],
            vec![Feature::state(0, 1, 1.0), Feature::state(3, 2, 2.0)],
            vec![Feature::state(4, 0, 1.0), Feature::state(5, 1, -1.0)],
            vec![Feature::state(0, 2, 1.0), Feature::state(2, 0, 0.3)],
        ];
        for p in positions.iter_mut() {
            p.extend(trans.iter().copied());
        }
        let seq = Sequence::new(vec![vec![]; 4], vec![0, 1, 2, 2]);
        let w = vec![0.3, -0.2, 0.5, 1.1, -0.7, 0.4, 0.25, -0.5, 0.8, 0.1];
        (
            LabelSpace::first_order(3).unwrap(),
            ExplicitFeatures::new(positions),
            seq,
            w,
        )
    }

    fn second_order() -> (LabelSpace, ExplicitFeatures, Sequence, Vec<f64>) {
        let space = LabelSpace::new(2, ChainOrder::Second).unwrap();
        let trans = vec![
            Feature::trans(4, 2, 1, 1.0),
            Feature::trans(5, 1, 3, 1.0),
            Feature::trans(6, 3, 2, 1.0),
            Feature::trans(7, 1, 2, 1.0),
        ];
        let mut positions = vec![
            vec![
                Feature::label(0, 0, 1.0),
                Feature::label(1, 1, 1.0),
                Feature::state(2, 2, 1.0),
            ],
            vec![Feature::label(0, 1, 1.0), Feature::state(3, 1, 0.5)],
            vec![Feature::label(1, 1, 0.5), Feature::state(3, 3, 1.0)],
            vec![Feature::label(0, 0, 1.0), Feature::state(2, 2, 2.0)],
        ];
        for p in positions.iter_mut().skip(1) {
            p.extend(trans.iter().copied());
        }
        let seq = Sequence::new(vec![vec![]; 4], vec![0, 1, 1, 0]);
        let w = vec![0.2, -0.4, 0.7, 0.1, 0.9, -0.3, 0.5, 0.05];
        (space, ExplicitFeatures::new(positions), seq, w)
    }

    fn evaluate(
        space: LabelSpace,
        feats: &ExplicitFeatures,
        seq: &Sequence,
        w: &[f64],
        flag: CtxOpt,
    ) -> (f64, Vec<f64>) {
        let mut state = TransitionState::new(w.len(), space.num_labels(), 1).unwrap();
        state.set_coef(w).unwrap();
        let mut ctx = Crf1dContext::new(flag | CtxOpt::CTXF_MARGINALS, space);
        let ll = ctx.accumulate(seq, feats, &mut state).unwrap();
        assert_eq!(state.loglikelihood(), ll);
        assert_eq!(state.num_rows(), 1);
        (ll, state.gradient().to_vec())
    }

    fn check_gradient(space: LabelSpace, feats: &ExplicitFeatures, seq: &Sequence, w: &[f64]) {
        let (_, grad) = evaluate(space, feats, seq, w, CtxOpt::CTXF_SCALING);
        let h = 1e-6;
        for k in 0..w.len() {
            let mut plus = w.to_vec();
            plus[k] += h;
            let mut minus = w.to_vec();
            minus[k] -= h;
            let (fp, _) = evaluate(space, feats, seq, &plus, CtxOpt::CTXF_SCALING);
            let (fm, _) = evaluate(space, feats, seq, &minus, CtxOpt::CTXF_SCALING);
            let numeric = (fp - fm) / (2.0 * h);
            assert!(
                (numeric - grad[k]).abs() < 1e-5,
                "feature {k}: analytic {} numeric {numeric}",
                grad[k]
            );
        }
    }

    #[test]
    fn init() {
        let space = LabelSpace::first_order(9).unwrap();
        let mut ctx = Crf1dContext::new(CtxOpt::CTXF_ALL, space);
        assert_eq!(ctx.num_items, 0);
        ctx.set_num_items(12);
        assert_eq!(ctx.cap_items, 12);
        assert_eq!(ctx.beta_score.len(), 12 * 9);
        ctx.set_num_items(3);
        assert_eq!(ctx.cap_items, 12);
    }

    #[test]
    fn single_position() {
        let space = LabelSpace::first_order(2).unwrap();
        let feats = ExplicitFeatures::new(vec![vec![Feature::state(0, 0, 1.0)]]);
        let seq = Sequence::new(vec![vec![]], vec![0]);
        for w in [0.0, 0.7, -2.5] {
            let (ll, grad) = evaluate(space, &feats, &seq, &[w], CtxOpt::CTXF_SCALING);
            let z = w.exp() + 1.0;
            assert!((ll - (w - z.ln())).abs() < 1e-12);
            assert!((grad[0] - (1.0 - w.exp() / z)).abs() < 1e-12);
        }
    }

    #[test]
    fn scaling_invariance() {
        for (space, feats, seq, w) in [first_order(), second_order()] {
            let (a, ga) = evaluate(space, &feats, &seq, &w, CtxOpt::CTXF_SCALING);
            let (b, gb) = evaluate(space, &feats, &seq, &w, CtxOpt::empty());
            assert!((a - b).abs() < 1e-10, "{a} != {b}");
            for (x, y) in ga.iter().zip(&gb) {
                assert!((x - y).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn gradient_first_order() {
        let (space, feats, seq, w) = first_order();
        check_gradient(space, &feats, &seq, &w);
    }

    #[test]
    fn gradient_second_order() {
        let (space, feats, seq, w) = second_order();
        check_gradient(space, &feats, &seq, &w);
    }

    #[test]
    fn lognorm_matches() {
        let (space, feats, seq, w) = first_order();
        let mut state = TransitionState::new(w.len(), 3, 1).unwrap();
        state.set_coef(&w).unwrap();
        let mut ctx = Crf1dContext::new(CtxOpt::CTXF_ALL, space);
        ctx.accumulate(&seq, &feats, &mut state).unwrap();
        let from_accumulate = ctx.lognorm_value();
        let from_forward = ctx.lognorm(&seq, &feats, &w).unwrap();
        assert!((from_accumulate - from_forward).abs() < 1e-10);
    }

    #[test]
    fn long_sequence() {
        let space = LabelSpace::first_order(3).unwrap();
        let T = 3000;
        let position = vec![
            Feature::state(0, 0, 1.0),
            Feature::state(1, 1, 1.0),
            Feature::trans(2, 0, 1, 1.0),
            Feature::trans(3, 1, 0, 1.0),
        ];
        let feats = ExplicitFeatures::new(vec![position; T]);
        let labels = (0..T).map(|t| t % 2).collect();
        let seq = Sequence::new(vec![vec![]; T], labels);
        let (ll, grad) = evaluate(space, &feats, &seq, &[3.0, 2.0, 4.0, 1.5], CtxOpt::CTXF_SCALING);
        assert!(ll.is_finite() && ll < 0.0);
        assert!(grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn empty_sequence() {
        let space = LabelSpace::first_order(2).unwrap();
        let feats = ExplicitFeatures::default();
        let mut state = TransitionState::new(1, 2, 1).unwrap();
        let mut ctx = Crf1dContext::new(CtxOpt::CTXF_ALL, space);
        assert_eq!(ctx.accumulate(&Sequence::default(), &feats, &mut state).unwrap(), 0.0);
        assert_eq!(state.num_rows(), 0);
    }

    #[test]
    fn invalid_label_leaves_state() {
        let (space, feats, seq, w) = first_order();
        let mut state = TransitionState::new(w.len(), 3, 1).unwrap();
        state.set_coef(&w).unwrap();
        let mut ctx = Crf1dContext::new(CtxOpt::CTXF_ALL, space);
        ctx.accumulate(&seq, &feats, &mut state).unwrap();
        let before = state.clone();

        let mut positions: Vec<Vec<Feature>> = (0..4).map(|t| feats.features_at(&seq, t).collect()).collect();
        positions[2].push(Feature::state(1, 3, 1.0));
        let bad = ExplicitFeatures::new(positions);
        let r = ctx.accumulate(&seq, &bad, &mut state);
        assert!(matches!(r, Err(CrfError::InvalidLabel { label: 3, num_labels: 3 })));
        assert_eq!(state, before);

        let gold = Sequence::new(vec![vec![]; 2], vec![0, 3]);
        assert!(matches!(
            ctx.accumulate(&gold, &feats, &mut state),
            Err(CrfError::InvalidLabel { label: 3, .. })
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn needs_marginals() {
        let (space, feats, seq, w) = first_order();
        let mut state = TransitionState::new(w.len(), 3, 1).unwrap();
        let mut ctx = Crf1dContext::new(CtxOpt::CTXF_SCALING, space);
        assert!(matches!(
            ctx.accumulate(&seq, &feats, &mut state),
            Err(CrfError::InvalidParameters(_))
        ));
    }
}
