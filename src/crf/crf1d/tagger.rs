use super::{
    context::{Crf1dContext, CtxOpt},
    scores::ScoreMatrices,
};
use crate::{
    crf::{
        feature::{Feature, FeatureLookup},
        labels::LabelSpace,
        tagger::Tagger,
    },
    dataset::Sequence,
    error::{CrfError, Result},
};

/// Decodes sequences with fixed weights.
pub struct Crf1dTagger<'a, F> {
    lookup: &'a F,
    weights: &'a [f64],
    space: LabelSpace,
    ctx: Crf1dContext,
    /* Log-domain scores of the position being decoded. */
    scores: ScoreMatrices,
    feats: Vec<Feature>,
    /**
     * Viterbi scores.
     *  This is a [T][K] matrix whose element [t][s] is the best score of a
     *  path arriving at (t, s).
     */
    alpha_score: Vec<f64>,
    /**
     * Backward edges.
     *  This is a [T][K] matrix whose element [t][j] is the state #i at t-1
     *  that yields the maximum score to arrive at (t, j).
     */
    backward_edge: Vec<usize>,
}

impl<'a, F: FeatureLookup> Crf1dTagger<'a, F> {
    pub fn new(space: LabelSpace, lookup: &'a F, weights: &'a [f64]) -> Self {
        Self {
            lookup,
            weights,
            space,
            ctx: Crf1dContext::new(CtxOpt::CTXF_SCALING, space),
            scores: ScoreMatrices::new(&space),
            feats: Vec::new(),
            alpha_score: Vec::new(),
            backward_edge: Vec::new(),
        }
    }

    /* This leaves state and trans scores in the logarithm domain. */
    fn score_at(&mut self, seq: &Sequence, t: usize) -> Result<()> {
        let lookup = self.lookup;
        self.feats.clear();
        self.feats.extend(lookup.features_at(seq, t));
        self.scores.build(&self.space, t, &self.feats, self.weights)
    }
}

impl<'a, F: FeatureLookup> Tagger for Crf1dTagger<'a, F> {
    fn viterbi(&mut self, seq: &Sequence) -> Result<(Vec<usize>, f64)> {
        let T = seq.len();
        let K = self.space.num_states();
        if T == 0 {
            return Ok((Vec::new(), 0.0));
        }
        self.alpha_score.resize(T * K, 0.0);
        self.backward_edge.resize(T * K, 0);

        /* Compute the scores at (0, *). */
        self.score_at(seq, 0)?;
        self.alpha_score[..K].copy_from_slice(&self.scores.vi);

        /* Compute the scores at (t, *). */
        for t in 1..T {
            self.score_at(seq, t)?;
            for j in 0..K {
                let mut max_score = f64::NEG_INFINITY;
                let mut argmax_score = 0;
                for i in 0..K {
                    /* Transit from (t-1, i) to (t, j). */
                    let score = self.alpha_score[K * (t - 1) + i] + self.scores.m(i, j);
                    if max_score < score {
                        max_score = score;
                        argmax_score = i;
                    }
                }
                /* Backward link (#t, #j) -> (#t-1, #i). */
                self.backward_edge[K * t + j] = argmax_score;
                self.alpha_score[K * t + j] = max_score + self.scores.v(j);
            }
        }

        /* Find the node (#T, #i) that reaches EOS with the maximum score. */
        let mut states = vec![0; T];
        let mut max_score = f64::NEG_INFINITY;
        for i in 0..K {
            let score = self.alpha_score[K * (T - 1) + i];
            if max_score < score {
                max_score = score;
                states[T - 1] = i;
            }
        }
        if !max_score.is_finite() {
            return Err(CrfError::NonFiniteValue("viterbi score"));
        }
        /* Tag labels by tracing the backward links. */
        for t in (0..T - 1).rev() {
            states[t] = self.backward_edge[K * (t + 1) + states[t + 1]];
        }
        Ok((self.space.to_labels(&states), max_score))
    }

    fn lognorm(&mut self, seq: &Sequence) -> Result<f64> {
        self.ctx.lognorm(seq, self.lookup, self.weights)
    }

    fn score(&mut self, seq: &Sequence, labels: &[usize]) -> Result<f64> {
        if labels.len() != seq.len() {
            return Err(CrfError::DimensionMismatch {
                what: "label path",
                expected: seq.len(),
                found: labels.len(),
            });
        }
        for &y in labels {
            self.space.check_label(y)?;
        }
        let mut r = 0.0;
        let mut prev = 0;
        for t in 0..seq.len() {
            self.score_at(seq, t)?;
            let s = self.space.gold_state(labels, t);
            r += self.scores.v(s);
            if t > 0 {
                r += self.scores.m(prev, s);
            }
            prev = s;
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::{feature::ExplicitFeatures, labels::ChainOrder};

    fn brute_force(tagger: &mut Crf1dTagger<ExplicitFeatures>, seq: &Sequence, L: usize) -> (Vec<usize>, f64, f64) {
        let T = seq.len();
        let mut best = (Vec::new(), f64::NEG_INFINITY);
        let mut total = 0.0;
        for code in 0..L.pow(T as u32) {
            let labels: Vec<usize> = (0..T).map(|t| code / L.pow(t as u32) % L).collect();
            let s = tagger.score(seq, &labels).unwrap();
            total += s.exp();
            if s > best.1 {
                best = (labels, s);
            }
        }
        (best.0, best.1, total.ln())
    }

    fn features() -> ExplicitFeatures {
        let trans = [
            Feature::trans(3, 0, 1, 1.0),
            Feature::trans(4, 1, 1, 1.0),
            Feature::trans(5, 1, 0, 1.0),
        ];
        let mut positions = vec![
            vec![Feature::state(0, 0, 1.0), Feature::state(1, 1, 1.0)],
            vec![Feature::state(2, 0, 1.0), Feature::state(1, 2, 1.0)],
            vec![Feature::state(0, 2, 1.0)],
            vec![Feature::state(2, 1, 0.5), Feature::state(1, 0, 1.0)],
        ];
        for p in positions.iter_mut().skip(1) {
            p.extend(trans);
        }
        ExplicitFeatures::new(positions)
    }

    #[test]
    fn viterbi_first_order() {
        let lookup = features();
        let w = [0.5, 1.2, -0.3, 0.9, -0.4, 0.6];
        let space = LabelSpace::first_order(3).unwrap();
        let mut tagger = Crf1dTagger::new(space, &lookup, &w);
        let seq = Sequence::new(vec![vec![]; 4], vec![0; 4]);
        let (labels, score) = tagger.viterbi(&seq).unwrap();
        let (best, best_score, lognorm) = brute_force(&mut tagger, &seq, 3);
        assert_eq!(labels, best);
        assert!((score - best_score).abs() < 1e-12);
        assert!((tagger.lognorm(&seq).unwrap() - lognorm).abs() < 1e-10);
        let p = tagger.probability(&seq, &labels).unwrap();
        assert!(p > 0.0 && p < 1.0);
    }

    #[test]
    fn viterbi_second_order() {
        let space = LabelSpace::new(2, ChainOrder::Second).unwrap();
        let trans = [Feature::trans(2, 1, 3, 1.0), Feature::trans(3, 3, 2, 1.0)];
        let mut positions = vec![
            vec![Feature::label(0, 1, 1.0)],
            vec![Feature::label(0, 1, 1.0), Feature::state(1, 2, 1.0)],
            vec![Feature::label(1, 0, 1.0)],
        ];
        for p in positions.iter_mut().skip(1) {
            p.extend(trans);
        }
        let lookup = ExplicitFeatures::new(positions);
        let w = [0.8, -0.5, 1.5, 0.7];
        let mut tagger = Crf1dTagger::new(space, &lookup, &w);
        let seq = Sequence::new(vec![vec![]; 3], vec![0; 3]);
        let (labels, score) = tagger.viterbi(&seq).unwrap();
        let (best, best_score, lognorm) = brute_force(&mut tagger, &seq, 2);
        assert_eq!(labels, best);
        assert!((score - best_score).abs() < 1e-12);
        assert!((tagger.lognorm(&seq).unwrap() - lognorm).abs() < 1e-10);
    }

    #[test]
    fn probabilities_sum_to_one() {
        let lookup = features();
        let w = [0.5, 1.2, -0.3, 0.9, -0.4, 0.6];
        let empty = ExplicitFeatures::new(vec![vec![]; 4]);
        let seq = Sequence::new(vec![vec![]; 4], vec![0; 4]);
        for order in [ChainOrder::First, ChainOrder::Second] {
            for (lookup, L) in [(&lookup, 3), (&empty, 2)] {
                let space = LabelSpace::new(L, order).unwrap();
                let mut tagger = Crf1dTagger::new(space, lookup, &w);
                let mut total = 0.0;
                for code in 0..L.pow(4) {
                    let labels: Vec<usize> = (0..4).map(|t| code / L.pow(t) % L).collect();
                    total += tagger.probability(&seq, &labels).unwrap();
                }
                assert!((total - 1.0).abs() < 1e-10, "{order:?}, L = {L}: {total}");
            }
        }
        let space = LabelSpace::new(2, ChainOrder::Second).unwrap();
        let mut tagger = Crf1dTagger::new(space, &empty, &[]);
        assert!((tagger.lognorm(&seq).unwrap() - 16.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn empty() {
        let lookup = ExplicitFeatures::default();
        let space = LabelSpace::first_order(2).unwrap();
        let mut tagger = Crf1dTagger::new(space, &lookup, &[]);
        assert_eq!(tagger.viterbi(&Sequence::default()).unwrap(), (vec![], 0.0));
    }
}
