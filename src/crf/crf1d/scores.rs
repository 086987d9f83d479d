use crate::{
    crf::{
        feature::{check_feature, FeatType, Feature},
        labels::{ChainOrder, LabelSpace},
    },
    error::Result,
};

/// Emission vector `Vi` and transition matrix `Mi` of one position.
///
/// Both start in the log domain; `exp` moves them to the multiplicative
/// domain used by the forward-backward recursion.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrices {
    num_states: usize,
    /**
     * Emission scores.
     *  This is a [K] vector whose element [s] is the total score of
     *  emission features firing for lattice state #s.
     */
    pub vi: Vec<f64>,
    /**
     * Transition scores.
     *  This is a [K][K] matrix whose element [p][s] is the total score of
     *  transition features from state #p to state #s.
     */
    pub mi: Vec<f64>,
}

impl ScoreMatrices {
    pub fn new(space: &LabelSpace) -> Self {
        let K = space.num_states();
        Self {
            num_states: K,
            vi: vec![0.0; K],
            mi: vec![0.0; K * K],
        }
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    #[inline]
    pub fn v(&self, s: usize) -> f64 {
        self.vi[s]
    }

    #[inline]
    pub fn m(&self, p: usize, s: usize) -> f64 {
        self.mi[self.num_states * p + s]
    }

    /// Accumulates `weight[f.index] * f.value` of every feature active at
    /// position `t` into log-domain scores. Transitions at `t == 0` are ignored.
    ///
    /// Lattice cells no label sequence can reach are set to `-inf`: second-order
    /// states not starting from the outside label at `t == 0`, and pairs that
    /// disagree on the shared label afterwards.
    pub fn build(&mut self, space: &LabelSpace, t: usize, feats: &[Feature], w: &[f64]) -> Result<()> {
        let K = self.num_states;
        let L = space.num_labels();
        self.vi.iter_mut().for_each(|v| *v = 0.0);
        self.mi.iter_mut().for_each(|v| *v = 0.0);
        for f in feats {
            check_feature(f, space, w.len())?;
            let score = w[f.index] * f.value;
            match f.ftype {
                FeatType::FT_STATE => self.vi[f.label] += score,
                FeatType::FT_TRANS => {
                    if t > 0 {
                        self.mi[K * f.prev + f.label] += score;
                    }
                }
                FeatType::FT_LABEL => {
                    /* Fires on every lattice state whose current label matches. */
                    for s in (f.label..K).step_by(L) {
                        self.vi[s] += score;
                    }
                }
            }
        }
        if space.order() == ChainOrder::Second {
            if t == 0 {
                for (s, v) in self.vi.iter_mut().enumerate() {
                    if !space.starts(s) {
                        *v = f64::NEG_INFINITY;
                    }
                }
            } else {
                for (i, m) in self.mi.iter_mut().enumerate() {
                    if !space.connects(i / K, i % K) {
                        *m = f64::NEG_INFINITY;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn exp(&mut self) {
        self.vi.iter_mut().for_each(|v| *v = v.exp());
        self.mi.iter_mut().for_each(|v| *v = v.exp());
    }
}

/// Builds exponentiated `(Vi, Mi)` for position `t`.
pub fn build_scores(space: &LabelSpace, t: usize, feats: &[Feature], w: &[f64]) -> Result<ScoreMatrices> {
    let mut scores = ScoreMatrices::new(space);
    scores.build(space, t, feats, w)?;
    scores.exp();
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrfError;

    #[test]
    fn build() {
        let space = LabelSpace::first_order(2).unwrap();
        let w = [0.5, 2.0, -1.0];
        let feats = [
            Feature::state(0, 1, 2.0),
            Feature::state(1, 1, 1.0),
            Feature::trans(2, 0, 1, 1.0),
        ];
        let s = build_scores(&space, 1, &feats, &w).unwrap();
        assert_eq!(s.v(0), 1.0);
        assert!((s.v(1) - 3.0_f64.exp()).abs() < 1e-12);
        assert!((s.m(0, 1) - (-1.0_f64).exp()).abs() < 1e-12);
        assert_eq!(s.m(1, 0), 1.0);

        let s = build_scores(&space, 0, &feats, &w).unwrap();
        assert!(s.mi.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn label_feature() {
        let space = LabelSpace::new(2, ChainOrder::Second).unwrap();
        let mut s = ScoreMatrices::new(&space);
        s.build(&space, 1, &[Feature::label(0, 1, 1.0)], &[3.0]).unwrap();
        assert_eq!(s.vi, vec![0.0, 3.0, 0.0, 3.0]);
    }

    #[test]
    fn second_order_reachability() {
        let space = LabelSpace::new(2, ChainOrder::Second).unwrap();
        let inf = f64::NEG_INFINITY;

        /* only (outside, y) may start a path */
        let s = build_scores(&space, 0, &[Feature::label(0, 1, 1.0)], &[3.0]).unwrap();
        assert_eq!(s.vi, vec![0.0, 0.0, 1.0, 3.0_f64.exp()]);

        let mut s = ScoreMatrices::new(&space);
        s.build(&space, 1, &[Feature::trans(0, 1, 3, 1.0)], &[0.5]).unwrap();
        assert_eq!(s.m(1, 3), 0.5);
        assert_eq!(s.m(0, 0), 0.0);
        assert_eq!(s.m(2, 1), 0.0);
        for (p, q) in [(0, 2), (0, 3), (1, 0), (1, 1), (2, 2), (3, 0)] {
            assert_eq!(s.m(p, q), inf, "{p} -> {q}");
        }
        s.exp();
        assert_eq!(s.m(1, 0), 0.0);
        assert_eq!(s.mi.iter().filter(|&&m| m == 0.0).count(), 8);
    }

    #[test]
    fn invalid_label() {
        let space = LabelSpace::first_order(2).unwrap();
        let r = build_scores(&space, 1, &[Feature::trans(0, 0, 2, 1.0)], &[1.0]);
        assert!(matches!(r, Err(CrfError::InvalidLabel { label: 2, num_labels: 2 })));
    }
}
