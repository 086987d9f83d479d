use std::{collections::HashMap, time::Instant};

use serde::{Deserialize, Serialize};

use super::labels::{ChainOrder, LabelSpace};
use crate::{
    dataset::Sequence,
    error::{CrfError, Result},
};

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Clone, Copy)]
pub enum FeatType {
    /// Emission on a lattice state.
    FT_STATE = 0,
    /// Transition between two lattice states.
    FT_TRANS = 1,
    /// Emission on a base label, firing for every lattice state carrying it.
    FT_LABEL = 2,
}

/// An active feature at one sequence position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    pub ftype: FeatType,
    /// Source lattice state; only meaningful for `FT_TRANS`.
    pub prev: usize,
    pub label: usize,
    /// Index into the weight vector.
    pub index: usize,
    pub value: f64,
}

impl Feature {
    pub fn state(index: usize, label: usize, value: f64) -> Self {
        Self {
            ftype: FeatType::FT_STATE,
            prev: 0,
            label,
            index,
            value,
        }
    }

    pub fn trans(index: usize, prev: usize, label: usize, value: f64) -> Self {
        Self {
            ftype: FeatType::FT_TRANS,
            prev,
            label,
            index,
            value,
        }
    }

    pub fn label(index: usize, label: usize, value: f64) -> Self {
        Self {
            ftype: FeatType::FT_LABEL,
            prev: 0,
            label,
            index,
            value,
        }
    }

    /// Whether the gold labelling of `seq` fires this feature at `t`.
    pub fn is_observed(&self, space: &LabelSpace, labels: &[usize], t: usize) -> bool {
        match self.ftype {
            FeatType::FT_STATE => self.label == space.gold_state(labels, t),
            FeatType::FT_TRANS => {
                t > 0
                    && self.prev == space.gold_state(labels, t - 1)
                    && self.label == space.gold_state(labels, t)
            }
            FeatType::FT_LABEL => self.label == labels[t],
        }
    }
}

/// Produces the active features of a sequence position.
pub trait FeatureLookup {
    fn features_at<'a>(&'a self, seq: &'a Sequence, t: usize) -> impl Iterator<Item = Feature> + 'a;
}

/// Features listed explicitly per position, shared by every sequence of the
/// same length.
#[derive(Debug, Default, Clone)]
pub struct ExplicitFeatures {
    positions: Vec<Vec<Feature>>,
}

impl ExplicitFeatures {
    pub fn new(positions: Vec<Vec<Feature>>) -> Self {
        Self { positions }
    }
}

impl FeatureLookup for ExplicitFeatures {
    fn features_at<'a>(&'a self, _seq: &'a Sequence, t: usize) -> impl Iterator<Item = Feature> + 'a {
        self.positions.get(t).into_iter().flatten().copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feat {
    pub ftype: FeatType,
    pub src: usize,
    pub dst: usize,
    pub freq: f64,
}

/// Feature ids referenced from one attribute or one source state.
pub type FeatRefs = Vec<usize>;

/// Deduplicating feature collector; ids follow first insertion.
#[derive(Debug, Default)]
struct FeatSet {
    index: HashMap<(FeatType, usize, usize), usize>,
    feats: Vec<Feat>,
}

impl FeatSet {
    fn add(&mut self, f: Feat) {
        match self.index.get(&(f.ftype, f.src, f.dst)) {
            Some(&i) => self.feats[i].freq += f.freq,
            None => {
                self.index.insert((f.ftype, f.src, f.dst), self.feats.len());
                self.feats.push(f);
            }
        }
    }

    fn to_vec(self, min_freq: f64) -> Vec<Feat> {
        self.feats.into_iter().filter(|x| x.freq >= min_freq).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureOptions {
    /// Connect every attribute with every label.
    pub possible_states: bool,
    /// Generate transitions between every pair of lattice states.
    pub possible_transitions: bool,
    pub min_freq: f64,
}

/// Attribute-driven feature table of a linear-chain model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crf1dFeatures {
    space: LabelSpace,
    features: Vec<Feat>,
    attrs: Vec<FeatRefs>,
    forward_trans: Vec<FeatRefs>,
}

fn crf1df_generate<'a, I>(seqs: I, space: &LabelSpace, opt: &FeatureOptions) -> Result<Vec<Feat>>
where
    I: IntoIterator<Item = &'a Sequence>,
{
    let L = space.num_labels();
    let mut set = FeatSet::default();
    for seq in seqs {
        /* Loop over the items in the sequence. */
        for t in 0..seq.len() {
            space.check_label(seq.labels[t])?;
            let curr = space.gold_state(&seq.labels, t);

            /* Transition feature: state at #t-1 -> state at #t. */
            if t > 0 {
                set.add(Feat {
                    ftype: FeatType::FT_TRANS,
                    src: space.gold_state(&seq.labels, t - 1),
                    dst: curr,
                    freq: 1.0,
                });
            }

            for attr in &seq.items[t] {
                /* State feature: attribute #a -> state at #t. */
                set.add(Feat {
                    ftype: FeatType::FT_STATE,
                    src: attr.id,
                    dst: curr,
                    freq: attr.value,
                });
                if space.order() == ChainOrder::Second {
                    set.add(Feat {
                        ftype: FeatType::FT_LABEL,
                        src: attr.id,
                        dst: seq.labels[t],
                        freq: attr.value,
                    });
                }

                /* Connect the attribute with every output label; these have
                zero observed counts. */
                if opt.possible_states {
                    let ftype = match space.order() {
                        ChainOrder::First => FeatType::FT_STATE,
                        ChainOrder::Second => FeatType::FT_LABEL,
                    };
                    for i in 0..L {
                        set.add(Feat {
                            ftype,
                            src: attr.id,
                            dst: i,
                            freq: 0.0,
                        });
                    }
                }
            }
        }
    }

    /* Edge features for every admissible pair of states. */
    if opt.possible_transitions {
        match space.order() {
            ChainOrder::First => {
                for i in 0..L {
                    for j in 0..L {
                        set.add(Feat {
                            ftype: FeatType::FT_TRANS,
                            src: i,
                            dst: j,
                            freq: 0.0,
                        });
                    }
                }
            }
            ChainOrder::Second => {
                for a in 0..L {
                    for b in 0..L {
                        for c in 0..L {
                            set.add(Feat {
                                ftype: FeatType::FT_TRANS,
                                src: space.compound(a, b),
                                dst: space.compound(b, c),
                                freq: 0.0,
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(set.to_vec(opt.min_freq))
}

fn crf1df_init_references(attrs: &mut Vec<FeatRefs>, forward_trans: &mut [FeatRefs], features: &[Feat]) {
    /*
        Collect references (indices) of:
        - emission features fired by each attribute (attrs)
        - transition features leaving each state (forward_trans)
    */
    for (k, f) in features.iter().enumerate() {
        match f.ftype {
            FeatType::FT_STATE | FeatType::FT_LABEL => {
                if attrs.len() <= f.src {
                    attrs.resize(f.src + 1, FeatRefs::default());
                }
                attrs[f.src].push(k)
            }
            FeatType::FT_TRANS => forward_trans[f.src].push(k),
        }
    }
}

impl Crf1dFeatures {
    /// Generates the feature table from labelled sequences.
    pub fn generate<'a, I>(seqs: I, space: LabelSpace, opt: &FeatureOptions) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Sequence>,
    {
        log::info!(
            "feature generation (order: {:?}, min_freq: {}, possible_states: {}, possible_transitions: {})",
            space.order(),
            opt.min_freq,
            opt.possible_states,
            opt.possible_transitions
        );
        let begin = Instant::now();
        let features = crf1df_generate(seqs, &space, opt)?;
        log::info!(
            "number of features: {}, time cost: {:?}",
            features.len(),
            begin.elapsed()
        );
        Ok(Self::from_features(space, features))
    }

    pub fn from_features(space: LabelSpace, features: Vec<Feat>) -> Self {
        let mut attrs = Vec::new();
        let mut forward_trans = vec![FeatRefs::default(); space.num_states()];
        crf1df_init_references(&mut attrs, &mut forward_trans, &features);
        Self {
            space,
            features,
            attrs,
            forward_trans,
        }
    }

    #[inline]
    pub fn space(&self) -> &LabelSpace {
        &self.space
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn features(&self) -> &[Feat] {
        &self.features
    }
}

impl FeatureLookup for Crf1dFeatures {
    fn features_at<'a>(&'a self, seq: &'a Sequence, t: usize) -> impl Iterator<Item = Feature> + 'a {
        let emissions = seq.items[t].iter().flat_map(move |attr| {
            self.attrs
                .get(attr.id)
                .into_iter()
                .flatten()
                .map(move |&fid| {
                    let f = &self.features[fid];
                    match f.ftype {
                        FeatType::FT_LABEL => Feature::label(fid, f.dst, attr.value),
                        _ => Feature::state(fid, f.dst, attr.value),
                    }
                })
        });
        let edges: &[FeatRefs] = if t > 0 { &self.forward_trans } else { &[] };
        let transitions = edges.iter().flatten().map(move |&fid| {
            let f = &self.features[fid];
            Feature::trans(fid, f.src, f.dst, 1.0)
        });
        emissions.chain(transitions)
    }
}

/// Checks that a feature fits the weight vector and the lattice.
pub(crate) fn check_feature(f: &Feature, space: &LabelSpace, num_weights: usize) -> Result<()> {
    if f.index >= num_weights {
        return Err(CrfError::DimensionMismatch {
            what: "feature index",
            expected: num_weights,
            found: f.index + 1,
        });
    }
    match f.ftype {
        FeatType::FT_STATE => {
            space.check_state(f.label)?;
        }
        FeatType::FT_TRANS => {
            space.check_state(f.prev)?;
            space.check_state(f.label)?;
        }
        FeatType::FT_LABEL => {
            space.check_label(f.label)?;
        }
    }
    if !f.value.is_finite() {
        return Err(CrfError::NonFiniteValue("feature value"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Attr, Dataset};

    fn dataset() -> Dataset {
        let mut ds = Dataset::default();
        ds.read("P\thello\tworld\nQ\thi\tthere\n\n".as_bytes(), 0).unwrap();
        ds
    }

    #[test]
    fn generate() {
        let ds = dataset();
        let space = LabelSpace::first_order(ds.num_labels()).unwrap();
        let feats = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        // 4 state features, 1 transition
        assert_eq!(feats.num_features(), 5);
        assert_eq!(feats.attrs.len(), 4);
        assert_eq!(feats.forward_trans.len(), 2);
        assert_eq!(feats.features()[0].ftype, FeatType::FT_STATE);

        let opt = FeatureOptions {
            possible_states: true,
            possible_transitions: true,
            min_freq: 0.0,
        };
        let feats = Crf1dFeatures::generate(&ds.seqs, space, &opt).unwrap();
        assert_eq!(feats.num_features(), 8 + 4);

        let opt = FeatureOptions {
            min_freq: 0.5,
            ..opt
        };
        let feats = Crf1dFeatures::generate(&ds.seqs, space, &opt).unwrap();
        assert_eq!(feats.num_features(), 5);
    }

    #[test]
    fn deterministic_ids() {
        let ds = dataset();
        let space = LabelSpace::first_order(2).unwrap();
        let a = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        let b = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        let key = |f: &Feat| (f.ftype, f.src, f.dst);
        assert_eq!(
            a.features().iter().map(key).collect::<Vec<_>>(),
            b.features().iter().map(key).collect::<Vec<_>>()
        );
    }

    #[test]
    fn lookup() {
        let ds = dataset();
        let space = LabelSpace::first_order(2).unwrap();
        let feats = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        let seq = &ds.seqs[0];
        let at0: Vec<_> = feats.features_at(seq, 0).collect();
        assert_eq!(at0.len(), 2);
        assert!(at0.iter().all(|f| f.ftype == FeatType::FT_STATE && f.label == 0));
        let at1: Vec<_> = feats.features_at(seq, 1).collect();
        assert_eq!(at1.len(), 3);
        let trans: Vec<_> = at1.iter().filter(|f| f.ftype == FeatType::FT_TRANS).collect();
        assert_eq!(trans.len(), 1);
        assert!(trans[0].is_observed(&space, &seq.labels, 1));
    }

    #[test]
    fn second_order() {
        let ds = dataset();
        let space = LabelSpace::new(2, ChainOrder::Second).unwrap();
        let feats = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        // per attribute one compound-state and one label emission, plus one transition
        assert_eq!(feats.num_features(), 4 * 2 + 1);
        let seq = &ds.seqs[0];
        for f in feats.features_at(seq, 1) {
            assert!(f.is_observed(&space, &seq.labels, 1), "{f:?}");
        }
    }

    #[test]
    fn unseen_attribute() {
        let ds = dataset();
        let space = LabelSpace::first_order(2).unwrap();
        let feats = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        let seq = Sequence::new(vec![vec![Attr::new(99, 1.0)]], vec![0]);
        assert_eq!(feats.features_at(&seq, 0).count(), 0);
    }

    #[test]
    fn invalid_feature() {
        let space = LabelSpace::first_order(2).unwrap();
        assert!(matches!(
            check_feature(&Feature::state(0, 2, 1.0), &space, 1),
            Err(CrfError::InvalidLabel { label: 2, .. })
        ));
        assert!(matches!(
            check_feature(&Feature::state(1, 0, 1.0), &space, 1),
            Err(CrfError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            check_feature(&Feature::state(0, 0, f64::INFINITY), &space, 1),
            Err(CrfError::NonFiniteValue(_))
        ));
    }
}
