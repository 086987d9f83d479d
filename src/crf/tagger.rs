use crate::{dataset::Sequence, error::Result};

pub trait Tagger {
    /// The most likely label sequence of `seq` and its (unnormalized) score.
    fn viterbi(&mut self, seq: &Sequence) -> Result<(Vec<usize>, f64)>;
    /// Logarithm of the partition function of `seq`.
    fn lognorm(&mut self, seq: &Sequence) -> Result<f64>;
    /// Unnormalized log score of labelling `seq` with `labels`.
    fn score(&mut self, seq: &Sequence, labels: &[usize]) -> Result<f64>;

    fn probability(&mut self, seq: &Sequence, labels: &[usize]) -> Result<f64> {
        Ok((self.score(seq, labels)? - self.lognorm(seq)?).exp())
    }
}
