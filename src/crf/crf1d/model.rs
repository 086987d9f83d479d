use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use super::tagger::Crf1dTagger;
use crate::{
    crf::{
        feature::{Crf1dFeatures, FeatType},
        labels::ChainOrder,
        model::Model,
        tagger::Tagger,
    },
    error::{CrfError, Result},
    quark::{Quark, StringTable},
};

/// Feature table, weights and string tables of a trained linear-chain CRF.
///
/// Stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crf1dModel {
    labels: Quark,
    attrs: Quark,
    features: Crf1dFeatures,
    weights: Vec<f64>,
}

impl Crf1dModel {
    pub fn new(labels: Quark, attrs: Quark, features: Crf1dFeatures, weights: Vec<f64>) -> Result<Self> {
        let model = Self {
            labels,
            attrs,
            features,
            weights,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.weights.len() != self.features.num_features() {
            return Err(CrfError::InvalidModel(format!(
                "{} weights for {} features",
                self.weights.len(),
                self.features.num_features()
            )));
        }
        if self.labels.len() != self.features.space().num_labels() {
            return Err(CrfError::InvalidModel(format!(
                "{} label strings for {} labels",
                self.labels.len(),
                self.features.space().num_labels()
            )));
        }
        if !self.weights.iter().all(|w| w.is_finite()) {
            return Err(CrfError::InvalidModel("non-finite weight".into()));
        }
        Ok(())
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("loading model from: {}", path.display());
        Self::from_memory(&std::fs::read(path)?)
    }

    pub fn from_memory(buffer: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(buffer).map_err(|e| CrfError::InvalidModel(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut out, self)?;
        out.flush()?;
        log::info!("model saved to: {}", path.display());
        Ok(())
    }

    #[inline]
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn num_attrs(&self) -> usize {
        self.attrs.len()
    }

    pub fn features(&self) -> &Crf1dFeatures {
        &self.features
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn state_name(&self, state: usize) -> String {
        let space = self.features.space();
        let name = |l: usize| self.labels.to_str(l).unwrap_or("?").to_string();
        match space.order() {
            ChainOrder::First => name(state),
            ChainOrder::Second => format!("{}|{}", name(space.prev_of(state)), name(space.label_of(state))),
        }
    }
}

impl Model for Crf1dModel {
    fn tagger(&self) -> impl Tagger + '_ {
        Crf1dTagger::new(*self.features.space(), &self.features, &self.weights)
    }

    fn labels(&self) -> &Quark {
        &self.labels
    }

    fn attrs(&self) -> &Quark {
        &self.attrs
    }

    fn dump<W: Write>(&self, mut out: W) -> Result<()> {
        let space = self.features.space();
        writeln!(out, "FILEHEADER = {{")?;
        writeln!(out, "  order: {:?}", space.order())?;
        writeln!(out, "  num_features: {}", self.features.num_features())?;
        writeln!(out, "  num_labels: {}", self.num_labels())?;
        writeln!(out, "  num_attrs: {}", self.num_attrs())?;
        writeln!(out, "}}\n")?;

        writeln!(out, "LABELS = {{")?;
        for (i, label) in self.labels.iter().enumerate() {
            writeln!(out, "  {i:5}: {label}")?;
        }
        writeln!(out, "}}\n")?;

        writeln!(out, "TRANSITIONS = {{")?;
        for (i, f) in self.features.features().iter().enumerate() {
            if f.ftype == FeatType::FT_TRANS {
                writeln!(
                    out,
                    "  ({}) {} --> {}: {:.6}",
                    i,
                    self.state_name(f.src),
                    self.state_name(f.dst),
                    self.weights[i]
                )?;
            }
        }
        writeln!(out, "}}\n")?;

        writeln!(out, "STATE_FEATURES = {{")?;
        for (i, f) in self.features.features().iter().enumerate() {
            let dst = match f.ftype {
                FeatType::FT_TRANS => continue,
                FeatType::FT_STATE => self.state_name(f.dst),
                FeatType::FT_LABEL => self.labels.to_str(f.dst).unwrap_or("?").to_string(),
            };
            let attr = self.attrs.to_str(f.src).unwrap_or("?");
            writeln!(out, "  ({}) {} --> {}: {:.6}", i, attr, dst, self.weights[i])?;
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crf::{feature::FeatureOptions, labels::LabelSpace},
        dataset::Dataset,
    };

    fn model() -> Crf1dModel {
        let mut ds = Dataset::default();
        ds.read("P\thello\tworld\nQ\thi\tthere\n\n".as_bytes(), 0).unwrap();
        let space = LabelSpace::first_order(ds.num_labels()).unwrap();
        let features = Crf1dFeatures::generate(&ds.seqs, space, &FeatureOptions::default()).unwrap();
        let weights = vec![1.0, 1.0, 2.0, 2.0, 0.5];
        Crf1dModel::new(ds.labels, ds.attrs, features, weights).unwrap()
    }

    #[test]
    fn new() {
        let m = model();
        assert_eq!(m.num_labels(), 2);
        assert_eq!(m.num_attrs(), 4);
        let r = Crf1dModel::new(m.labels.clone(), m.attrs.clone(), m.features.clone(), vec![0.0; 3]);
        assert!(matches!(r, Err(CrfError::InvalidModel(_))));
    }

    #[test]
    fn json() {
        let m = model();
        let s = serde_json::to_vec(&m).unwrap();
        let m2 = Crf1dModel::from_memory(&s).unwrap();
        // weights are short decimals, exact in JSON
        assert_eq!(m2.weights(), m.weights());
        assert_eq!(m2.labels(), m.labels());
        assert!(matches!(
            Crf1dModel::from_memory(b"{\"labels\": []}"),
            Err(CrfError::InvalidModel(_))
        ));
    }

    #[test]
    fn tag() {
        let m = model();
        let mut ds = Dataset::frozen(m.labels().clone(), m.attrs().clone());
        ds.read("P\thello\nQ\tthere\tunseen\n".as_bytes(), 0).unwrap();
        let mut tagger = m.tagger();
        let (labels, _) = tagger.viterbi(&ds.seqs[0]).unwrap();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn dump() {
        let m = model();
        let mut out = Vec::new();
        m.dump(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("num_features: 5"));
        assert!(s.contains("P --> Q"));
        assert!(s.contains("hello --> P"));
    }
}
