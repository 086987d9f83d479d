use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::{
    error::{CrfError, Result},
    quark::{Quark, StringTable, TextVectorizer},
};

pub type Item = Vec<Attr>;

/// An attribute id with its scaling value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    pub id: usize,
    pub value: f64,
}

impl Attr {
    pub fn new(id: usize, value: f64) -> Self {
        Self { id, value }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Sequence {
    pub items: Vec<Item>,
    pub labels: Vec<usize>,
    /// Group (input file) the sequence was read from.
    pub group: usize,
}

impl Sequence {
    pub fn new(items: Vec<Item>, labels: Vec<usize>) -> Self {
        Self {
            items,
            labels,
            group: 0,
        }
    }

    pub fn push(&mut self, item: Item, label: usize) {
        self.items.push(item);
        self.labels.push(label);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.labels.clear();
    }
}

/// Labelled sequences together with their label and attribute string tables.
///
/// A frozen dataset maps strings against fixed tables (those of a trained
/// model): unknown attributes are dropped and unknown labels are an error.
#[derive(Debug, Default)]
pub struct Dataset {
    pub seqs: Vec<Sequence>,
    pub labels: Quark,
    pub attrs: Quark,
    frozen: bool,
}

fn parse_attr(field: &str) -> (&str, f64) {
    match field.rsplit_once(':') {
        Some((name, value)) if !name.is_empty() => match value.parse::<f64>() {
            Ok(v) => (name, v),
            Err(_) => (field, 1.0),
        },
        _ => (field, 1.0),
    }
}

impl Dataset {
    pub fn frozen(labels: Quark, attrs: Quark) -> Self {
        Self {
            seqs: Vec::new(),
            labels,
            attrs,
            frozen: true,
        }
    }

    /// Reads `label\tattr[:value]\t...` lines, one item per line, with blank
    /// lines between sequences. Returns the number of sequences read.
    pub fn read<R: BufRead>(&mut self, reader: R, group: usize) -> Result<usize> {
        let before = self.seqs.len();
        let mut seq = Sequence {
            group,
            ..Default::default()
        };
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                if !seq.is_empty() {
                    self.seqs.push(std::mem::replace(
                        &mut seq,
                        Sequence {
                            group,
                            ..Default::default()
                        },
                    ));
                }
                continue;
            }
            let mut fields = line.split('\t');
            let label = fields.next().unwrap_or_default();
            let label = self.label_id(label)?;
            let mut item = Item::new();
            for field in fields.filter(|s| !s.is_empty()) {
                let (name, value) = parse_attr(field);
                if self.frozen {
                    if let Some(id) = self.attrs.to_id(name) {
                        item.push(Attr::new(id, value));
                    }
                } else {
                    item.push(Attr::new(self.attrs.find_or_insert(name), value));
                }
            }
            seq.push(item, label);
        }
        if !seq.is_empty() {
            self.seqs.push(seq);
        }
        Ok(self.seqs.len() - before)
    }

    pub fn read_file<P: AsRef<Path>>(&mut self, path: P, group: usize) -> Result<usize> {
        let path = path.as_ref();
        log::info!("reading dataset from: {}", path.display());
        let n = self.read(BufReader::new(File::open(path)?), group)?;
        log::info!("read {n} sequences (group {group})");
        Ok(n)
    }

    fn label_id(&mut self, label: &str) -> Result<usize> {
        if self.frozen {
            self.labels
                .to_id(label)
                .ok_or_else(|| CrfError::UnknownLabel(label.to_string()))
        } else {
            Ok(self.labels.find_or_insert(label))
        }
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn num_attrs(&self) -> usize {
        self.attrs.len()
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn max_seq_length(&self) -> usize {
        self.seqs.iter().map(|x| x.len()).max().unwrap_or_default()
    }

    pub fn total_items(&self) -> usize {
        self.seqs.iter().map(|x| x.len()).sum()
    }

    /// Splits sequences into (training, holdout) by group.
    pub fn split_holdout(&self, holdout: Option<usize>) -> (Vec<&Sequence>, Vec<&Sequence>) {
        self.seqs
            .iter()
            .partition(|s| holdout.map_or(true, |h| s.group != h))
    }
}

impl TryFrom<File> for Dataset {
    type Error = CrfError;

    fn try_from(f: File) -> Result<Self> {
        let mut ds = Dataset::default();
        ds.read(BufReader::new(f), 0)?;
        Ok(ds)
    }
}
