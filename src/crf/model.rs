use std::io::Write;

use crate::{error::Result, quark::Quark};

use super::tagger::Tagger;

/// A trained model: string tables plus whatever decodes with them.
pub trait Model {
    fn tagger(&self) -> impl Tagger + '_;
    fn labels(&self) -> &Quark;
    fn attrs(&self) -> &Quark;
    /// Writes a human-readable listing of the model.
    fn dump<W: Write>(&self, out: W) -> Result<()>;
}
