#![allow(non_snake_case)]

pub mod config;
pub mod crf;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod quark;

pub use config::TrainingOptions;
pub use crf::{
    crf1d::{model::Crf1dModel, tagger::Crf1dTagger},
    labels::{ChainOrder, LabelSpace},
    model::Model,
    state::TransitionState,
    tagger::Tagger,
    trainer::{Checkpoint, Crf1dTrainer, LbfgsTrainer, StopReason, TrainingOutcome},
};
pub use dataset::{Attr, Dataset, Item, Sequence};
pub use error::{CrfError, Result};
pub use evaluation::Evaluation;
pub use quark::Quark;
