pub mod crf1d;
pub mod feature;
pub mod labels;
pub mod lbfgs;
pub mod model;
pub mod state;
pub mod tagger;
pub mod trainer;
