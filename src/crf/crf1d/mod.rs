pub mod context;
pub mod model;
pub mod scores;
pub mod tagger;
