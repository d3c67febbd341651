pub mod errors;
pub mod index;
pub mod similarity;

pub use errors::IndexError;
pub use index::{Metadata, ScoredRecord, SimilarityIndex, SimilarityRecord, DEFAULT_TOP_K};
