pub mod bpe;
pub mod corpus;
pub mod error;
mod persist;
#[cfg(feature = "python")]
mod python;
pub mod unigram;

pub use bpe::{learn_bpe, BpeConfig, BpeModel, Merge, PairMergeBuilder, DEFAULT_END_OF_WORD};
pub use corpus::{Corpus, VocabConfig, WordVocab};
pub use error::{Result, SubwordError};
pub use unigram::{train_unigram, Segmentation, SubwordTable, UnigramConfig, UnigramTrainer};
