use std::collections::HashMap;

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::bpe::{BpeConfig, BpeModel, PairMergeBuilder};
use crate::corpus::{Corpus, VocabConfig, WordVocab};
use crate::error::SubwordError;
use crate::unigram::{SubwordTable, UnigramConfig, UnigramTrainer};

fn to_py_err(e: SubwordError) -> PyErr {
    match e {
        SubwordError::Io { .. } => PyIOError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

fn vocab_config(min_count: u64, lowercase: bool, pattern: Option<String>) -> VocabConfig {
    VocabConfig { min_count, lowercase, pattern }
}

/// Pair-merge (BPE) model.
#[pyclass(name = "Bpe")]
pub struct PyBpe {
    model: BpeModel,
}

#[pymethods]
impl PyBpe {
    /// Learn `merges` merges from a list of sentences.
    /// An empty `end_of_word` disables the marker.
    #[staticmethod]
    #[pyo3(signature = (lines, merges, min_count=1, lowercase=false, pattern=None, end_of_word="</w>"))]
    #[pyo3(text_signature = "(lines, merges, min_count=1, lowercase=False, pattern=None, end_of_word='</w>')")]
    fn train(
        py: Python<'_>,
        lines: Vec<String>,
        merges: usize,
        min_count: u64,
        lowercase: bool,
        pattern: Option<String>,
        end_of_word: &str,
    ) -> PyResult<Self> {
        let bpe = BpeConfig {
            merges,
            end_of_word: (!end_of_word.is_empty()).then(|| end_of_word.to_string()),
        };
        let vocab_cfg = vocab_config(min_count, lowercase, pattern);
        let model = py.detach(|| -> crate::Result<BpeModel> {
            let vocab = WordVocab::build(&Corpus::from_lines(lines), &vocab_cfg)?;
            let mut builder = PairMergeBuilder::new(&vocab, &bpe)?;
            builder.run(bpe.merges);
            Ok(builder.finish())
        }).map_err(to_py_err)?;
        Ok(Self { model })
    }

    #[staticmethod]
    fn load(path: &str) -> PyResult<Self> {
        Ok(Self { model: BpeModel::load(path).map_err(to_py_err)? })
    }

    fn save(&self, path: &str) -> PyResult<()> {
        self.model.save(path).map_err(to_py_err)
    }

    /// Ordered (left, right, count) triples.
    fn merges(&self) -> Vec<(String, String, u64)> {
        self.model.merges().iter()
            .map(|m| (m.left.to_string(), m.right.to_string(), m.count))
            .collect()
    }

    fn subword_vocab(&self) -> HashMap<String, u64> {
        self.model.subword_vocab().into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn encode_word(&self, word: &str) -> Vec<String> {
        self.model.encode_word(word).into_iter().map(|s| s.to_string()).collect()
    }

    #[pyo3(signature = (texts))]
    fn batch_encode(&self, py: Python<'_>, texts: Vec<String>) -> Vec<Vec<String>> {
        py.detach(|| {
            self.model.batch_encode(texts.as_slice()).into_iter()
                .map(|seq| seq.into_iter().map(|s| s.to_string()).collect())
                .collect()
        })
    }
}

/// Viterbi segmenter over a subword log-probability table.
#[pyclass(name = "Segmenter")]
pub struct PySegmenter {
    table: SubwordTable,
}

#[pymethods]
impl PySegmenter {
    #[staticmethod]
    fn from_counts(counts: HashMap<String, u64>) -> PyResult<Self> {
        Ok(Self { table: SubwordTable::from_counts(counts).map_err(to_py_err)? })
    }

    /// Estimate a table from sentences with hard EM.
    #[staticmethod]
    #[pyo3(signature = (lines, iterations=5, max_piece_chars=8, vocab_size=None, min_count=1, lowercase=false, pattern=None))]
    fn train(
        py: Python<'_>,
        lines: Vec<String>,
        iterations: usize,
        max_piece_chars: usize,
        vocab_size: Option<usize>,
        min_count: u64,
        lowercase: bool,
        pattern: Option<String>,
    ) -> PyResult<Self> {
        let cfg = UnigramConfig { max_piece_chars, iterations, vocab_size };
        let vocab_cfg = vocab_config(min_count, lowercase, pattern);
        let table = py.detach(|| -> crate::Result<SubwordTable> {
            let vocab = WordVocab::build(&Corpus::from_lines(lines), &vocab_cfg)?;
            UnigramTrainer::new(cfg)?.train(&vocab)
        }).map_err(to_py_err)?;
        Ok(Self { table })
    }

    #[staticmethod]
    fn load(path: &str) -> PyResult<Self> {
        Ok(Self { table: SubwordTable::load(path).map_err(to_py_err)? })
    }

    fn save(&self, path: &str) -> PyResult<()> {
        self.table.save(path).map_err(to_py_err)
    }

    fn segment(&self, word: &str) -> PyResult<Vec<String>> {
        let seg = self.table.segment(word).map_err(to_py_err)?;
        Ok(seg.into_pieces().into_iter().map(|s| s.to_string()).collect())
    }

    fn log_prob(&self, piece: &str) -> Option<f64> { self.table.log_prob(piece) }

    fn __len__(&self) -> usize { self.table.len() }
}

#[pymodule]
fn rustsubword(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<PyBpe>()?;
    m.add_class::<PySegmenter>()?;
    Ok(())
}
