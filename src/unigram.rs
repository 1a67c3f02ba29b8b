use std::path::Path;

use ahash::AHashMap;
use compact_str::CompactString;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bpe::BpeModel;
use crate::corpus::{Corpus, VocabConfig, WordVocab};
use crate::error::{Result, SubwordError};
use crate::persist;

/// Static subword -> natural-log probability table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "TableFile", into = "TableFile")]
pub struct SubwordTable {
    log_probs: AHashMap<CompactString, f64>,
    /// Longest piece in characters; bounds the forward-pass scan.
    max_piece_chars: usize,
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    pieces: Vec<(CompactString, f64)>,
}

impl TryFrom<TableFile> for SubwordTable {
    type Error = SubwordError;

    fn try_from(f: TableFile) -> Result<Self> { Self::from_log_probs(f.pieces) }
}

impl From<SubwordTable> for TableFile {
    fn from(t: SubwordTable) -> Self {
        let mut pieces: Vec<(CompactString, f64)> = t.log_probs.into_iter().collect();
        pieces.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Self { pieces }
    }
}

/// Result of segmenting one word.
#[derive(Clone, Debug, PartialEq)]
pub struct Segmentation {
    pieces: Vec<CompactString>,
    nll: f64,
}

impl Segmentation {
    pub fn pieces(&self) -> &[CompactString] { &self.pieces }

    pub fn into_pieces(self) -> Vec<CompactString> { self.pieces }

    /// Negative log-likelihood of the chosen path.
    pub fn nll(&self) -> f64 { self.nll }

    pub fn len(&self) -> usize { self.pieces.len() }

    pub fn is_empty(&self) -> bool { self.pieces.is_empty() }
}

impl SubwordTable {
    /// `ln(count / total)` for every piece. Zero counts and empty pieces are
    /// ignored; repeated pieces accumulate.
    pub fn from_counts<I, S>(counts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut acc: AHashMap<CompactString, u64> = AHashMap::new();
        for (piece, c) in counts {
            let piece = piece.as_ref();
            if c == 0 || piece.is_empty() { continue; }
            *acc.entry(CompactString::from(piece)).or_default() += c;
        }
        let total: u64 = acc.values().sum();
        if total == 0 { return Err(SubwordError::EmptyTable); }

        let ln_total = (total as f64).ln();
        let log_probs = acc.into_iter()
            .map(|(p, c)| (p, (c as f64).ln() - ln_total))
            .collect();
        Ok(Self::with_log_probs(log_probs))
    }

    pub fn from_log_probs<I, S>(pieces: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut log_probs: AHashMap<CompactString, f64> = AHashMap::new();
        for (piece, lp) in pieces {
            let piece = piece.as_ref();
            if piece.is_empty() {
                return Err(SubwordError::InvalidConfig("empty subword in probability table".into()));
            }
            if !lp.is_finite() || lp > 0.0 {
                return Err(SubwordError::InvalidConfig(format!(
                    "log-probability of {:?} must be finite and <= 0, got {}", piece, lp
                )));
            }
            log_probs.insert(CompactString::from(piece), lp);
        }
        if log_probs.is_empty() { return Err(SubwordError::EmptyTable); }
        Ok(Self::with_log_probs(log_probs))
    }

    /// Seed a table from a learned merge list: every merged subword (with the
    /// end-of-word marker stripped) at its merge frequency, plus every
    /// character of `vocab` at its occurrence count.
    pub fn from_bpe(model: &BpeModel, vocab: &WordVocab) -> Result<Self> {
        let mut counts = vocab.char_counts();
        for (sub, c) in model.subword_vocab() {
            let piece = model.end_of_word().and_then(|m| sub.strip_suffix(m)).unwrap_or(&sub);
            if piece.is_empty() { continue; }
            *counts.entry(CompactString::from(piece)).or_default() += c;
        }
        Self::from_counts(counts)
    }

    fn with_log_probs(log_probs: AHashMap<CompactString, f64>) -> Self {
        let max_piece_chars = log_probs.keys().map(|k| k.chars().count()).max().unwrap_or(0);
        Self { log_probs, max_piece_chars }
    }

    pub fn log_prob(&self, piece: &str) -> Option<f64> { self.log_probs.get(piece).copied() }

    pub fn contains(&self, piece: &str) -> bool { self.log_probs.contains_key(piece) }

    pub fn len(&self) -> usize { self.log_probs.len() }

    pub fn is_empty(&self) -> bool { self.log_probs.is_empty() }

    pub fn max_piece_chars(&self) -> usize { self.max_piece_chars }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.log_probs.iter().map(|(p, &lp)| (p.as_str(), lp))
    }

    /// Most likely segmentation of `word` under the unigram assumption.
    ///
    /// Positions are characters. Substrings missing from the table are never
    /// candidates; among equal-likelihood paths the one found first wins.
    pub fn segment(&self, word: &str) -> Result<Segmentation> {
        let offsets: Vec<usize> = word.char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(word.len()))
            .collect();
        let (nll, back) = self.viterbi_forward(word, &offsets);
        Self::viterbi_backward(word, &offsets, &nll, &back)
    }

    /// Best cumulative NLL and best predecessor for every character position.
    fn viterbi_forward(&self, word: &str, offsets: &[usize]) -> (Vec<f64>, Vec<Option<usize>>) {
        let n = offsets.len() - 1;
        let mut nll = vec![f64::INFINITY; n + 1];
        let mut back: Vec<Option<usize>> = vec![None; n + 1];
        nll[0] = 0.0;

        for end in 1..=n {
            // Starts further back than the longest piece can never match.
            for start in end.saturating_sub(self.max_piece_chars)..end {
                if !nll[start].is_finite() { continue; }
                let Some(&lp) = self.log_probs.get(&word[offsets[start]..offsets[end]]) else { continue };
                let score = nll[start] - lp;
                if score < nll[end] {
                    nll[end] = score;
                    back[end] = Some(start);
                }
            }
        }
        (nll, back)
    }

    fn viterbi_backward(
        word: &str,
        offsets: &[usize],
        nll: &[f64],
        back: &[Option<usize>],
    ) -> Result<Segmentation> {
        let n = offsets.len() - 1;
        let mut pieces = Vec::new();
        let mut pos = n;
        while pos > 0 {
            let Some(start) = back[pos] else {
                let position = (0..=n).rev().find(|&i| nll[i].is_finite()).unwrap_or(0);
                return Err(SubwordError::Uncoverable { word: word.to_string(), position });
            };
            pieces.push(CompactString::from(&word[offsets[start]..offsets[pos]]));
            pos = start;
        }
        pieces.reverse();
        Ok(Segmentation { pieces, nll: nll[n] })
    }

    /// Segment every whitespace-delimited word of `text`. The first
    /// uncoverable word, in input order, is the error returned.
    pub fn segment_text(&self, text: &str) -> Result<Vec<Segmentation>> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let results: Vec<Result<Segmentation>> = words.par_iter().map(|w| self.segment(w)).collect();
        results.into_iter().collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        persist::save_json(self, path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        persist::load_json(path.as_ref())
    }
}

#[derive(Clone, Debug)]
pub struct UnigramConfig {
    /// Longest candidate piece, in characters.
    pub max_piece_chars: usize,
    /// Number of segment-and-recount rounds.
    pub iterations: usize,
    /// Keep at most this many multi-character pieces after each round.
    /// Single characters are always kept.
    pub vocab_size: Option<usize>,
}

impl Default for UnigramConfig {
    fn default() -> Self {
        Self { max_piece_chars: 8, iterations: 5, vocab_size: None }
    }
}

impl UnigramConfig {
    fn validate(&self) -> Result<()> {
        if self.max_piece_chars == 0 {
            return Err(SubwordError::InvalidConfig("max_piece_chars must be at least 1".into()));
        }
        if self.vocab_size == Some(0) {
            return Err(SubwordError::InvalidConfig("vocab_size must be at least 1 when set".into()));
        }
        Ok(())
    }
}

/// Hard-EM estimation of a [`SubwordTable`]: segment every vocabulary word
/// with the current table, recount the chosen pieces, rebuild the table.
pub struct UnigramTrainer {
    config: UnigramConfig,
}

impl UnigramTrainer {
    pub fn new(config: UnigramConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Every substring of every word up to `max_piece_chars`, weighted by
    /// word count.
    pub fn seed_counts(&self, vocab: &WordVocab) -> AHashMap<CompactString, u64> {
        let max = self.config.max_piece_chars;
        let words: Vec<(&str, u64)> = vocab.iter().collect();
        words.par_iter()
            .map(|&(w, c)| {
                let mut m: AHashMap<CompactString, u64> = AHashMap::new();
                let offsets: Vec<usize> = w.char_indices().map(|(i, _)| i).chain(std::iter::once(w.len())).collect();
                let n = offsets.len() - 1;
                for start in 0..n {
                    for end in start + 1..=n.min(start + max) {
                        *m.entry(CompactString::from(&w[offsets[start]..offsets[end]])).or_default() += c;
                    }
                }
                m
            })
            .reduce(AHashMap::new, |mut a, b| {
                for (k, v) in b { *a.entry(k).or_default() += v; }
                a
            })
    }

    pub fn train(&self, vocab: &WordVocab) -> Result<SubwordTable> {
        let seed = self.seed_counts(vocab);
        log::info!(
            "unigram em: {} words, {} seed pieces (max_piece_chars={})",
            vocab.len(), seed.len(), self.config.max_piece_chars
        );
        let mut table = SubwordTable::from_counts(seed)?;
        let chars = vocab.char_counts();
        let words: Vec<(&str, u64)> = vocab.iter().collect();

        for round in 1..=self.config.iterations {
            let (counts, corpus_nll) = words.par_iter()
                .map(|&(w, c)| -> Result<(AHashMap<CompactString, u64>, f64)> {
                    let seg = table.segment(w)?;
                    let nll = seg.nll() * c as f64;
                    let mut m: AHashMap<CompactString, u64> = AHashMap::new();
                    for p in seg.into_pieces() { *m.entry(p).or_default() += c; }
                    Ok((m, nll))
                })
                .try_reduce(
                    || (AHashMap::new(), 0.0),
                    |(mut a, an), (b, bn)| {
                        for (k, v) in b { *a.entry(k).or_default() += v; }
                        Ok((a, an + bn))
                    },
                )?;

            let counts = self.prune(counts, &chars);
            table = SubwordTable::from_counts(counts)?;
            log::info!(
                "unigram em: round {}/{} corpus nll {:.3}, {} pieces",
                round, self.config.iterations, corpus_nll, table.len()
            );
        }
        Ok(table)
    }

    /// Keep every character (floor count 1) and, when a size limit is set,
    /// only the most frequent multi-character pieces.
    fn prune(
        &self,
        counts: AHashMap<CompactString, u64>,
        chars: &AHashMap<CompactString, u64>,
    ) -> AHashMap<CompactString, u64> {
        let (singles, mut multi): (Vec<_>, Vec<_>) = counts.into_iter()
            .partition(|(p, _)| p.chars().count() == 1);
        if let Some(limit) = self.config.vocab_size {
            multi.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            multi.truncate(limit);
        }

        let mut out: AHashMap<CompactString, u64> = multi.into_iter().collect();
        out.extend(singles);
        for ch in chars.keys() {
            out.entry(ch.clone()).or_insert(1);
        }
        out
    }
}

/// Build the word vocabulary from `corpus` and estimate a table with EM.
pub fn train_unigram(corpus: &Corpus, vocab: &VocabConfig, config: &UnigramConfig) -> Result<SubwordTable> {
    let words = WordVocab::build(corpus, vocab)?;
    UnigramTrainer::new(config.clone())?.train(&words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpe::{BpeConfig, PairMergeBuilder};

    fn table(pieces: &[(&str, f64)]) -> SubwordTable {
        SubwordTable::from_log_probs(pieces.iter().copied()).unwrap()
    }

    fn strs(seg: &Segmentation) -> Vec<&str> {
        seg.pieces().iter().map(|p| p.as_str()).collect()
    }

    // ---- SubwordTable construction ----

    #[test]
    fn test_from_counts_log_probs() {
        let t = SubwordTable::from_counts([("a", 1), ("b", 3)]).unwrap();
        assert!((t.log_prob("a").unwrap() - 0.25f64.ln()).abs() < 1e-12);
        assert!((t.log_prob("b").unwrap() - 0.75f64.ln()).abs() < 1e-12);
        assert_eq!(t.log_prob("c"), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_from_counts_skips_zero_and_empty() {
        let t = SubwordTable::from_counts([("a", 2), ("b", 0), ("", 5)]).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.log_prob("a"), Some(0.0));
    }

    #[test]
    fn test_from_counts_zero_total() {
        let err = SubwordTable::from_counts([("a", 0)]).unwrap_err();
        assert!(matches!(err, SubwordError::EmptyTable));
    }

    #[test]
    fn test_from_log_probs_rejects_invalid() {
        assert!(SubwordTable::from_log_probs([("a", 0.5)]).is_err());
        assert!(SubwordTable::from_log_probs([("a", f64::NAN)]).is_err());
        assert!(SubwordTable::from_log_probs([("", -1.0)]).is_err());
        assert!(matches!(
            SubwordTable::from_log_probs(Vec::<(&str, f64)>::new()),
            Err(SubwordError::EmptyTable)
        ));
    }

    #[test]
    fn test_max_piece_chars_counts_characters() {
        let t = table(&[("é", -1.0), ("éé", -1.0), ("abc", -1.0)]);
        assert_eq!(t.max_piece_chars(), 3);
    }

    // ---- Viterbi ----

    #[test]
    fn test_segment_prefers_lowest_nll() {
        let t = table(&[("a", -1.0), ("b", -1.0), ("c", -1.0), ("ab", -1.0), ("bc", -0.5)]);
        let seg = t.segment("abc").unwrap();
        assert_eq!(strs(&seg), vec!["a", "bc"]);
        assert!((seg.nll() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_segment_tie_first_found_wins() {
        // "ab" (1.0) and "a"+"b" (0.5 + 0.5) tie; the start-0 candidate is seen first.
        let t = table(&[("ab", -1.0), ("a", -0.5), ("b", -0.5)]);
        assert_eq!(strs(&t.segment("ab").unwrap()), vec!["ab"]);
    }

    #[test]
    fn test_segment_whole_word_piece() {
        let t = table(&[("low", -0.1), ("l", -3.0), ("o", -3.0), ("w", -3.0)]);
        assert_eq!(strs(&t.segment("low").unwrap()), vec!["low"]);
    }

    #[test]
    fn test_segment_empty_word() {
        let t = table(&[("a", -1.0)]);
        let seg = t.segment("").unwrap();
        assert!(seg.is_empty());
        assert_eq!(seg.nll(), 0.0);
    }

    #[test]
    fn test_segment_uncoverable_reports_position() {
        let t = table(&[("a", -1.0), ("ab", -1.0)]);
        match t.segment("abxa") {
            Err(SubwordError::Uncoverable { word, position }) => {
                assert_eq!(word, "abxa");
                assert_eq!(position, 2);
            }
            other => panic!("expected Uncoverable, got {:?}", other),
        }
        assert!(matches!(t.segment("x"), Err(SubwordError::Uncoverable { position: 0, .. })));
    }

    #[test]
    fn test_segment_unicode_by_characters() {
        let t = table(&[("न", -2.0), ("म", -2.0), ("नम", -1.0), ("é", -1.0)]);
        assert_eq!(strs(&t.segment("नमé").unwrap()), vec!["नम", "é"]);
    }

    #[test]
    fn test_segment_text_in_order() {
        let t = table(&[("a", -1.0), ("b", -1.0), ("ab", -0.5)]);
        let segs = t.segment_text(" ab  b a ").unwrap();
        let all: Vec<Vec<&str>> = segs.iter().map(strs).collect();
        assert_eq!(all, vec![vec!["ab"], vec!["b"], vec!["a"]]);
    }

    #[test]
    fn test_segment_text_reports_first_failure() {
        let t = table(&[("a", -1.0)]);
        match t.segment_text("a xa ya") {
            Err(SubwordError::Uncoverable { word, .. }) => assert_eq!(word, "xa"),
            other => panic!("expected Uncoverable, got {:?}", other),
        }
    }

    // ---- seeding from BPE ----

    #[test]
    fn test_from_bpe_strips_marker() {
        let vocab = WordVocab::from_counts([("low", 5), ("lower", 2), ("newest", 6), ("widest", 3)]);
        let mut b = PairMergeBuilder::new(&vocab, &BpeConfig::default()).unwrap();
        b.run(5);
        let model = b.finish();
        let t = SubwordTable::from_bpe(&model, &vocab).unwrap();
        assert!(t.contains("est"));
        assert!(t.contains("low"));
        assert!(!t.contains("est</w>"));
        assert!(t.contains("t"));
        let seg = t.segment("lowest").unwrap();
        assert_eq!(seg.pieces().concat(), "lowest");
    }

    // ---- EM training ----

    #[test]
    fn test_seed_counts_substrings() {
        let trainer = UnigramTrainer::new(UnigramConfig { max_piece_chars: 2, ..UnigramConfig::default() }).unwrap();
        let seed = trainer.seed_counts(&WordVocab::from_counts([("abc", 2)]));
        assert_eq!(seed.get("a"), Some(&2));
        assert_eq!(seed.get("ab"), Some(&2));
        assert_eq!(seed.get("bc"), Some(&2));
        assert_eq!(seed.get("abc"), None);
        assert_eq!(seed.len(), 5);
    }

    #[test]
    fn test_train_keeps_all_characters() {
        let vocab = WordVocab::from_counts([("lower", 2), ("lowest", 3), ("newer", 4), ("wider", 1)]);
        let cfg = UnigramConfig { max_piece_chars: 4, iterations: 3, vocab_size: Some(3) };
        let t = UnigramTrainer::new(cfg).unwrap().train(&vocab).unwrap();
        for ch in ["l", "o", "w", "e", "r", "s", "t", "n", "i", "d"] {
            assert!(t.contains(ch), "missing character {ch}");
        }
        let multi = t.iter().filter(|(p, _)| p.chars().count() > 1).count();
        assert!(multi <= 3);
        for (w, _) in vocab.iter() {
            assert_eq!(t.segment(w).unwrap().pieces().concat(), w);
        }
    }

    #[test]
    fn test_train_zero_iterations_is_seed_table() {
        let vocab = WordVocab::from_counts([("ab", 1)]);
        let cfg = UnigramConfig { max_piece_chars: 2, iterations: 0, vocab_size: None };
        let t = UnigramTrainer::new(cfg).unwrap().train(&vocab).unwrap();
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_train_empty_vocab_errors() {
        let err = UnigramTrainer::new(UnigramConfig::default()).unwrap().train(&WordVocab::default()).unwrap_err();
        assert!(matches!(err, SubwordError::EmptyTable));
    }

    #[test]
    fn test_trainer_rejects_invalid_config() {
        assert!(UnigramTrainer::new(UnigramConfig { max_piece_chars: 0, ..UnigramConfig::default() }).is_err());
        assert!(UnigramTrainer::new(UnigramConfig { vocab_size: Some(0), ..UnigramConfig::default() }).is_err());
    }

    #[test]
    fn test_train_unigram_from_corpus() {
        let corpus = Corpus::from_lines(["the cat sat", "the cat ran", "a cat"]);
        let t = train_unigram(&corpus, &VocabConfig::default(), &UnigramConfig::default()).unwrap();
        assert_eq!(strs(&t.segment("cat").unwrap()), vec!["cat"]);
    }

    #[test]
    fn test_table_save_load() {
        let t = table(&[("a", -1.0), ("bc", -0.25)]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        t.save(&path).unwrap();
        let loaded = SubwordTable::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.log_prob("bc"), Some(-0.25));
        assert_eq!(loaded.max_piece_chars(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Exhaustive minimum NLL over all segmentations, for short words.
        fn brute_force_nll(t: &SubwordTable, chars: &[char]) -> f64 {
            if chars.is_empty() { return 0.0; }
            let mut best = f64::INFINITY;
            for k in 1..=chars.len() {
                let head: String = chars[..k].iter().collect();
                if let Some(lp) = t.log_prob(&head) {
                    best = best.min(-lp + brute_force_nll(t, &chars[k..]));
                }
            }
            best
        }

        fn covering_table() -> impl Strategy<Value = SubwordTable> {
            (
                prop::collection::vec(1u64..20, 5),
                prop::collection::vec(("[a-e]{2,4}", 1u64..20), 0..12),
            )
                .prop_map(|(char_counts, extra)| {
                    let chars = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).zip(char_counts);
                    SubwordTable::from_counts(chars.chain(extra)).unwrap()
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn prop_segment_reproduces_word(t in covering_table(), word in "[a-e]{0,12}") {
                let seg = t.segment(&word).unwrap();
                prop_assert_eq!(seg.pieces().concat(), word.clone());
                prop_assert_eq!(seg.is_empty(), word.is_empty());
                prop_assert!(seg.pieces().iter().all(|p| !p.is_empty() && t.contains(p)));
            }

            #[test]
            fn prop_nll_is_sum_of_pieces(t in covering_table(), word in "[a-e]{1,12}") {
                let seg = t.segment(&word).unwrap();
                let sum: f64 = seg.pieces().iter().map(|p| -t.log_prob(p).unwrap()).sum();
                prop_assert!((seg.nll() - sum).abs() < 1e-9);
            }

            #[test]
            fn prop_segment_is_optimal(t in covering_table(), word in "[a-e]{1,7}") {
                let chars: Vec<char> = word.chars().collect();
                let seg = t.segment(&word).unwrap();
                prop_assert!((seg.nll() - brute_force_nll(&t, &chars)).abs() < 1e-9);
            }
        }
    }
}
