use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use dary_heap::OctonaryHeap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::corpus::{Corpus, VocabConfig, WordVocab};
use crate::error::{Result, SubwordError};
use crate::persist;

pub const DEFAULT_END_OF_WORD: &str = "</w>";

type Pair = (u32, u32);

#[derive(Clone, Debug)]
pub struct BpeConfig {
    /// Number of merge iterations to run.
    pub merges: usize,
    /// Symbol appended to every word before merging. `None` disables it.
    pub end_of_word: Option<String>,
}

impl Default for BpeConfig {
    fn default() -> Self {
        Self { merges: 10, end_of_word: Some(DEFAULT_END_OF_WORD.to_string()) }
    }
}

impl BpeConfig {
    fn validate(&self) -> Result<()> {
        if self.end_of_word.as_deref() == Some("") {
            return Err(SubwordError::InvalidConfig("end_of_word marker must not be empty".into()));
        }
        Ok(())
    }
}

/// One learned merge: `left + right -> merged`, with the pair frequency at
/// the moment it was chosen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merge {
    pub left: CompactString,
    pub right: CompactString,
    pub merged: CompactString,
    pub count: u64,
}

/// Interned symbol strings. Ids are handed out in first-seen order.
#[derive(Debug, Default)]
struct SymbolTable {
    symbols: Vec<CompactString>,
    ids: AHashMap<CompactString, u32>,
}

impl SymbolTable {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) { return id; }
        let id = self.symbols.len() as u32;
        self.symbols.push(CompactString::from(s));
        self.ids.insert(CompactString::from(s), id);
        id
    }

    #[inline]
    fn name(&self, id: u32) -> &str { &self.symbols[id as usize] }
}

/// A vocabulary word as its current sequence of symbol ids.
#[derive(Clone, Debug)]
struct Word {
    ids: Vec<u32>,
}

impl Word {
    #[inline]
    fn pairs(&self) -> impl Iterator<Item = Pair> + '_ {
        self.ids.windows(2).map(|w| (w[0], w[1]))
    }

    /// Replace every non-overlapping occurrence of `pair`, left to right,
    /// and return the per-occurrence pair count changes.
    fn merge_pair(&mut self, pair: Pair, new_id: u32) -> Vec<(Pair, i64)> {
        let (a, b) = pair;
        let n = self.ids.len();
        if n < 2 { return Vec::new(); }

        let mut out = Vec::with_capacity(n);
        let mut deltas: Vec<(Pair, i64)> = Vec::with_capacity(6);
        let mut i = 0;

        while i < n {
            if i + 1 < n && self.ids[i] == a && self.ids[i + 1] == b {
                let left = out.last().copied();
                let right = if i + 2 < n { Some(self.ids[i + 2]) } else { None };
                if let Some(x) = left {
                    deltas.push(((x, a), -1));
                    deltas.push(((x, new_id), 1));
                }
                deltas.push(((a, b), -1));
                if let Some(y) = right {
                    deltas.push(((b, y), -1));
                    deltas.push(((new_id, y), 1));
                }
                out.push(new_id);
                i += 2;
            } else {
                out.push(self.ids[i]);
                i += 1;
            }
        }
        self.ids = out;
        deltas
    }
}

#[derive(Debug, Eq)]
struct MergeJob {
    pair: Pair,
    count: u64,
}

impl PartialEq for MergeJob {
    fn eq(&self, other: &Self) -> bool { self.count == other.count && self.pair == other.pair }
}
impl PartialOrd for MergeJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for MergeJob {
    // Max-heap on count; on ties the pair of earlier-introduced symbols wins.
    fn cmp(&self, other: &Self) -> Ordering {
        if self.count != other.count { self.count.cmp(&other.count) }
        else { other.pair.cmp(&self.pair) }
    }
}

fn count_pairs_parallel(words: &[Word], counts: &[u64]) -> (AHashMap<Pair, i64>, AHashMap<Pair, AHashSet<usize>>) {
    words.par_iter().enumerate()
        .map(|(i, w)| {
            let mut local_pc: AHashMap<Pair, i64> = AHashMap::new();
            let mut local_wtu: AHashMap<Pair, AHashSet<usize>> = AHashMap::new();
            if w.ids.len() >= 2 && counts[i] != 0 {
                for pair in w.pairs() {
                    *local_pc.entry(pair).or_default() += counts[i] as i64;
                    local_wtu.entry(pair).or_default().insert(i);
                }
            }
            (local_pc, local_wtu)
        })
        .reduce(
            || (AHashMap::new(), AHashMap::new()),
            |(mut apc, mut awtu), (pc, wtu)| {
                for (k, v) in pc { *apc.entry(k).or_default() += v; }
                for (k, s) in wtu { awtu.entry(k).or_default().extend(s); }
                (apc, awtu)
            },
        )
}

/// Learns merges over a working vocabulary, one iteration per [`step`](Self::step).
pub struct PairMergeBuilder {
    symbols: SymbolTable,
    words: Vec<Word>,
    counts: Vec<u64>,
    pair_counts: AHashMap<Pair, i64>,
    where_to_update: AHashMap<Pair, AHashSet<usize>>,
    heap: OctonaryHeap<MergeJob>,
    merges: Vec<Merge>,
    end_of_word: Option<CompactString>,
}

impl PairMergeBuilder {
    pub fn new(vocab: &WordVocab, config: &BpeConfig) -> Result<Self> {
        config.validate()?;

        let mut entries: Vec<(&str, u64)> = vocab.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

        // Character symbols get ids in ascending character order so that
        // tie-breaking on ids is independent of hash iteration order.
        let alphabet: BTreeSet<char> = entries.iter().flat_map(|(w, _)| w.chars()).collect();
        let mut symbols = SymbolTable::default();
        let mut buf = [0u8; 4];
        for ch in alphabet {
            symbols.intern(ch.encode_utf8(&mut buf));
        }
        let end_of_word = config.end_of_word.as_deref().map(CompactString::from);
        let eow_id = end_of_word.as_deref().map(|m| symbols.intern(m));

        let mut words = Vec::with_capacity(entries.len());
        let mut counts = Vec::with_capacity(entries.len());
        for (w, c) in entries {
            let mut ids: Vec<u32> = Vec::with_capacity(w.len() + 1);
            for ch in w.chars() {
                ids.push(symbols.intern(ch.encode_utf8(&mut buf)));
            }
            ids.extend(eow_id);
            words.push(Word { ids });
            counts.push(c);
        }

        let (pair_counts, where_to_update) = count_pairs_parallel(&words, &counts);
        let mut heap = OctonaryHeap::with_capacity(pair_counts.len());
        for (&pair, &c) in &pair_counts {
            if c > 0 { heap.push(MergeJob { pair, count: c as u64 }); }
        }

        log::info!(
            "pair merge: {} words, {} initial symbols, {} unique pairs",
            words.len(), symbols.symbols.len(), pair_counts.len()
        );

        Ok(Self {
            symbols,
            words,
            counts,
            pair_counts,
            where_to_update,
            heap,
            merges: Vec::new(),
            end_of_word,
        })
    }

    /// Merge the most frequent adjacent pair everywhere it occurs.
    /// Returns `None` once no word has two symbols left.
    pub fn step(&mut self) -> Option<&Merge> {
        loop {
            let mut top = self.heap.pop()?;

            let current = self.pair_counts.get(&top.pair).copied().unwrap_or(0);
            if current <= 0 { continue; }
            if top.count != current as u64 {
                top.count = current as u64;
                self.heap.push(top);
                continue;
            }

            let (a, b) = top.pair;
            let mut merged = CompactString::from(self.symbols.name(a));
            merged.push_str(self.symbols.name(b));
            let new_id = self.symbols.intern(&merged);

            let positions = self.where_to_update.remove(&top.pair).unwrap_or_default();
            let mut touched: AHashSet<Pair> = AHashSet::new();
            for word_idx in positions {
                let changes = self.words[word_idx].merge_pair(top.pair, new_id);
                for (pair, delta) in changes {
                    *self.pair_counts.entry(pair).or_default() += delta * self.counts[word_idx] as i64;
                    if delta > 0 {
                        self.where_to_update.entry(pair).or_default().insert(word_idx);
                        touched.insert(pair);
                    }
                }
            }
            if self.pair_counts.get(&top.pair).is_some_and(|&c| c <= 0) {
                self.pair_counts.remove(&top.pair);
            }

            for pair in touched {
                let cnt = self.pair_counts.get(&pair).copied().unwrap_or(0);
                if cnt > 0 { self.heap.push(MergeJob { pair, count: cnt as u64 }); }
            }

            log::debug!(
                "pair merge: #{} {:?} + {:?} -> {:?} (freq {})",
                self.merges.len() + 1, self.symbols.name(a), self.symbols.name(b), merged, top.count
            );
            self.merges.push(Merge {
                left: CompactString::from(self.symbols.name(a)),
                right: CompactString::from(self.symbols.name(b)),
                merged,
                count: top.count,
            });
            return self.merges.last();
        }
    }

    /// Run up to `n` merge iterations; returns how many were performed.
    pub fn run(&mut self, n: usize) -> usize {
        log::info!("pair merge: {} merges requested", n);
        let mut done = 0usize;
        let mut last_log_percent = 0usize;
        while done < n {
            if self.step().is_none() {
                log::info!("pair merge: no adjacent pairs left, stopping after {} merges", done);
                break;
            }
            done += 1;

            let pct = (done * 100) / n;
            if pct > last_log_percent {
                if let Some(m) = self.merges.last() {
                    log::info!(
                        "pair merge: {}% ({}/{}) {:?} (freq {})",
                        pct, done, n, m.merged, m.count
                    );
                }
                last_log_percent = pct;
            }
        }
        done
    }

    /// Current segmented form of every word (symbols joined by single
    /// spaces) with its count, in word order.
    pub fn working_vocab(&self) -> Vec<(String, u64)> {
        self.words.iter().zip(&self.counts)
            .map(|(w, &c)| {
                let parts: Vec<&str> = w.ids.iter().map(|&id| self.symbols.name(id)).collect();
                (parts.join(" "), c)
            })
            .collect()
    }

    /// Adjacent pair counts recomputed from the working vocabulary.
    pub fn pair_frequencies(&self) -> AHashMap<(CompactString, CompactString), u64> {
        let mut out: AHashMap<(CompactString, CompactString), u64> = AHashMap::new();
        for (w, &c) in self.words.iter().zip(&self.counts) {
            for (a, b) in w.pairs() {
                let key = (CompactString::from(self.symbols.name(a)), CompactString::from(self.symbols.name(b)));
                *out.entry(key).or_default() += c;
            }
        }
        out
    }

    pub fn merges(&self) -> &[Merge] { &self.merges }

    pub fn subword_vocab(&self) -> AHashMap<CompactString, u64> { subword_vocab_of(&self.merges) }

    pub fn finish(self) -> BpeModel { BpeModel::from_merges(self.merges, self.end_of_word) }
}

fn subword_vocab_of(merges: &[Merge]) -> AHashMap<CompactString, u64> {
    let mut out: AHashMap<CompactString, u64> = AHashMap::with_capacity(merges.len());
    for m in merges {
        out.entry(m.merged.clone()).or_insert(m.count);
    }
    out
}

/// Build the word vocabulary from `corpus` and learn `bpe.merges` merges over it.
pub fn learn_bpe(corpus: &Corpus, vocab: &VocabConfig, bpe: &BpeConfig) -> Result<BpeModel> {
    let words = WordVocab::build(corpus, vocab)?;
    let mut builder = PairMergeBuilder::new(&words, bpe)?;
    builder.run(bpe.merges);
    let model = builder.finish();
    log::info!("learn_bpe: done, {} merge rules", model.merges.len());
    Ok(model)
}

/// A learned, ordered merge list that can segment unseen words.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "BpeModelFile", into = "BpeModelFile")]
pub struct BpeModel {
    merges: Vec<Merge>,
    end_of_word: Option<CompactString>,
    ranks: AHashMap<(CompactString, CompactString), usize>,
}

#[derive(Serialize, Deserialize)]
struct BpeModelFile {
    end_of_word: Option<CompactString>,
    merges: Vec<Merge>,
}

impl From<BpeModelFile> for BpeModel {
    fn from(f: BpeModelFile) -> Self { Self::from_merges(f.merges, f.end_of_word) }
}

impl From<BpeModel> for BpeModelFile {
    fn from(m: BpeModel) -> Self { Self { end_of_word: m.end_of_word, merges: m.merges } }
}

impl BpeModel {
    pub fn from_merges(merges: Vec<Merge>, end_of_word: Option<CompactString>) -> Self {
        let mut ranks: AHashMap<(CompactString, CompactString), usize> = AHashMap::with_capacity(merges.len());
        for (rank, m) in merges.iter().enumerate() {
            ranks.entry((m.left.clone(), m.right.clone())).or_insert(rank);
        }
        Self { merges, end_of_word, ranks }
    }

    pub fn merges(&self) -> &[Merge] { &self.merges }

    pub fn end_of_word(&self) -> Option<&str> { self.end_of_word.as_deref() }

    pub fn subword_vocab(&self) -> AHashMap<CompactString, u64> { subword_vocab_of(&self.merges) }

    /// Segment one word by repeatedly applying the earliest learned merge
    /// present. The end-of-word marker is part of the output.
    pub fn encode_word(&self, word: &str) -> Vec<CompactString> {
        if word.is_empty() { return Vec::new(); }
        let mut buf = [0u8; 4];
        let mut syms: Vec<CompactString> = word.chars()
            .map(|ch| CompactString::from(&*ch.encode_utf8(&mut buf)))
            .collect();
        syms.extend(self.end_of_word.clone());

        while syms.len() >= 2 {
            let best = syms.windows(2).enumerate()
                .filter_map(|(i, w)| self.ranks.get(&(w[0].clone(), w[1].clone())).map(|&r| (i, r)))
                .min_by_key(|&(_, r)| r);
            match best {
                None => break,
                Some((idx, _)) => {
                    let right = syms.remove(idx + 1);
                    syms[idx].push_str(&right);
                }
            }
        }
        syms
    }

    /// Whitespace-split `text` and encode every word.
    pub fn encode(&self, text: &str) -> Vec<CompactString> {
        text.split_whitespace().flat_map(|w| self.encode_word(w)).collect()
    }

    pub fn batch_encode<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Vec<Vec<CompactString>> {
        texts.par_iter().map(|t| self.encode(t.as_ref())).collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        persist::save_json(self, path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        persist::load_json(path.as_ref())
    }
}
