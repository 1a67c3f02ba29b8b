use std::fs;
use std::path::Path;

use ahash::AHashMap;
use compact_str::CompactString;
use fancy_regex::Regex;
use rayon::prelude::*;

use crate::error::{Result, SubwordError};

/// An ordered sequence of text lines, loaded once.
#[derive(Clone, Debug, Default)]
pub struct Corpus {
    lines: Vec<String>,
}

impl Corpus {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| SubwordError::io(path, e))?;
        let corpus = Self::from_lines(text.lines());
        log::info!("corpus: loaded {} lines from {}", corpus.len(), path.display());
        Ok(corpus)
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { lines: lines.into_iter().map(Into::into).collect() }
    }

    pub fn lines(&self) -> &[String] { &self.lines }

    pub fn len(&self) -> usize { self.lines.len() }

    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
}

/// How lines are cut into words before counting.
#[derive(Clone, Debug)]
pub struct VocabConfig {
    /// Words seen fewer times than this are dropped.
    pub min_count: u64,
    pub lowercase: bool,
    /// Every match of this pattern is a word. `None` splits on whitespace.
    pub pattern: Option<String>,
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self { min_count: 1, lowercase: false, pattern: None }
    }
}

impl VocabConfig {
    fn validate(&self) -> Result<()> {
        if self.min_count == 0 {
            return Err(SubwordError::InvalidConfig("min_count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Word -> occurrence count, filtered by a minimum count.
#[derive(Clone, Debug, Default)]
pub struct WordVocab {
    counts: AHashMap<CompactString, u64>,
}

impl WordVocab {
    pub fn build(corpus: &Corpus, config: &VocabConfig) -> Result<Self> {
        config.validate()?;
        let pattern = config.pattern.as_deref().map(Regex::new).transpose()?;
        let lowercase = config.lowercase;

        let mut counts: AHashMap<CompactString, u64> = corpus.lines.par_iter()
            .map(|line| {
                let mut m: AHashMap<CompactString, u64> = AHashMap::new();
                for w in words_in(line, pattern.as_ref()) {
                    let key = if lowercase { CompactString::from(w.to_lowercase()) } else { CompactString::from(w) };
                    *m.entry(key).or_default() += 1;
                }
                m
            })
            .reduce(AHashMap::new, |mut a, b| {
                for (k, v) in b { *a.entry(k).or_default() += v; }
                a
            });

        let unique = counts.len();
        counts.retain(|_, c| *c >= config.min_count);
        log::info!(
            "word vocab: {} unique words, {} kept with min_count={}",
            unique, counts.len(), config.min_count
        );
        Ok(Self { counts })
    }

    /// Build directly from (word, count) pairs. Zero counts and empty words
    /// are skipped; repeated words accumulate.
    pub fn from_counts<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut counts: AHashMap<CompactString, u64> = AHashMap::new();
        for (w, c) in pairs {
            let w = w.as_ref();
            if c == 0 || w.is_empty() { continue; }
            *counts.entry(CompactString::from(w)).or_default() += c;
        }
        Self { counts }
    }

    pub fn count(&self, word: &str) -> Option<u64> { self.counts.get(word).copied() }

    pub fn len(&self) -> usize { self.counts.len() }

    pub fn is_empty(&self) -> bool { self.counts.is_empty() }

    pub fn total_count(&self) -> u64 { self.counts.values().sum() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.counts.iter().map(|(w, &c)| (w.as_str(), c))
    }

    /// Count descending, then word ascending.
    pub fn sorted(&self) -> Vec<(&str, u64)> {
        let mut out: Vec<(&str, u64)> = self.iter().collect();
        out.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out
    }

    /// Occurrences of every single character, weighted by word count.
    pub fn char_counts(&self) -> AHashMap<CompactString, u64> {
        let mut out: AHashMap<CompactString, u64> = AHashMap::new();
        let mut buf = [0u8; 4];
        for (w, &c) in &self.counts {
            for ch in w.chars() {
                *out.entry(CompactString::from(&*ch.encode_utf8(&mut buf))).or_default() += c;
            }
        }
        out
    }
}

fn words_in<'a>(line: &'a str, pattern: Option<&Regex>) -> Vec<&'a str> {
    match pattern {
        None => line.split_whitespace().collect(),
        Some(re) => re.find_iter(line)
            .filter_map(|m| match m {
                Ok(mat) => Some(mat.as_str()),
                Err(e) => { log::warn!("word vocab: regex error, skipping match: {}", e); None }
            })
            .filter(|w| !w.is_empty())
            .collect(),
    }
}
