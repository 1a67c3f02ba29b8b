use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::Env;
use log::{info, LevelFilter};
use rustsubword::{
    BpeConfig, BpeModel, Corpus, PairMergeBuilder, SubwordTable, UnigramConfig, UnigramTrainer,
    VocabConfig, WordVocab, DEFAULT_END_OF_WORD,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Subword vocabulary toolkit", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the word vocabulary of a corpus
    Vocab(VocabArgs),
    /// Learn pair merges from a corpus
    Bpe(BpeArgs),
    /// Segment words with a saved merge model
    Encode(EncodeArgs),
    /// Estimate a subword probability table with EM
    Unigram(UnigramArgs),
    /// Segment words with a saved probability table
    Segment(SegmentArgs),
}

#[derive(Args, Debug)]
struct CorpusArgs {
    /// Text file, one sentence per line
    #[arg(short, long, value_name = "PATH")]
    corpus: PathBuf,

    /// Drop words seen fewer times than this
    #[arg(long, value_name = "COUNT", default_value_t = 1)]
    min_count: u64,

    /// Lowercase words before counting
    #[arg(long)]
    lowercase: bool,

    /// Regex whose matches are words (default: whitespace split)
    #[arg(long, value_name = "REGEX")]
    pattern: Option<String>,
}

impl CorpusArgs {
    fn vocab_config(&self) -> VocabConfig {
        VocabConfig { min_count: self.min_count, lowercase: self.lowercase, pattern: self.pattern.clone() }
    }

    fn load_vocab(&self) -> Result<WordVocab> {
        let corpus = Corpus::from_path(&self.corpus)
            .with_context(|| format!("failed to read corpus {}", self.corpus.display()))?;
        WordVocab::build(&corpus, &self.vocab_config()).context("failed to build word vocabulary")
    }
}

#[derive(Args, Debug)]
struct VocabArgs {
    #[command(flatten)]
    input: CorpusArgs,

    /// Only print the most frequent words
    #[arg(long, value_name = "K")]
    top: Option<usize>,
}

#[derive(Args, Debug)]
struct BpeArgs {
    #[command(flatten)]
    input: CorpusArgs,

    /// Number of merge iterations
    #[arg(short = 'n', long, value_name = "N", default_value_t = 10)]
    merges: usize,

    /// End-of-word marker symbol
    #[arg(long, value_name = "SYMBOL", default_value = DEFAULT_END_OF_WORD)]
    end_of_word: String,

    /// Do not append an end-of-word marker
    #[arg(long, conflicts_with = "end_of_word")]
    no_end_of_word: bool,

    /// Print the working vocabulary after the last merge
    #[arg(long)]
    show_vocab: bool,

    /// Write the learned model as JSON
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Model written by `bpe --output`
    #[arg(short, long, value_name = "PATH")]
    model: PathBuf,

    /// Words to segment
    #[arg(required = true)]
    words: Vec<String>,
}

#[derive(Args, Debug)]
struct UnigramArgs {
    #[command(flatten)]
    input: CorpusArgs,

    /// EM rounds
    #[arg(long, value_name = "N", default_value_t = 5)]
    iterations: usize,

    /// Longest candidate piece in characters
    #[arg(long, value_name = "N", default_value_t = 8)]
    max_piece_chars: usize,

    /// Keep at most this many multi-character pieces
    #[arg(long, value_name = "SIZE")]
    vocab_size: Option<usize>,

    /// Print the most probable pieces
    #[arg(long, value_name = "K", default_value_t = 20)]
    top: usize,

    /// Write the table as JSON
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SegmentArgs {
    /// Table written by `unigram --output`
    #[arg(short, long, value_name = "PATH")]
    table: PathBuf,

    /// Words to segment
    #[arg(required = true)]
    words: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Vocab(args) => run_vocab(args),
        Commands::Bpe(args) => run_bpe(args),
        Commands::Encode(args) => run_encode(args),
        Commands::Unigram(args) => run_unigram(args),
        Commands::Segment(args) => run_segment(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = if quiet > 0 {
        match quiet {
            1 => LevelFilter::Warn,
            _ => LevelFilter::Error,
        }
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.filter_level(level);
    let _ = builder.try_init();
}

fn run_vocab(args: VocabArgs) -> Result<()> {
    let vocab = args.input.load_vocab()?;
    let sorted = vocab.sorted();
    let limit = args.top.unwrap_or(sorted.len());
    for (word, count) in sorted.into_iter().take(limit) {
        println!("{count}\t{word}");
    }
    Ok(())
}

fn run_bpe(args: BpeArgs) -> Result<()> {
    let vocab = args.input.load_vocab()?;
    let config = BpeConfig {
        merges: args.merges,
        end_of_word: (!args.no_end_of_word).then(|| args.end_of_word.clone()),
    };
    let mut builder = PairMergeBuilder::new(&vocab, &config).context("invalid merge configuration")?;
    let done = builder.run(config.merges);
    info!("learned {done} of {} requested merges", config.merges);

    for (i, m) in builder.merges().iter().enumerate() {
        println!("{}\t{} {}\t-> {}\t{}", i + 1, m.left, m.right, m.merged, m.count);
    }
    if args.show_vocab {
        for (segmented, count) in builder.working_vocab() {
            println!("{count}\t{segmented}");
        }
    }

    let model = builder.finish();
    if let Some(path) = args.output {
        model.save(&path).with_context(|| format!("failed to write model {}", path.display()))?;
    }
    Ok(())
}

fn run_encode(args: EncodeArgs) -> Result<()> {
    let model = BpeModel::load(&args.model)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    for word in &args.words {
        println!("{word}\t{}", model.encode_word(word).join(" "));
    }
    Ok(())
}

fn run_unigram(args: UnigramArgs) -> Result<()> {
    let vocab = args.input.load_vocab()?;
    let config = UnigramConfig {
        max_piece_chars: args.max_piece_chars,
        iterations: args.iterations,
        vocab_size: args.vocab_size,
    };
    let table = UnigramTrainer::new(config)
        .context("invalid unigram configuration")?
        .train(&vocab)
        .context("unigram training failed")?;

    let mut pieces: Vec<(&str, f64)> = table.iter().collect();
    pieces.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    for (piece, lp) in pieces.into_iter().take(args.top) {
        println!("{lp:.4}\t{piece}");
    }

    if let Some(path) = args.output {
        table.save(&path).with_context(|| format!("failed to write table {}", path.display()))?;
    }
    Ok(())
}

fn run_segment(args: SegmentArgs) -> Result<()> {
    let table = SubwordTable::load(&args.table)
        .with_context(|| format!("failed to load table {}", args.table.display()))?;
    for word in &args.words {
        let seg = table.segment(word).with_context(|| format!("cannot segment {word:?}"))?;
        println!("{word}\t{}\t{:.4}", seg.pieces().join(" "), seg.nll());
    }
    Ok(())
}
