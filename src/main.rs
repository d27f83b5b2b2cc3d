use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use ftext::{Args, FastText, LossKind, ModelKind, QuantizeArgs, SubwordHashes};

#[derive(Parser)]
#[command(about = "fastText-style word embeddings and text classification", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Supervised,
    Skipgram,
    Cbow,
}

#[derive(Clone, Copy, ValueEnum)]
enum LossArg {
    Ns,
    Hs,
    Softmax,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model from a text corpus
    Train(TrainOptions),

    /// Predict labels for lines read from standard input
    Predict {
        /// Binary model file
        model: PathBuf,
        /// Number of labels to report per line
        #[arg(short, default_value_t = 1)]
        k: usize,
        /// Minimum probability for a label to be reported
        #[arg(long, default_value_t = 0.0)]
        threshold: f32,
    },

    /// Evaluate a classifier on a labeled test file
    Test {
        model: PathBuf,
        test_file: PathBuf,
        #[arg(short, default_value_t = 1)]
        k: usize,
        #[arg(long, default_value_t = 0.0)]
        threshold: f32,
    },

    /// Compress a supervised model with product quantization
    Quantize {
        model: PathBuf,
        output: PathBuf,
        /// Keep only this many input rows (0 keeps all)
        #[arg(long, default_value_t = 0)]
        cutoff: usize,
        /// Sub-vector width for the input codebooks
        #[arg(long, default_value_t = 2)]
        dsub: usize,
        /// Quantize row norms separately
        #[arg(long)]
        qnorm: bool,
        /// Also quantize the output matrix
        #[arg(long)]
        qout: bool,
    },

    /// Export word vectors as text
    Vectors {
        model: PathBuf,
        output: PathBuf,
        /// Export the output layer instead of the word vectors
        #[arg(long)]
        output_layer: bool,
    },
}

#[derive(clap::Args)]
struct TrainOptions {
    /// Training corpus, one document or sentence per line
    #[arg(long)]
    input: PathBuf,

    /// Where to write the binary model
    #[arg(long)]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = ModelArg::Supervised)]
    model: ModelArg,

    /// Learning rate; defaults to 0.1 for supervised, 0.05 otherwise
    #[arg(long)]
    lr: Option<f64>,

    /// Embedding dimension
    #[arg(long)]
    dim: Option<usize>,

    /// Context window size
    #[arg(long)]
    ws: Option<usize>,

    #[arg(long)]
    epoch: Option<usize>,

    /// Discard words seen fewer times than this
    #[arg(long)]
    min_count: Option<u32>,

    /// Discard labels seen fewer times than this
    #[arg(long)]
    min_count_label: Option<u32>,

    /// Negative samples per example
    #[arg(long)]
    neg: Option<usize>,

    /// Word n-gram order
    #[arg(long)]
    word_ngrams: Option<usize>,

    #[arg(long, value_enum)]
    loss: Option<LossArg>,

    /// Hash bucket count for subword and word n-gram features
    #[arg(long)]
    bucket: Option<usize>,

    /// Shortest character n-gram; 0 disables subwords
    #[arg(long)]
    minn: Option<usize>,

    /// Longest character n-gram
    #[arg(long)]
    maxn: Option<usize>,

    #[arg(long)]
    thread: Option<usize>,

    /// Subsampling threshold
    #[arg(long)]
    t: Option<f64>,

    /// Prefix that marks label tokens
    #[arg(long)]
    label: Option<String>,
}

impl TrainOptions {
    fn to_args(&self) -> Args {
        let mut args = match self.model {
            ModelArg::Supervised => Args::for_supervised(),
            ModelArg::Skipgram => Args::for_word_vectors(ModelKind::SkipGram),
            ModelArg::Cbow => Args::for_word_vectors(ModelKind::Cbow),
        };
        if let Some(lr) = self.lr {
            args.lr = lr;
        }
        if let Some(dim) = self.dim {
            args.dim = dim;
        }
        if let Some(ws) = self.ws {
            args.ws = ws;
        }
        if let Some(epoch) = self.epoch {
            args.epoch = epoch;
        }
        if let Some(min_count) = self.min_count {
            args.min_count = min_count;
        }
        if let Some(min_count_label) = self.min_count_label {
            args.min_count_label = min_count_label;
        }
        if let Some(neg) = self.neg {
            args.neg = neg;
        }
        if let Some(word_ngrams) = self.word_ngrams {
            args.word_ngrams = word_ngrams;
        }
        if let Some(loss) = self.loss {
            args.loss = match loss {
                LossArg::Ns => LossKind::NegativeSampling,
                LossArg::Hs => LossKind::HierarchicalSoftmax,
                LossArg::Softmax => LossKind::Softmax,
            };
        }
        if let Some(bucket) = self.bucket {
            args.bucket = bucket;
        }
        if self.minn.is_some() || self.maxn.is_some() {
            let minn = self.minn.unwrap_or(args.subwords.min_n());
            let maxn = self.maxn.unwrap_or(args.subwords.max_n());
            args.subwords = if maxn == 0 || minn == 0 {
                SubwordHashes::Empty
            } else {
                SubwordHashes::CharNgrams {
                    min: minn,
                    max: maxn,
                }
            };
        }
        if let Some(thread) = self.thread {
            args.thread = thread;
        }
        if let Some(t) = self.t {
            args.t = t;
        }
        if let Some(label) = &self.label {
            args.label_prefix = label.clone();
        }
        args
    }
}

fn train(opts: &TrainOptions) -> Result<()> {
    let style = ProgressStyle::with_template(
        "{bar:40.cyan/blue} {percent:>3}% {msg}",
    )?;
    let (tx, rx) = mpsc::channel::<ftext::Progress>();
    let reporter = thread::spawn(move || {
        let bar = ProgressBar::new(100).with_style(style);
        for p in rx {
            bar.set_position(p.percent as u64);
            bar.set_message(format!(
                "lr {:.5} loss {:.5} {:.0} words/s eta {}",
                p.learning_rate, p.loss, p.words_per_sec, p.eta
            ));
        }
        bar.finish();
    });

    let result = FastText::train(&opts.input, opts.to_args(), Some(tx));
    let _ = reporter.join();
    let model = result.with_context(|| format!("training on {:?} failed", opts.input))?;
    model.save_model(&opts.output)?;
    Ok(())
}

fn predict(model: &PathBuf, k: usize, threshold: f32) -> Result<()> {
    let model = FastText::load_model(model)?;
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let predictions = model.predict(&line, k, threshold)?;
        let mut first = true;
        for p in predictions {
            if !first {
                print!(" ");
            }
            print!("{} {:.4}", p.label, p.score);
            first = false;
        }
        println!();
    }
    Ok(())
}

fn test(model: &PathBuf, test_file: &PathBuf, k: usize, threshold: f32) -> Result<()> {
    let model = FastText::load_model(model)?;
    let result = model.test(test_file, k, threshold)?;
    println!("N\t{}", result.nexamples);
    println!("P@{}\t{:.3}", result.k, result.precision);
    println!("R@{}\t{:.3}", result.k, result.recall);
    Ok(())
}

fn quantize(
    model_path: &PathBuf,
    output: &PathBuf,
    cutoff: usize,
    dsub: usize,
    qnorm: bool,
    qout: bool,
) -> Result<()> {
    let mut model = FastText::load_model(model_path)?;
    model.quantize(&QuantizeArgs {
        cutoff,
        dsub,
        qnorm,
        qout,
    })?;
    model.save_model(output)?;
    Ok(())
}

fn vectors(model: &PathBuf, output: &PathBuf, output_layer: bool) -> Result<()> {
    let model = FastText::load_model(model)?;
    if output_layer {
        model.save_output(output)?;
    } else {
        model.save_vectors(output)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Command::Train(opts) => train(opts),
        Command::Predict {
            model,
            k,
            threshold,
        } => predict(model, *k, *threshold),
        Command::Test {
            model,
            test_file,
            k,
            threshold,
        } => test(model, test_file, *k, *threshold),
        Command::Quantize {
            model,
            output,
            cutoff,
            dsub,
            qnorm,
            qout,
        } => quantize(model, output, *cutoff, *dsub, *qnorm, *qout),
        Command::Vectors {
            model,
            output,
            output_layer,
        } => vectors(model, output, *output_layer),
    }
}
