//! Training configuration and its binary representation.

use std::io::{Read, Write};
use std::thread;

use crate::binio;
use crate::dictionary;
use crate::error::{Error, Result};

/// Loss strategy selector. Codes match the model file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossKind {
    HierarchicalSoftmax,
    NegativeSampling,
    Softmax,
}

impl LossKind {
    fn code(self) -> i32 {
        match self {
            LossKind::HierarchicalSoftmax => 1,
            LossKind::NegativeSampling => 2,
            LossKind::Softmax => 3,
        }
    }

    fn from_code(code: i32) -> Result<LossKind> {
        match code {
            1 => Ok(LossKind::HierarchicalSoftmax),
            2 => Ok(LossKind::NegativeSampling),
            3 => Ok(LossKind::Softmax),
            other => Err(Error::Configuration(format!("unknown loss code {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Cbow,
    SkipGram,
    Supervised,
}

impl ModelKind {
    fn code(self) -> i32 {
        match self {
            ModelKind::Cbow => 1,
            ModelKind::SkipGram => 2,
            ModelKind::Supervised => 3,
        }
    }

    fn from_code(code: i32) -> Result<ModelKind> {
        match code {
            1 => Ok(ModelKind::Cbow),
            2 => Ok(ModelKind::SkipGram),
            3 => Ok(ModelKind::Supervised),
            other => Err(Error::Configuration(format!("unknown model code {other}"))),
        }
    }
}

/// How subword feature hashes are derived from a `<word>`-wrapped token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubwordHashes {
    /// No subword features; known words use only their own id.
    Empty,
    /// All character n-grams with length in `[min, max]`.
    CharNgrams { min: usize, max: usize },
    /// Only prefixes and suffixes with length in `[min, max)`.
    SuffixPrefix { min: usize, max: usize },
}

impl SubwordHashes {
    pub fn min_n(&self) -> usize {
        match *self {
            SubwordHashes::Empty => 0,
            SubwordHashes::CharNgrams { min, .. } => min,
            SubwordHashes::SuffixPrefix { min, .. } => min,
        }
    }

    pub fn max_n(&self) -> usize {
        match *self {
            SubwordHashes::Empty => 0,
            SubwordHashes::CharNgrams { max, .. } => max,
            SubwordHashes::SuffixPrefix { max, .. } => max,
        }
    }

    /// Raw (un-bucketed) hashes for the subwords of `word`. The word is
    /// expected to already carry its begin/end markers.
    pub fn hashes(&self, word: &str) -> Vec<u32> {
        let chars: Vec<char> = word.chars().collect();
        let mut result = Vec::new();
        match *self {
            SubwordHashes::Empty => {}
            SubwordHashes::CharNgrams { min, max } => {
                if chars.len() < min {
                    return result;
                }
                let end_gram = max.min(chars.len());
                for i in 0..=chars.len() - min {
                    let mut n = min;
                    while i + n <= chars.len() && n <= end_gram {
                        result.push(dictionary::hash_chars(&chars[i..i + n]));
                        n += 1;
                    }
                }
            }
            SubwordHashes::SuffixPrefix { min, max } => {
                if chars.len() < min {
                    return result;
                }
                let end_gram = max.min(chars.len());
                for i in min..end_gram {
                    result.push(dictionary::hash_chars(&chars[..i]));
                }
                for i in chars.len() - end_gram + 1..=chars.len() - min {
                    result.push(dictionary::hash_chars(&chars[i..]));
                }
            }
        }
        result
    }
}

/// Immutable training configuration.
#[derive(Clone, Debug)]
pub struct Args {
    pub lr: f64,
    pub lr_update_rate: u32,
    pub dim: usize,
    /// Context window size for cbow/skip-gram.
    pub ws: usize,
    pub epoch: usize,
    pub min_count: u32,
    pub min_count_label: u32,
    /// Number of negative samples per example.
    pub neg: usize,
    /// Word n-gram order; 1 disables word n-grams.
    pub word_ngrams: usize,
    pub loss: LossKind,
    pub model: ModelKind,
    /// Size of the shared subword/word-ngram bucket space.
    pub bucket: usize,
    pub subwords: SubwordHashes,
    pub thread: usize,
    /// Subsampling threshold.
    pub t: f64,
    pub label_prefix: String,
    pub verbose: i32,
}

fn default_thread_count() -> usize {
    (thread::available_parallelism().map(usize::from).unwrap_or(2) / 2).max(1)
}

impl Default for Args {
    fn default() -> Args {
        Args {
            lr: 0.05,
            lr_update_rate: 100,
            dim: 100,
            ws: 5,
            epoch: 5,
            min_count: 5,
            min_count_label: 0,
            neg: 5,
            word_ngrams: 1,
            loss: LossKind::NegativeSampling,
            model: ModelKind::SkipGram,
            bucket: 2_000_000,
            subwords: SubwordHashes::Empty,
            thread: default_thread_count(),
            t: 1e-4,
            label_prefix: "__label__".to_string(),
            verbose: 2,
        }
    }
}

impl Args {
    /// Preset for skip-gram/cbow word vector training.
    pub fn for_word_vectors(model: ModelKind) -> Args {
        Args {
            model,
            loss: LossKind::NegativeSampling,
            lr: 0.05,
            word_ngrams: 1,
            subwords: SubwordHashes::CharNgrams { min: 3, max: 6 },
            ..Args::default()
        }
    }

    /// Preset for supervised text classification.
    pub fn for_supervised() -> Args {
        Args {
            model: ModelKind::Supervised,
            loss: LossKind::Softmax,
            lr: 0.1,
            word_ngrams: 2,
            subwords: SubwordHashes::Empty,
            ..Args::default()
        }
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        binio::write_i32(w, self.dim as i32)?;
        binio::write_i32(w, self.ws as i32)?;
        binio::write_i32(w, self.epoch as i32)?;
        binio::write_i32(w, self.min_count as i32)?;
        binio::write_i32(w, self.neg as i32)?;
        binio::write_i32(w, self.word_ngrams as i32)?;
        binio::write_i32(w, self.loss.code())?;
        binio::write_i32(w, self.model.code())?;
        binio::write_i32(w, self.bucket as i32)?;
        binio::write_i32(w, self.subwords.min_n() as i32)?;
        binio::write_i32(w, self.subwords.max_n() as i32)?;
        binio::write_i32(w, self.lr_update_rate as i32)?;
        binio::write_f64(w, self.t)?;
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Args> {
        let mut args = Args::default();
        args.dim = binio::read_i32(r)? as usize;
        args.ws = binio::read_i32(r)? as usize;
        args.epoch = binio::read_i32(r)? as usize;
        args.min_count = binio::read_i32(r)? as u32;
        args.neg = binio::read_i32(r)? as usize;
        args.word_ngrams = binio::read_i32(r)? as usize;
        args.loss = LossKind::from_code(binio::read_i32(r)?)?;
        args.model = ModelKind::from_code(binio::read_i32(r)?)?;
        args.bucket = binio::read_i32(r)? as usize;
        let minn = binio::read_i32(r)? as usize;
        let maxn = binio::read_i32(r)? as usize;
        args.lr_update_rate = binio::read_i32(r)? as u32;
        args.t = binio::read_f64(r)?;
        args.subwords = if minn != 0 {
            SubwordHashes::CharNgrams {
                min: minn,
                max: maxn,
            }
        } else {
            SubwordHashes::Empty
        };
        Ok(args)
    }
}

/// Options for post-training quantization.
#[derive(Clone, Copy, Debug)]
pub struct QuantizeArgs {
    /// Also quantize the output matrix.
    pub qout: bool,
    /// Quantize row norms separately, encoding normalized rows.
    pub qnorm: bool,
    /// Keep only this many input rows (0 disables the cutoff).
    pub cutoff: usize,
    /// Sub-vector dimension for the product quantizer.
    pub dsub: usize,
}

impl Default for QuantizeArgs {
    fn default() -> QuantizeArgs {
        QuantizeArgs {
            qout: false,
            qnorm: false,
            cutoff: 0,
            dsub: 2,
        }
    }
}
