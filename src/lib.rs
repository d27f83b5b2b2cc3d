//! Word and subword embeddings with a fastText-style trainer.
//!
//! The crate trains three model families over a shared shallow network:
//! `skipgram` and `cbow` word embeddings, and `supervised` text
//! classification. Words are augmented with hashed character n-grams so
//! out-of-vocabulary words still get vectors. Training runs lock-free
//! over shared matrices from multiple threads.
//!
//! ```no_run
//! use ftext::{Args, FastText};
//!
//! # fn main() -> ftext::Result<()> {
//! let args = Args::for_supervised();
//! let model = FastText::train("corpus.txt".as_ref(), args, None)?;
//! let predictions = model.predict("some text to classify", 1, 0.0)?;
//! # Ok(())
//! # }
//! ```

pub mod args;
mod binio;
pub mod corpus;
pub mod dictionary;
pub mod error;
pub mod loss;
pub mod math;
pub mod model;
pub mod quant;
pub mod trainer;

mod fasttext;

pub use args::{Args, LossKind, ModelKind, QuantizeArgs, SubwordHashes};
pub use error::{Error, Result};
pub use fasttext::{EvaluationResult, FastText, Prediction};
pub use trainer::Progress;
