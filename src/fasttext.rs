//! High-level handle over a trained model: training entry point, binary
//! model IO, quantization, prediction and vector extraction.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::info;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::args::{Args, ModelKind, QuantizeArgs};
use crate::binio;
use crate::dictionary::{self, Dictionary, EntryKind};
use crate::error::{Error, Result};
use crate::math::{Matrix, Vector};
use crate::model::{Model, Rows};
use crate::quant::QuantMatrix;
use crate::trainer::{Progress, Trainer};

const MAGIC: i32 = 793_712_314;
const VERSION: i32 = 11;

/// One ranked prediction; `score` is a probability.
#[derive(Clone, Debug)]
pub struct Prediction {
    pub label: String,
    pub score: f32,
}

/// Aggregate precision/recall at `k` over a labeled test file.
#[derive(Clone, Copy, Debug)]
pub struct EvaluationResult {
    pub nexamples: u64,
    pub precision: f64,
    pub recall: f64,
    pub k: usize,
}

pub struct FastText {
    args: Arc<Args>,
    dict: Dictionary,
    input: Rows,
    output: Rows,
    model: Model,
}

impl FastText {
    /// Builds the dictionary from `corpus`, initializes the matrices
    /// and runs multi-threaded training.
    pub fn train(
        corpus: &Path,
        args: Args,
        progress: Option<Sender<Progress>>,
    ) -> Result<FastText> {
        let args = Arc::new(args);
        let dict = Dictionary::build_from_file(corpus, args.clone())?;

        let mut wi = Matrix::new(dict.nwords() + args.bucket, args.dim);
        wi.uniform(1.0 / args.dim as f32);
        let osz = match args.model {
            ModelKind::Supervised => dict.nlabels(),
            _ => dict.nwords(),
        };
        if osz == 0 {
            return Err(Error::Configuration(match args.model {
                ModelKind::Supervised => "corpus contains no labels".to_string(),
                _ => "corpus contains no words above the count threshold".to_string(),
            }));
        }
        let wo = Matrix::new(osz, args.dim);
        let wi = Arc::new(wi);
        let wo = Arc::new(wo);

        Trainer::new(&dict, wi.clone(), wo.clone(), args.clone()).train(corpus, progress)?;
        FastText::assemble(args, dict, Rows::Dense(wi), Rows::Dense(wo))
    }

    fn assemble(args: Arc<Args>, dict: Dictionary, input: Rows, output: Rows) -> Result<FastText> {
        let counts = match args.model {
            ModelKind::Supervised => dict.counts(EntryKind::Label),
            _ => dict.counts(EntryKind::Word),
        };
        let model = Model::with_rows(input.clone(), output.clone(), args.clone(), &counts, 0)?;
        Ok(FastText {
            args,
            dict,
            input,
            output,
            model,
        })
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.input, Rows::Quantized(_))
    }

    pub fn labels(&self) -> Vec<String> {
        self.dict.labels()
    }

    pub fn word_id(&self, word: &str) -> i32 {
        self.dict.get_id(word)
    }

    /// Embedding row of a raw subword string, independent of the
    /// vocabulary.
    pub fn subword_id(&self, subword: &str) -> usize {
        self.dict.nwords() + (dictionary::hash(subword) as usize % self.args.bucket)
    }

    fn save_rows<W: Write>(rows: &Rows, w: &mut W) -> Result<()> {
        match rows {
            Rows::Dense(m) => {
                binio::write_bool(w, false)?;
                m.save(w)
            }
            Rows::Quantized(q) => {
                binio::write_bool(w, true)?;
                q.save(w)
            }
        }
    }

    fn load_rows<R: Read>(r: &mut R) -> Result<Rows> {
        if binio::read_bool(r)? {
            Ok(Rows::Quantized(Arc::new(QuantMatrix::load(r)?)))
        } else {
            Ok(Rows::Dense(Arc::new(Matrix::load(r)?)))
        }
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        binio::write_i32(w, MAGIC)?;
        binio::write_i32(w, VERSION)?;
        self.args.save(w)?;
        self.dict.save(w)?;
        Self::save_rows(&self.input, w)?;
        Self::save_rows(&self.output, w)?;
        Ok(())
    }

    pub fn save_model(&self, path: &Path) -> Result<()> {
        info!("saving model to {:?}", path);
        let mut w = BufWriter::new(File::create(path)?);
        self.save(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<FastText> {
        let magic = binio::read_i32(r)?;
        if magic != MAGIC {
            return Err(Error::Configuration(format!(
                "bad magic number {magic}; not a model file"
            )));
        }
        let version = binio::read_i32(r)?;
        if version != VERSION {
            return Err(Error::Configuration(format!(
                "unsupported model version {version}; expected {VERSION}"
            )));
        }
        let args = Arc::new(Args::load(r)?);
        let dict = Dictionary::load(r, args.clone())?;
        let input = Self::load_rows(r)?;
        let output = Self::load_rows(r)?;
        FastText::assemble(args, dict, input, output)
    }

    pub fn load_model(path: &Path) -> Result<FastText> {
        info!("loading model from {:?}", path);
        let mut r = BufReader::new(File::open(path)?);
        FastText::load(&mut r)
    }

    /// The `cutoff - 1` input rows with the largest L2 norms, with the
    /// end-of-sentence row always appended.
    fn select_embeddings(&self, cutoff: usize) -> Result<Vec<u32>> {
        let input = match &self.input {
            Rows::Dense(m) => m,
            Rows::Quantized(_) => {
                return Err(Error::Argument(
                    "model is already quantized".to_string(),
                ))
            }
        };
        let eos_id = self.dict.get_id(dictionary::EOS);
        let mut idx: Vec<u32> = (0..input.rows() as u32)
            .filter(|&i| i as i32 != eos_id)
            .collect();
        idx.sort_by_key(|&i| Reverse(OrderedFloat(input.l2_norm_row(i as usize))));
        idx.truncate(cutoff.saturating_sub(1));
        if eos_id >= 0 {
            idx.push(eos_id as u32);
        }
        Ok(idx)
    }

    /// Replaces the dense matrices with product-quantized ones. With a
    /// cutoff, low-norm embedding rows are pruned from the dictionary
    /// first.
    pub fn quantize(&mut self, qargs: &QuantizeArgs) -> Result<()> {
        if self.args.model != ModelKind::Supervised {
            return Err(Error::Argument(
                "only supervised models can be quantized".to_string(),
            ));
        }
        let input = match &self.input {
            Rows::Dense(m) => m.clone(),
            Rows::Quantized(_) => {
                return Err(Error::Argument(
                    "model is already quantized".to_string(),
                ))
            }
        };

        let input = if qargs.cutoff > 0 && qargs.cutoff < input.rows() {
            let idx = self.select_embeddings(qargs.cutoff)?;
            let kept = self.dict.prune(&idx);
            let pruned = Matrix::new(kept.len(), self.args.dim);
            let mut row = vec![0.0f32; self.args.dim];
            for (new_row, &old_row) in kept.iter().enumerate() {
                input.copy_row(old_row as usize, &mut row);
                for (j, &v) in row.iter().enumerate() {
                    pruned.set(new_row, j, v);
                }
            }
            Arc::new(pruned)
        } else {
            input
        };

        info!("quantizing {} input rows", input.rows());
        self.input = Rows::Quantized(Arc::new(QuantMatrix::quantize(
            &input,
            qargs.dsub,
            qargs.qnorm,
        )?));
        if qargs.qout {
            if let Rows::Dense(out) = &self.output {
                self.output =
                    Rows::Quantized(Arc::new(QuantMatrix::quantize(out, 2, qargs.qnorm)?));
            }
        }

        let counts = self.dict.counts(EntryKind::Label);
        self.model = Model::with_rows(
            self.input.clone(),
            self.output.clone(),
            self.args.clone(),
            &counts,
            0,
        )?;
        Ok(())
    }

    /// Top-`k` labels for one line of text, with probability scores.
    pub fn predict(&self, line: &str, k: usize, threshold: f32) -> Result<Vec<Prediction>> {
        let mut words = Vec::new();
        let mut labels = Vec::new();
        self.dict.line_to_features(line, &mut words, &mut labels);
        let ranked = self.model.predict(&words, k, threshold)?;
        ranked
            .into_iter()
            .map(|(log_prob, id)| {
                Ok(Prediction {
                    label: self.dict.label(id)?.to_string(),
                    score: log_prob.exp(),
                })
            })
            .collect()
    }

    /// Runs `hook(gold label ids, ranked predictions)` for every
    /// labeled example in `path`.
    pub fn test_with<F>(&self, path: &Path, k: usize, threshold: f32, mut hook: F) -> Result<()>
    where
        F: FnMut(&[u32], &[Prediction]),
    {
        let reader = BufReader::new(File::open(path)?);
        let mut words = Vec::new();
        let mut labels = Vec::new();
        for line in reader.lines() {
            let line = line?;
            words.clear();
            labels.clear();
            self.dict.line_to_features(&line, &mut words, &mut labels);
            if labels.is_empty() || words.is_empty() {
                continue;
            }
            let predictions = self.predict(&line, k, threshold)?;
            hook(&labels, &predictions);
        }
        Ok(())
    }

    /// Precision and recall at `k` over a labeled test file.
    pub fn test(&self, path: &Path, k: usize, threshold: f32) -> Result<EvaluationResult> {
        let mut nexamples = 0u64;
        let mut correct = 0u64;
        let mut gold_total = 0u64;
        self.test_with(path, k, threshold, |gold, predictions| {
            nexamples += 1;
            gold_total += gold.len() as u64;
            for p in predictions {
                let hit = gold.iter().any(|&g| {
                    self.dict
                        .label(g as usize)
                        .map(|l| l == p.label)
                        .unwrap_or(false)
                });
                if hit {
                    correct += 1;
                }
            }
        })?;
        Ok(EvaluationResult {
            nexamples,
            precision: correct as f64 / (nexamples * k as u64).max(1) as f64,
            recall: correct as f64 / gold_total.max(1) as f64,
            k,
        })
    }

    /// Mean of the subword embedding rows of `word`. Out-of-vocabulary
    /// words fall back to their character n-grams.
    pub fn word_vector(&self, word: &str) -> Vector {
        let subwords = self.dict.subwords_of(word);
        let mut vec = Vector::zeros(self.args.dim);
        if subwords.is_empty() {
            return vec;
        }
        for &i in &subwords {
            self.input.add_row_to(&mut vec, i as usize);
        }
        vec.scale(1.0 / subwords.len() as f32);
        vec
    }

    /// Embedding row of a single raw subword string.
    pub fn subword_vector(&self, subword: &str) -> Vector {
        let mut vec = Vector::zeros(self.args.dim);
        self.input.add_row_to(&mut vec, self.subword_id(subword));
        vec
    }

    /// Pooled vector for a whole line. Supervised models average the
    /// feature rows; word models average the per-token word vectors,
    /// each normalized to unit length.
    pub fn sentence_vector(&self, line: &str) -> Vector {
        let mut vec = Vector::zeros(self.args.dim);
        if self.args.model == ModelKind::Supervised {
            let mut words = Vec::new();
            let mut labels = Vec::new();
            self.dict.line_to_features(line, &mut words, &mut labels);
            if words.is_empty() {
                return vec;
            }
            for &w in &words {
                self.input.add_row_to(&mut vec, w as usize);
            }
            vec.scale(1.0 / words.len() as f32);
            return vec;
        }
        let mut count = 0usize;
        for token in crate::corpus::tokenize(line) {
            let mut wv = self.word_vector(token);
            let norm = wv.norm();
            if norm > 0.0 {
                wv.scale(1.0 / norm);
                vec.add_vector(&wv);
                count += 1;
            }
        }
        if count > 0 {
            vec.scale(1.0 / count as f32);
        }
        vec
    }

    /// Bag-of-features vectors for a batch of lines: in-vocabulary word
    /// rows plus their word n-gram rows, mean pooled. Subsampling uses
    /// a fixed seed so repeated calls agree.
    pub fn text_vectors(&self, lines: &[String]) -> Vec<Vector> {
        let mut rng = StdRng::seed_from_u64(0);
        lines
            .iter()
            .map(|line| {
                let mut ids = Vec::new();
                self.dict.line_to_word_ids(line, &mut ids, &mut rng);
                self.dict.add_line_ngram_hashes(&mut ids, self.args.word_ngrams);
                let mut vec = Vector::zeros(self.args.dim);
                if !ids.is_empty() {
                    for &i in &ids {
                        self.input.add_row_to(&mut vec, i as usize);
                    }
                    vec.scale(1.0 / ids.len() as f32);
                }
                vec
            })
            .collect()
    }

    /// Writes word vectors as text: a `rows dim` header line, then one
    /// word per line followed by its components.
    pub fn save_vectors(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "{} {}", self.dict.nwords(), self.args.dim)?;
        for i in 0..self.dict.nwords() {
            let word = self.dict.word(i);
            let vec = self.word_vector(word);
            write!(w, "{word}")?;
            for v in vec.as_slice() {
                write!(w, " {v:.6}")?;
            }
            writeln!(w)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Writes output-layer vectors as text, one row per word or label.
    pub fn save_output(&self, path: &Path) -> Result<()> {
        let osz = self.model.osz();
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "{} {}", osz, self.args.dim)?;
        let mut vec = Vector::zeros(self.args.dim);
        for i in 0..osz {
            let name = match self.args.model {
                ModelKind::Supervised => self.dict.label(i)?,
                _ => self.dict.word(i),
            };
            for v in vec.as_mut_slice() {
                *v = 0.0;
            }
            self.output.add_row_to(&mut vec, i);
            write!(w, "{name}")?;
            for v in vec.as_slice() {
                write!(w, " {v:.6}")?;
            }
            writeln!(w)?;
        }
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn select_embeddings_prefers_large_norms_and_keeps_eos() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..3 {
            writeln!(f, "__label__a bir iki üç").unwrap();
        }
        let mut args = Args::for_supervised();
        args.min_count = 1;
        args.bucket = 50;
        args.dim = 4;
        let args = Arc::new(args);
        let dict = Dictionary::build_from_file(f.path(), args.clone()).unwrap();
        let rows = dict.nwords() + args.bucket;
        let wi = Matrix::new(rows, args.dim);
        // Give rows distinct, increasing norms.
        for i in 0..rows {
            wi.set(i, 0, i as f32);
        }
        let wo = Matrix::new(dict.nlabels(), args.dim);
        let ft = FastText::assemble(
            args,
            dict,
            Rows::Dense(Arc::new(wi)),
            Rows::Dense(Arc::new(wo)),
        )
        .unwrap();

        let idx = ft.select_embeddings(4).unwrap();
        assert_eq!(idx.len(), 4);
        let eos_id = ft.dict.get_id(dictionary::EOS) as u32;
        assert_eq!(*idx.last().unwrap(), eos_id);
        // Highest-norm rows come first, never the EOS row twice.
        assert_eq!(idx[0], rows as u32 - 1);
        assert_eq!(idx[1], rows as u32 - 2);
        assert!(!idx[..3].contains(&eos_id));
    }

    #[test]
    fn load_rejects_supervised_model_without_labels() {
        use crate::args::LossKind;

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "elma armut elma").unwrap();
        let mut args = Args::for_supervised();
        args.loss = LossKind::HierarchicalSoftmax;
        args.min_count = 1;
        args.bucket = 10;
        args.dim = 4;
        let args = Arc::new(args);
        let dict = Dictionary::build_from_file(f.path(), args.clone()).unwrap();
        assert_eq!(dict.nlabels(), 0);
        let wi = Matrix::new(dict.nwords() + args.bucket, args.dim);
        let wo = Matrix::new(1, args.dim);

        // A structurally valid file whose supervised model has no
        // labels to build a coding tree over.
        let mut buf = Vec::new();
        binio::write_i32(&mut buf, MAGIC).unwrap();
        binio::write_i32(&mut buf, VERSION).unwrap();
        args.save(&mut buf).unwrap();
        dict.save(&mut buf).unwrap();
        binio::write_bool(&mut buf, false).unwrap();
        wi.save(&mut buf).unwrap();
        binio::write_bool(&mut buf, false).unwrap();
        wo.save(&mut buf).unwrap();
        assert!(FastText::load(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn load_rejects_foreign_files() {
        let mut buf = Vec::new();
        binio::write_i32(&mut buf, 123).unwrap();
        binio::write_i32(&mut buf, VERSION).unwrap();
        assert!(FastText::load(&mut buf.as_slice()).is_err());

        let mut buf = Vec::new();
        binio::write_i32(&mut buf, MAGIC).unwrap();
        binio::write_i32(&mut buf, 99).unwrap();
        assert!(FastText::load(&mut buf.as_slice()).is_err());
    }
}
