//! Multi-threaded SGD over a shared pair of embedding matrices.
//!
//! Workers read disjoint character ranges of the corpus, wrap around at
//! end of file and race their updates into the shared matrices without
//! locks. A shared token counter drives the learning rate decay and the
//! stop condition.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::args::{Args, ModelKind};
use crate::corpus::{self, LineReader};
use crate::dictionary::{Dictionary, EntryKind};
use crate::error::{Error, Result};
use crate::math::Matrix;
use crate::model::Model;

/// Snapshot of training state, emitted periodically by worker 0.
#[derive(Clone, Debug)]
pub struct Progress {
    pub percent: f32,
    pub words_per_sec: f64,
    pub learning_rate: f64,
    pub loss: f64,
    pub eta: String,
    pub total_tokens: u64,
    pub seen_tokens: u64,
}

pub struct Trainer<'a> {
    dict: &'a Dictionary,
    wi: Arc<Matrix>,
    wo: Arc<Matrix>,
    args: Arc<Args>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        dict: &'a Dictionary,
        wi: Arc<Matrix>,
        wo: Arc<Matrix>,
        args: Arc<Args>,
    ) -> Trainer<'a> {
        Trainer { dict, wi, wo, args }
    }

    /// Runs `args.thread` workers to completion. Progress events are
    /// sent on `progress` while worker 0 runs; the channel closing on
    /// the receiving side never fails training.
    pub fn train(&self, corpus_path: &Path, progress: Option<Sender<Progress>>) -> Result<()> {
        let file_chars = corpus::char_count(corpus_path)?;
        if file_chars == 0 {
            return Err(Error::Configuration(format!(
                "training corpus {corpus_path:?} is empty"
            )));
        }
        let threads = self.args.thread.max(1);
        info!(
            "training with {} threads over {} tokens x {} epochs",
            threads,
            self.dict.ntokens(),
            self.args.epoch
        );
        let token_count = AtomicU64::new(0);
        let start = Instant::now();

        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(threads);
            for tid in 0..threads {
                let tx = if tid == 0 { progress.clone() } else { None };
                let token_count = &token_count;
                handles.push(scope.spawn(move || {
                    self.worker(corpus_path, tid, threads, file_chars, token_count, start, tx)
                }));
            }
            let mut result = Ok(());
            for handle in handles {
                match handle.join() {
                    Ok(worker_result) => {
                        if result.is_ok() {
                            result = worker_result;
                        }
                    }
                    Err(_) => {
                        result = Err(Error::Invariant(
                            "training thread panicked".to_string(),
                        ));
                    }
                }
            }
            result
        })
    }

    fn worker(
        &self,
        corpus_path: &Path,
        tid: usize,
        threads: usize,
        file_chars: u64,
        token_count: &AtomicU64,
        start: Instant,
        progress: Option<Sender<Progress>>,
    ) -> Result<()> {
        let offset = tid as u64 * file_chars / threads as u64;
        let mut reader = LineReader::from_char_index(corpus_path, offset)?;

        // Each worker owns its loss state (sampler cursor, tree) so
        // only the matrix cells are shared.
        let counts = match self.args.model {
            ModelKind::Supervised => self.dict.counts(EntryKind::Label),
            _ => self.dict.counts(EntryKind::Word),
        };
        let mut model = Model::new(
            self.wi.clone(),
            self.wo.clone(),
            self.args.clone(),
            &counts,
            tid as u64,
        )?;
        let mut rng = StdRng::seed_from_u64(tid as u64);

        let total = self.args.epoch as u64 * self.dict.ntokens();
        let mut local_count = 0u64;
        let mut lines_seen = 0u64;
        let mut line = Vec::new();
        let mut labels = Vec::new();

        while token_count.load(Ordering::Relaxed) < total {
            let seen = token_count.load(Ordering::Relaxed);
            let lr = (self.args.lr * (1.0 - seen as f64 / total as f64)) as f32;

            let text = match reader.next_line()? {
                Some(text) => text,
                None => {
                    reader.rewind()?;
                    continue;
                }
            };

            line.clear();
            labels.clear();
            match self.args.model {
                ModelKind::Supervised => {
                    local_count +=
                        self.dict.line_to_features(&text, &mut line, &mut labels) as u64;
                    if !labels.is_empty() && !line.is_empty() {
                        let target = labels[rng.gen_range(0..labels.len())] as usize;
                        model.update(&line, target, lr)?;
                    }
                }
                ModelKind::Cbow => {
                    local_count +=
                        self.dict.line_to_word_ids(&text, &mut line, &mut rng) as u64;
                    self.cbow(&mut model, &mut rng, &line, lr)?;
                }
                ModelKind::SkipGram => {
                    local_count +=
                        self.dict.line_to_word_ids(&text, &mut line, &mut rng) as u64;
                    self.skipgram(&mut model, &mut rng, &line, lr)?;
                }
            }

            if local_count > self.args.lr_update_rate as u64 {
                token_count.fetch_add(local_count, Ordering::Relaxed);
                local_count = 0;
            }

            lines_seen += 1;
            if tid == 0 && lines_seen % 1000 == 0 {
                if let Some(tx) = &progress {
                    let _ = tx.send(self.snapshot(token_count, total, start, lr, &model));
                }
            }
        }
        token_count.fetch_add(local_count, Ordering::Relaxed);
        if tid == 0 {
            if let Some(tx) = &progress {
                let _ = tx.send(self.snapshot(
                    token_count,
                    total,
                    start,
                    0.0,
                    &model,
                ));
            }
        }
        Ok(())
    }

    fn snapshot(
        &self,
        token_count: &AtomicU64,
        total: u64,
        start: Instant,
        lr: f32,
        model: &Model,
    ) -> Progress {
        let seen = token_count.load(Ordering::Relaxed).min(total);
        let elapsed = start.elapsed().as_secs_f64() + 1e-3;
        let words_per_sec = seen as f64 / elapsed;
        let remaining = (total - seen) as f64 / words_per_sec.max(1.0);
        let eta_minutes = (remaining / 60.0) as u64;
        Progress {
            percent: seen as f32 / total as f32 * 100.0,
            words_per_sec,
            learning_rate: lr as f64,
            loss: model.avg_loss(),
            eta: format!("{}h{}m", eta_minutes / 60, eta_minutes % 60),
            total_tokens: total,
            seen_tokens: seen,
        }
    }

    /// Continuous bag of words: predict each word from the pooled
    /// subwords of a random-width window around it.
    fn cbow(&self, model: &mut Model, rng: &mut StdRng, line: &[u32], lr: f32) -> Result<()> {
        let mut bow = Vec::new();
        for w in 0..line.len() {
            let boundary = rng.gen_range(1..=self.args.ws) as i64;
            bow.clear();
            for c in -boundary..=boundary {
                let pos = w as i64 + c;
                if c != 0 && pos >= 0 && (pos as usize) < line.len() {
                    bow.extend_from_slice(self.dict.get_subwords(line[pos as usize] as usize));
                }
            }
            model.update(&bow, line[w] as usize, lr)?;
        }
        Ok(())
    }

    /// Skip-gram: predict each context word from the center word's
    /// subwords.
    fn skipgram(
        &self,
        model: &mut Model,
        rng: &mut StdRng,
        line: &[u32],
        lr: f32,
    ) -> Result<()> {
        for w in 0..line.len() {
            let boundary = rng.gen_range(1..=self.args.ws) as i64;
            let subwords = self.dict.get_subwords(line[w] as usize);
            for c in -boundary..=boundary {
                let pos = w as i64 + c;
                if c != 0 && pos >= 0 && (pos as usize) < line.len() {
                    model.update(subwords, line[pos as usize] as usize, lr)?;
                }
            }
        }
        Ok(())
    }
}
