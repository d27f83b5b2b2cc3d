//! The shallow network shared by all training modes: mean-pooled input
//! rows, one of three output-layer losses, and top-k prediction.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};

use ordered_float::OrderedFloat;

use crate::args::{Args, LossKind, ModelKind};
use crate::error::{Error, Result};
use crate::loss::{HuffmanTree, LossStrategy, NegativeSampler};
use crate::math::{Matrix, Vector};
use crate::quant::QuantMatrix;

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: f32 = 8.0;
const LOG_TABLE_SIZE: usize = 512;

fn sigmoid_table() -> &'static [f32] {
    static TABLE: OnceLock<Vec<f32>> = OnceLock::new();
    TABLE.get_or_init(|| {
        (0..=SIGMOID_TABLE_SIZE)
            .map(|i| {
                let x = (i as f64 * 2.0 * MAX_SIGMOID as f64) / SIGMOID_TABLE_SIZE as f64
                    - MAX_SIGMOID as f64;
                (1.0 / (1.0 + (-x).exp())) as f32
            })
            .collect()
    })
}

fn log_table() -> &'static [f32] {
    static TABLE: OnceLock<Vec<f32>> = OnceLock::new();
    TABLE.get_or_init(|| {
        (0..=LOG_TABLE_SIZE)
            .map(|i| ((i as f64 + 1e-5) / LOG_TABLE_SIZE as f64).ln() as f32)
            .collect()
    })
}

fn sigmoid(x: f32) -> f32 {
    if x < -MAX_SIGMOID {
        0.0
    } else if x > MAX_SIGMOID {
        1.0
    } else {
        let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as f32 / MAX_SIGMOID / 2.0) as usize;
        sigmoid_table()[i.min(SIGMOID_TABLE_SIZE)]
    }
}

/// Table lookup of `ln(x)` for `x` in (0, 1]; used only for the running
/// loss average.
fn log(x: f32) -> f32 {
    if x > 1.0 {
        return 0.0;
    }
    let i = (x * LOG_TABLE_SIZE as f32) as usize;
    log_table()[i.min(LOG_TABLE_SIZE)]
}

/// Exact log with a small offset so zero probabilities stay finite.
pub(crate) fn std_log(x: f32) -> f32 {
    (x as f64 + 1e-7).ln() as f32
}

/// Embedding rows the model reads from: dense matrices during training,
/// codebook-compressed rows after quantization.
#[derive(Clone)]
pub enum Rows {
    Dense(Arc<Matrix>),
    Quantized(Arc<QuantMatrix>),
}

impl Rows {
    pub fn add_row_to(&self, vec: &mut Vector, i: usize) {
        match self {
            Rows::Dense(m) => vec.add_row(m, i, 1.0),
            Rows::Quantized(q) => q.add_row_to(vec, i),
        }
    }

    pub fn dot_row(&self, vec: &Vector, i: usize) -> f32 {
        match self {
            Rows::Dense(m) => m.dot_row(vec, i),
            Rows::Quantized(q) => q.dot_row(vec, i),
        }
    }
}

pub struct Model {
    wi: Rows,
    wo: Rows,
    args: Arc<Args>,
    strategy: LossStrategy,
    osz: usize,
    hsz: usize,
    hidden: Vector,
    grad: Vector,
    output: Vector,
    loss_sum: f64,
    nexamples: u64,
}

impl Model {
    /// Trainable model over dense matrices. `counts` are per-output
    /// frequencies; `seed` randomizes the negative table shuffle.
    pub fn new(
        wi: Arc<Matrix>,
        wo: Arc<Matrix>,
        args: Arc<Args>,
        counts: &[u32],
        seed: u64,
    ) -> Result<Model> {
        Model::with_rows(Rows::Dense(wi), Rows::Dense(wo), args, counts, seed)
    }

    pub fn with_rows(
        wi: Rows,
        wo: Rows,
        args: Arc<Args>,
        counts: &[u32],
        seed: u64,
    ) -> Result<Model> {
        let osz = counts.len();
        // Both the coding tree and the negative table need at least one
        // output with weight; a crafted model file can violate that.
        if osz == 0 {
            return Err(Error::Configuration(
                "model has no output rows".to_string(),
            ));
        }
        let strategy = match args.loss {
            LossKind::NegativeSampling => {
                if counts.iter().all(|&c| c == 0) {
                    return Err(Error::Configuration(
                        "negative sampling requires nonzero output counts".to_string(),
                    ));
                }
                LossStrategy::NegativeSampling(NegativeSampler::new(counts, seed))
            }
            LossKind::HierarchicalSoftmax => {
                LossStrategy::HierarchicalSoftmax(HuffmanTree::new(counts))
            }
            LossKind::Softmax => LossStrategy::Softmax,
        };
        let hsz = args.dim;
        Ok(Model {
            wi,
            wo,
            args,
            strategy,
            osz,
            hsz,
            hidden: Vector::zeros(hsz),
            grad: Vector::zeros(hsz),
            output: Vector::zeros(osz),
            loss_sum: 0.0,
            nexamples: 0,
        })
    }

    pub fn osz(&self) -> usize {
        self.osz
    }

    /// Mean of the input rows.
    fn compute_hidden(&self, input: &[u32], hidden: &mut Vector) {
        debug_assert_eq!(hidden.len(), self.hsz);
        for v in hidden.as_mut_slice() {
            *v = 0.0;
        }
        for &i in input {
            self.wi.add_row_to(hidden, i as usize);
        }
        hidden.scale(1.0 / input.len() as f32);
    }

    /// One logistic step on output row `target`. Returns the loss and
    /// accumulates the hidden-layer gradient.
    fn binary_logistic(
        wo: &Rows,
        grad: &mut Vector,
        hidden: &Vector,
        target: usize,
        label: bool,
        lr: f32,
    ) -> f32 {
        let score = sigmoid(wo.dot_row(hidden, target));
        let y = if label { 1.0 } else { 0.0 };
        let alpha = lr * (y - score);
        match wo {
            Rows::Dense(m) => {
                grad.add_row(m, target, alpha);
                m.add_row(hidden, target, alpha);
            }
            // Quantized rows are read-only; updates never reach here.
            Rows::Quantized(_) => {}
        }
        if label {
            -log(score)
        } else {
            -log(1.0 - score)
        }
    }

    fn compute_output_softmax(wo: &Rows, hidden: &Vector, output: &mut Vector) {
        let osz = output.len();
        for i in 0..osz {
            let v = wo.dot_row(hidden, i);
            output.as_mut_slice()[i] = v;
        }
        let max = output
            .as_slice()
            .iter()
            .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut z = 0.0;
        for v in output.as_mut_slice() {
            *v = (*v - max).exp();
            z += *v;
        }
        for v in output.as_mut_slice() {
            *v /= z;
        }
    }

    /// One SGD step for (`input`, `target`) under the configured loss.
    pub fn update(&mut self, input: &[u32], target: usize, lr: f32) -> Result<()> {
        if input.is_empty() {
            return Ok(());
        }
        if target >= self.osz {
            return Err(Error::Invariant(format!(
                "target {target} is outside the output range [0, {})",
                self.osz
            )));
        }
        let mut hidden = std::mem::replace(&mut self.hidden, Vector::zeros(0));
        let mut grad = std::mem::replace(&mut self.grad, Vector::zeros(0));
        self.compute_hidden(input, &mut hidden);
        for v in grad.as_mut_slice() {
            *v = 0.0;
        }

        let loss = match &mut self.strategy {
            LossStrategy::NegativeSampling(sampler) => {
                let mut loss =
                    Self::binary_logistic(&self.wo, &mut grad, &hidden, target, true, lr);
                for _ in 0..self.args.neg {
                    let negative = sampler.sample(target as u32) as usize;
                    loss += Self::binary_logistic(
                        &self.wo, &mut grad, &hidden, negative, false, lr,
                    );
                }
                loss
            }
            LossStrategy::HierarchicalSoftmax(tree) => {
                let mut loss = 0.0;
                for (&node, &code) in tree.path(target).iter().zip(tree.code(target)) {
                    loss += Self::binary_logistic(
                        &self.wo,
                        &mut grad,
                        &hidden,
                        node as usize,
                        code,
                        lr,
                    );
                }
                loss
            }
            LossStrategy::Softmax => {
                Self::compute_output_softmax(&self.wo, &hidden, &mut self.output);
                for i in 0..self.osz {
                    let y = if i == target { 1.0 } else { 0.0 };
                    let alpha = lr * (y - self.output[i]);
                    if let Rows::Dense(m) = &self.wo {
                        grad.add_row(m, i, alpha);
                        m.add_row(&hidden, i, alpha);
                    }
                }
                -log(self.output[target])
            }
        };
        self.loss_sum += loss as f64;
        self.nexamples += 1;

        if self.args.model == ModelKind::Supervised {
            grad.scale(1.0 / input.len() as f32);
        }
        if let Rows::Dense(m) = &self.wi {
            for &i in input {
                m.add_row(&grad, i as usize, 1.0);
            }
        }
        self.hidden = hidden;
        self.grad = grad;
        Ok(())
    }

    /// Ranked `(log-probability, output id)` pairs for a feature line.
    /// Read-only; safe to call concurrently through shared references.
    pub fn predict(&self, input: &[u32], k: usize, threshold: f32) -> Result<Vec<(f32, usize)>> {
        if k < 1 {
            return Err(Error::Argument(format!("k must be positive, got {k}")));
        }
        if self.args.model != ModelKind::Supervised {
            return Err(Error::Argument(
                "prediction requires a supervised model".to_string(),
            ));
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mut hidden = Vector::zeros(self.hsz);
        self.compute_hidden(input, &mut hidden);

        let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, usize)>> =
            BinaryHeap::with_capacity(k + 1);
        let limit = std_log(threshold);
        match &self.strategy {
            LossStrategy::HierarchicalSoftmax(tree) => {
                self.dfs(tree, &hidden, k, limit, tree.root(), 0.0, &mut heap);
            }
            _ => {
                let mut output = Vector::zeros(self.osz);
                Self::compute_output_softmax(&self.wo, &hidden, &mut output);
                for i in 0..self.osz {
                    let score = std_log(output[i]);
                    if score < limit {
                        continue;
                    }
                    Self::heap_push(&mut heap, k, score, i);
                }
            }
        }
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse((OrderedFloat(score), id))| (score, id))
            .collect())
    }

    fn heap_push(
        heap: &mut BinaryHeap<Reverse<(OrderedFloat<f32>, usize)>>,
        k: usize,
        score: f32,
        id: usize,
    ) {
        heap.push(Reverse((OrderedFloat(score), id)));
        if heap.len() > k {
            heap.pop();
        }
    }

    /// Walks the coding tree, pruning branches that can no longer beat
    /// the k-th best accumulated log-probability.
    fn dfs(
        &self,
        tree: &HuffmanTree,
        hidden: &Vector,
        k: usize,
        limit: f32,
        node: usize,
        score: f32,
        heap: &mut BinaryHeap<Reverse<(OrderedFloat<f32>, usize)>>,
    ) {
        if score < limit {
            return;
        }
        if heap.len() == k {
            if let Some(Reverse((OrderedFloat(kth), _))) = heap.peek() {
                if score < *kth {
                    return;
                }
            }
        }
        if node < tree.osz() {
            Self::heap_push(heap, k, score, node);
            return;
        }
        let f = sigmoid(self.wo.dot_row(hidden, node - tree.osz()));
        let (left, right) = tree.children(node);
        self.dfs(tree, hidden, k, limit, left as usize, score + std_log(1.0 - f), heap);
        self.dfs(tree, hidden, k, limit, right as usize, score + std_log(f), heap);
    }

    /// Average loss per example since construction.
    pub fn avg_loss(&self) -> f64 {
        if self.nexamples == 0 {
            0.0
        } else {
            self.loss_sum / self.nexamples as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::SubwordHashes;

    fn supervised_args(loss: LossKind, dim: usize) -> Arc<Args> {
        let mut args = Args::for_supervised();
        args.loss = loss;
        args.dim = dim;
        args.subwords = SubwordHashes::Empty;
        Arc::new(args)
    }

    fn small_model(loss: LossKind, counts: &[u32]) -> Model {
        let dim = 8;
        let mut wi = Matrix::new(6, dim);
        wi.uniform(1.0 / dim as f32);
        let wo = Matrix::new(counts.len(), dim);
        Model::new(
            Arc::new(wi),
            Arc::new(wo),
            supervised_args(loss, dim),
            counts,
            42,
        )
        .unwrap()
    }

    #[test]
    fn sigmoid_matches_reference_shape() {
        assert_eq!(sigmoid(-20.0), 0.0);
        assert_eq!(sigmoid(20.0), 1.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 0.02);
        assert!(sigmoid(2.0) > sigmoid(1.0));
        assert!((sigmoid(1.0) + sigmoid(-1.0) - 1.0).abs() < 0.05);
    }

    #[test]
    fn log_table_tracks_ln() {
        for &x in &[0.1f32, 0.5, 0.9, 1.0] {
            assert!((log(x) - x.ln()).abs() < 0.05);
        }
        assert_eq!(log(1.5), 0.0);
    }

    #[test]
    fn update_learns_the_target_label() {
        for loss in [
            LossKind::NegativeSampling,
            LossKind::HierarchicalSoftmax,
            LossKind::Softmax,
        ] {
            let mut model = small_model(loss, &[10, 5, 2]);
            let input = [0u32, 3, 4];
            for _ in 0..200 {
                model.update(&input, 1, 0.3).unwrap();
            }
            let best = model.predict(&input, 1, 0.0).unwrap();
            assert_eq!(best[0].1, 1, "loss {loss:?} failed to learn");
            assert!(model.avg_loss() > 0.0);
        }
    }

    #[test]
    fn softmax_prediction_is_a_distribution() {
        let mut model = small_model(LossKind::Softmax, &[4, 3, 2, 1]);
        model.update(&[1, 2], 0, 0.1).unwrap();
        let all = model.predict(&[1, 2], 4, 0.0).unwrap();
        assert_eq!(all.len(), 4);
        let total: f32 = all.iter().map(|(s, _)| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-3);
        // Descending by score.
        for pair in all.windows(2) {
            assert!(pair[0].0 >= pair[1].0);
        }
    }

    #[test]
    fn hierarchical_prediction_is_a_distribution() {
        let mut model = small_model(LossKind::HierarchicalSoftmax, &[4, 3, 2, 1]);
        model.update(&[0, 5], 2, 0.1).unwrap();
        let all = model.predict(&[0, 5], 4, 0.0).unwrap();
        assert_eq!(all.len(), 4);
        let total: f32 = all.iter().map(|(s, _)| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-2);
    }

    #[test]
    fn predict_validates_arguments() {
        let model = small_model(LossKind::Softmax, &[2, 1]);
        assert!(model.predict(&[0], 0, 0.0).is_err());
        assert!(model.predict(&[], 1, 0.0).unwrap().is_empty());

        let dim = 4;
        let wi = Matrix::new(4, dim);
        let wo = Matrix::new(2, dim);
        let mut args = Args::for_word_vectors(ModelKind::SkipGram);
        args.dim = dim;
        let skipgram =
            Model::new(Arc::new(wi), Arc::new(wo), Arc::new(args), &[2, 1], 0).unwrap();
        assert!(skipgram.predict(&[0], 1, 0.0).is_err());
    }

    #[test]
    fn construction_rejects_degenerate_outputs() {
        let dim = 4;
        let wi = Arc::new(Matrix::new(2, dim));
        let wo = Arc::new(Matrix::new(1, dim));
        for loss in [
            LossKind::NegativeSampling,
            LossKind::HierarchicalSoftmax,
            LossKind::Softmax,
        ] {
            let args = supervised_args(loss, dim);
            assert!(Model::new(wi.clone(), wo.clone(), args, &[], 0).is_err());
        }
        // An all-zero frequency table leaves nothing to sample.
        let args = supervised_args(LossKind::NegativeSampling, dim);
        assert!(Model::new(wi, wo, args, &[0, 0], 0).is_err());
    }

    #[test]
    fn update_rejects_out_of_range_target() {
        let mut model = small_model(LossKind::Softmax, &[2, 1]);
        assert!(model.update(&[0], 9, 0.1).is_err());
        assert!(model.update(&[], 0, 0.1).is_ok());
    }

    #[test]
    fn threshold_filters_weak_predictions() {
        let mut model = small_model(LossKind::Softmax, &[5, 5]);
        for _ in 0..100 {
            model.update(&[0, 1], 0, 0.5).unwrap();
        }
        let confident = model.predict(&[0, 1], 2, 0.9).unwrap();
        assert_eq!(confident.len(), 1);
        assert_eq!(confident[0].1, 0);
    }
}
