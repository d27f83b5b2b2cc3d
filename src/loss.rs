//! Output-layer strategies: negative sampling table, Huffman coding
//! tree for hierarchical softmax, and plain softmax.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const NEGATIVE_TABLE_SIZE: usize = 10_000_000;

/// Pre-shuffled table of candidate word ids, drawn proportionally to
/// the square root of each word's frequency. A rotating cursor replaces
/// per-draw randomness.
pub struct NegativeSampler {
    negatives: Vec<u32>,
    cursor: usize,
}

impl NegativeSampler {
    pub fn new(counts: &[u32], seed: u64) -> NegativeSampler {
        let z: f64 = counts.iter().map(|&c| (c as f64).sqrt()).sum();
        let mut negatives = Vec::with_capacity(NEGATIVE_TABLE_SIZE);
        for (id, &count) in counts.iter().enumerate() {
            let c = (count as f64).sqrt();
            let reps = (c * NEGATIVE_TABLE_SIZE as f64 / z) as usize;
            for _ in 0..reps {
                negatives.push(id as u32);
            }
        }
        let mut rng = StdRng::seed_from_u64(seed);
        negatives.shuffle(&mut rng);
        NegativeSampler {
            negatives,
            cursor: 0,
        }
    }

    /// Next candidate id that differs from `target`.
    pub fn sample(&mut self, target: u32) -> u32 {
        loop {
            let negative = self.negatives[self.cursor];
            self.cursor = (self.cursor + 1) % self.negatives.len();
            if negative != target {
                return negative;
            }
        }
    }
}

/// One node of the Huffman coding tree built over output frequencies.
#[derive(Clone, Copy)]
struct Node {
    parent: i32,
    left: i32,
    right: i32,
    count: u64,
    binary: bool,
}

/// Huffman tree over `osz` outputs: `2 * osz - 1` nodes, leaves first.
/// Frequent outputs get short root paths.
pub struct HuffmanTree {
    paths: Vec<Vec<u32>>,
    codes: Vec<Vec<bool>>,
    tree: Vec<Node>,
    osz: usize,
}

impl HuffmanTree {
    pub fn new(counts: &[u32]) -> HuffmanTree {
        let osz = counts.len();
        let mut tree = Vec::with_capacity(2 * osz - 1);
        for &c in counts {
            tree.push(Node {
                parent: -1,
                left: -1,
                right: -1,
                count: c as u64,
                binary: false,
            });
        }
        for _ in osz..2 * osz - 1 {
            tree.push(Node {
                parent: -1,
                left: -1,
                right: -1,
                count: u64::MAX,
                binary: false,
            });
        }

        // Leaves are sorted by ascending count from the right end, so
        // the two cheapest unmerged nodes are always at the two fronts.
        let mut leaf = osz as i64 - 1;
        let mut node = osz;
        for i in osz..2 * osz - 1 {
            let mut mini = [0usize; 2];
            for slot in &mut mini {
                if leaf >= 0 && tree[leaf as usize].count < tree[node].count {
                    *slot = leaf as usize;
                    leaf -= 1;
                } else {
                    *slot = node;
                    node += 1;
                }
            }
            tree[i].count = tree[mini[0]].count + tree[mini[1]].count;
            tree[i].left = mini[0] as i32;
            tree[i].right = mini[1] as i32;
            tree[mini[0]].parent = i as i32;
            tree[mini[1]].parent = i as i32;
            tree[mini[1]].binary = true;
        }

        let mut paths = Vec::with_capacity(osz);
        let mut codes = Vec::with_capacity(osz);
        for i in 0..osz {
            let mut path = Vec::new();
            let mut code = Vec::new();
            let mut j = tree[i].parent;
            while j != -1 {
                // Internal nodes are indexed relative to the leaf count.
                path.push((j as usize - osz) as u32);
                code.push(tree[j as usize].binary);
                j = tree[j as usize].parent;
            }
            paths.push(path);
            codes.push(code);
        }
        HuffmanTree {
            paths,
            codes,
            tree,
            osz,
        }
    }

    pub fn path(&self, target: usize) -> &[u32] {
        &self.paths[target]
    }

    pub fn code(&self, target: usize) -> &[bool] {
        &self.codes[target]
    }

    pub fn osz(&self) -> usize {
        self.osz
    }

    /// Children of node `node` in absolute indexing. Node ids below
    /// `osz` are leaves.
    pub fn children(&self, node: usize) -> (i32, i32) {
        let n = &self.tree[node];
        (n.left, n.right)
    }

    /// Absolute node id of the root.
    pub fn root(&self) -> usize {
        self.tree.len() - 1
    }
}

/// Output-layer training strategy. Prediction paths treat negative
/// sampling and softmax identically.
pub enum LossStrategy {
    NegativeSampling(NegativeSampler),
    HierarchicalSoftmax(HuffmanTree),
    Softmax,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_never_yields_target() {
        let counts = [100, 1];
        let mut sampler = NegativeSampler::new(&counts, 3);
        for _ in 0..1000 {
            assert_eq!(sampler.sample(0), 1);
        }
    }

    #[test]
    fn sampler_frequencies_follow_sqrt_counts() {
        let counts = [400, 100, 100];
        let sampler = NegativeSampler::new(&counts, 3);
        let mut seen = [0usize; 3];
        for &n in &sampler.negatives {
            seen[n as usize] += 1;
        }
        // sqrt weighting: 20 / (20 + 10 + 10) = half the table.
        let total = sampler.negatives.len() as f64;
        assert!((seen[0] as f64 / total - 0.5).abs() < 0.01);
        assert!((seen[1] as f64 / total - 0.25).abs() < 0.01);
    }

    #[test]
    fn tree_has_expected_shape() {
        let counts = [40, 30, 20, 10];
        let tree = HuffmanTree::new(&counts);
        assert_eq!(tree.tree.len(), 2 * counts.len() - 1);
        assert_eq!(tree.osz(), 4);
        // The rarest output has the longest code.
        assert!(tree.code(3).len() >= tree.code(0).len());
        for i in 0..counts.len() {
            assert_eq!(tree.path(i).len(), tree.code(i).len());
            assert!(!tree.path(i).is_empty());
            for &p in tree.path(i) {
                assert!((p as usize) < counts.len() - 1);
            }
        }
        // Root covers the whole frequency mass.
        assert_eq!(tree.tree[tree.root()].count, 100);
    }

    #[test]
    fn tree_codes_are_prefix_free() {
        let counts = [7, 5, 3, 2, 1];
        let tree = HuffmanTree::new(&counts);
        for i in 0..counts.len() {
            for j in 0..counts.len() {
                if i == j {
                    continue;
                }
                let a = tree.code(i);
                let b = tree.code(j);
                // One leaf's root path never prefixes another's. Codes
                // are stored leaf-to-root, so compare reversed.
                let a_rev: Vec<bool> = a.iter().rev().copied().collect();
                let b_rev: Vec<bool> = b.iter().rev().copied().collect();
                let shorter = a_rev.len().min(b_rev.len());
                assert_ne!(&a_rev[..shorter], &b_rev[..shorter]);
            }
        }
    }
}
