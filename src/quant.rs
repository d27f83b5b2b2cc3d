//! Product quantization: rows are split into sub-vectors, each encoded
//! as the index of its nearest k-means centroid.

use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::binio;
use crate::error::{Error, Result};
use crate::math::{Matrix, Vector};

const NBITS: usize = 8;
const KSUB: usize = 1 << NBITS;
const MAX_POINTS_PER_CLUSTER: usize = 256;
const MAX_POINTS: usize = MAX_POINTS_PER_CLUSTER * KSUB;
const SEED: u64 = 1234;
const NITER: usize = 25;
const EPS: f32 = 1e-7;

fn distance_l2(x: &[f32], y: &[f32]) -> f32 {
    x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// k-means codebooks over `nsubq` sub-vector blocks of a `dim`-wide row.
/// The last block may be narrower when `dsub` does not divide `dim`.
pub struct ProductQuantizer {
    dim: usize,
    nsubq: usize,
    dsub: usize,
    lastdsub: usize,
    /// `KSUB` centroids per block, blocks laid out consecutively.
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    pub fn new(dim: usize, dsub: usize) -> ProductQuantizer {
        let nsubq = dim / dsub + usize::from(dim % dsub > 0);
        let lastdsub = if dim % dsub == 0 { dsub } else { dim % dsub };
        ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids: vec![0.0; dim * KSUB],
        }
    }

    pub fn nsubq(&self) -> usize {
        self.nsubq
    }

    fn block_dim(&self, m: usize) -> usize {
        if m == self.nsubq - 1 {
            self.lastdsub
        } else {
            self.dsub
        }
    }

    fn centroid(&self, m: usize, i: usize) -> &[f32] {
        let d = self.block_dim(m);
        let start = m * KSUB * self.dsub + i * d;
        &self.centroids[start..start + d]
    }

    fn centroids_block(&mut self, m: usize) -> &mut [f32] {
        let d = self.block_dim(m);
        let start = m * KSUB * self.dsub;
        &mut self.centroids[start..start + KSUB * d]
    }

    fn nearest(centroids: &[f32], d: usize, point: &[f32]) -> (u8, f32) {
        let mut best = 0u8;
        let mut best_dist = f32::MAX;
        for k in 0..KSUB {
            let dist = distance_l2(point, &centroids[k * d..k * d + d]);
            if dist < best_dist {
                best = k as u8;
                best_dist = dist;
            }
        }
        (best, best_dist)
    }

    fn kmeans(points: &[f32], n: usize, d: usize, centroids: &mut [f32], rng: &mut StdRng) {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(rng);
        for k in 0..KSUB {
            centroids[k * d..k * d + d].copy_from_slice(&points[perm[k] * d..perm[k] * d + d]);
        }
        let mut codes = vec![0u8; n];
        for _ in 0..NITER {
            for i in 0..n {
                let (code, _) = Self::nearest(centroids, d, &points[i * d..i * d + d]);
                codes[i] = code;
            }
            Self::m_step(points, &codes, n, d, centroids, rng);
        }
    }

    fn m_step(
        points: &[f32],
        codes: &[u8],
        n: usize,
        d: usize,
        centroids: &mut [f32],
        rng: &mut StdRng,
    ) {
        let mut counts = vec![0usize; KSUB];
        centroids.fill(0.0);
        for i in 0..n {
            let k = codes[i] as usize;
            counts[k] += 1;
            for j in 0..d {
                centroids[k * d + j] += points[i * d + j];
            }
        }
        for k in 0..KSUB {
            if counts[k] > 0 {
                for j in 0..d {
                    centroids[k * d + j] /= counts[k] as f32;
                }
            }
        }
        // Empty clusters split a populated one, chosen with probability
        // proportional to its size.
        for k in 0..KSUB {
            if counts[k] != 0 {
                continue;
            }
            let mut m = 0usize;
            while rng.gen::<f32>() * (n - KSUB) as f32 >= counts[m].saturating_sub(1) as f32 {
                m = (m + 1) % KSUB;
            }
            for j in 0..d {
                let sign = if j % 2 == 0 { -1.0 } else { 1.0 };
                centroids[k * d + j] = centroids[m * d + j] + sign * EPS;
                centroids[m * d + j] -= sign * EPS;
            }
            counts[k] = counts[m] / 2;
            counts[m] -= counts[k];
        }
    }

    /// Learns one codebook per sub-vector block from (at most
    /// `MAX_POINTS` of) the `n` rows in `data`.
    pub fn train(&mut self, n: usize, data: &[f32]) -> Result<()> {
        if n < KSUB {
            return Err(Error::Argument(format!(
                "matrix with {n} rows is too small to quantize; need at least {KSUB}"
            )));
        }
        let np = n.min(MAX_POINTS);
        let mut rng = StdRng::seed_from_u64(SEED);
        let mut perm: Vec<usize> = (0..n).collect();
        let dim = self.dim;
        let dsub = self.dsub;
        let mut block = vec![0.0f32; np * dsub];
        for m in 0..self.nsubq {
            let d = self.block_dim(m);
            if np != n {
                perm.shuffle(&mut rng);
            }
            for i in 0..np {
                let row = perm[i];
                block[i * d..i * d + d]
                    .copy_from_slice(&data[row * dim + m * dsub..row * dim + m * dsub + d]);
            }
            Self::kmeans(&block, np, d, self.centroids_block(m), &mut rng);
        }
        Ok(())
    }

    /// Encodes one `dim`-wide row into `nsubq` centroid indexes.
    pub fn compute_code(&self, row: &[f32], codes: &mut [u8]) {
        for m in 0..self.nsubq {
            let d = self.block_dim(m);
            let start = m * KSUB * self.dsub;
            let (code, _) = Self::nearest(
                &self.centroids[start..start + KSUB * d],
                d,
                &row[m * self.dsub..m * self.dsub + d],
            );
            codes[m] = code;
        }
    }

    pub fn compute_codes(&self, data: &[f32], codes: &mut [u8], n: usize) {
        for i in 0..n {
            self.compute_code(
                &data[i * self.dim..(i + 1) * self.dim],
                &mut codes[i * self.nsubq..(i + 1) * self.nsubq],
            );
        }
    }

    /// `x` += `alpha` * decoded row `t`.
    pub fn add_code(&self, x: &mut [f32], codes: &[u8], t: usize, alpha: f32) {
        for m in 0..self.nsubq {
            let c = self.centroid(m, codes[t * self.nsubq + m] as usize);
            for (j, &v) in c.iter().enumerate() {
                x[m * self.dsub + j] += alpha * v;
            }
        }
    }

    /// Dot product of `x` with decoded row `t`, scaled by `alpha`.
    pub fn mul_code(&self, x: &[f32], codes: &[u8], t: usize, alpha: f32) -> f32 {
        let mut sum = 0.0;
        for m in 0..self.nsubq {
            let c = self.centroid(m, codes[t * self.nsubq + m] as usize);
            for (j, &v) in c.iter().enumerate() {
                sum += x[m * self.dsub + j] * v;
            }
        }
        sum * alpha
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        binio::write_i32(w, self.dim as i32)?;
        binio::write_i32(w, self.nsubq as i32)?;
        binio::write_i32(w, self.dsub as i32)?;
        binio::write_i32(w, self.lastdsub as i32)?;
        binio::write_f32_slice(w, &self.centroids)?;
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<ProductQuantizer> {
        let dim = binio::read_i32(r)? as usize;
        let nsubq = binio::read_i32(r)? as usize;
        let dsub = binio::read_i32(r)? as usize;
        let lastdsub = binio::read_i32(r)? as usize;
        let centroids = binio::read_f32_vec(r, dim * KSUB)?;
        Ok(ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids,
        })
    }
}

/// A matrix stored as per-row centroid codes, with optional separate
/// quantization of row norms.
pub struct QuantMatrix {
    pq: ProductQuantizer,
    norm_pq: Option<ProductQuantizer>,
    codes: Vec<u8>,
    norm_codes: Vec<u8>,
    qnorm: bool,
    m: usize,
    n: usize,
}

impl QuantMatrix {
    /// Quantizes a dense matrix. With `qnorm` each row is normalized
    /// first and its norm is coded by a separate one-dimensional
    /// quantizer.
    pub fn quantize(matrix: &Matrix, dsub: usize, qnorm: bool) -> Result<QuantMatrix> {
        let m = matrix.rows();
        let n = matrix.cols();
        // Train on a copy so the shared matrix stays untouched.
        let mut data = matrix.to_flat();

        let mut norm_pq = None;
        let mut norm_codes = Vec::new();
        if qnorm {
            let norms: Vec<f32> = (0..m).map(|i| matrix.l2_norm_row(i)).collect();
            for (i, &norm) in norms.iter().enumerate() {
                if norm > 0.0 {
                    for v in &mut data[i * n..(i + 1) * n] {
                        *v /= norm;
                    }
                }
            }
            let mut pq = ProductQuantizer::new(1, 1);
            pq.train(m, &norms)?;
            norm_codes = vec![0u8; m];
            pq.compute_codes(&norms, &mut norm_codes, m);
            norm_pq = Some(pq);
        }

        let mut pq = ProductQuantizer::new(n, dsub);
        pq.train(m, &data)?;
        let mut codes = vec![0u8; m * pq.nsubq()];
        pq.compute_codes(&data, &mut codes, m);

        Ok(QuantMatrix {
            pq,
            norm_pq,
            codes,
            norm_codes,
            qnorm,
            m,
            n,
        })
    }

    pub fn rows(&self) -> usize {
        self.m
    }

    pub fn cols(&self) -> usize {
        self.n
    }

    fn row_scale(&self, i: usize) -> f32 {
        match &self.norm_pq {
            Some(pq) => pq.centroid(0, self.norm_codes[i] as usize)[0],
            None => 1.0,
        }
    }

    pub fn add_row_to(&self, vec: &mut Vector, i: usize) {
        let alpha = self.row_scale(i);
        self.pq.add_code(vec.as_mut_slice(), &self.codes, i, alpha);
    }

    pub fn dot_row(&self, vec: &Vector, i: usize) -> f32 {
        let alpha = self.row_scale(i);
        self.pq.mul_code(vec.as_slice(), &self.codes, i, alpha)
    }

    /// Decodes every row back into a dense matrix.
    pub fn to_matrix(&self) -> Matrix {
        let mut data = vec![0.0f32; self.m * self.n];
        for i in 0..self.m {
            let alpha = self.row_scale(i);
            self.pq
                .add_code(&mut data[i * self.n..(i + 1) * self.n], &self.codes, i, alpha);
        }
        Matrix::from_flat(self.m, self.n, &data)
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        binio::write_bool(w, self.qnorm)?;
        binio::write_i32(w, self.m as i32)?;
        binio::write_i32(w, self.n as i32)?;
        binio::write_i32(w, self.codes.len() as i32)?;
        w.write_all(&self.codes)?;
        self.pq.save(w)?;
        if self.qnorm {
            w.write_all(&self.norm_codes)?;
            match &self.norm_pq {
                Some(pq) => pq.save(w)?,
                None => {
                    return Err(Error::Invariant(
                        "norm-quantized matrix is missing its norm quantizer".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<QuantMatrix> {
        let qnorm = binio::read_bool(r)?;
        let m = binio::read_i32(r)? as usize;
        let n = binio::read_i32(r)? as usize;
        let codesize = binio::read_i32(r)? as usize;
        let mut codes = vec![0u8; codesize];
        r.read_exact(&mut codes)?;
        let pq = ProductQuantizer::load(r)?;
        let mut norm_codes = Vec::new();
        let mut norm_pq = None;
        if qnorm {
            norm_codes = vec![0u8; m];
            r.read_exact(&mut norm_codes)?;
            norm_pq = Some(ProductQuantizer::load(r)?);
        }
        Ok(QuantMatrix {
            pq,
            norm_pq,
            codes,
            norm_codes,
            qnorm,
            m,
            n,
        })
    }
}
