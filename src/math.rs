//! Dense numeric primitives: transient `Vector`s and the shared `Matrix`.
//!
//! Matrices are written concurrently by all training threads with no
//! locks (Hogwild SGD). Cells are `f32` bits in relaxed atomics so the
//! races stay well-defined; individual updates may still be lost, which
//! the algorithm tolerates.

use std::io::{Read, Write};
use std::ops::Index;
use std::sync::atomic::{AtomicU32, Ordering};

use aligned_box::AlignedBox;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::binio;
use crate::error::Result;

const ALIGNMENT: usize = 128;

#[derive(Default)]
#[repr(transparent)]
pub(crate) struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    #[inline]
    fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    fn add(&self, x: f32) {
        self.set(self.get() + x);
    }
}

/// Dense row-major matrix of embedding rows.
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: AlignedBox<[AtomicF32]>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Matrix {
        // At least one cell, so empty matrices still allocate.
        let data = AlignedBox::slice_from_default(ALIGNMENT, (rows * cols).max(1))
            .expect("matrix allocation failed");
        Matrix { rows, cols, data }
    }

    pub fn from_flat(rows: usize, cols: usize, values: &[f32]) -> Matrix {
        debug_assert_eq!(values.len(), rows * cols);
        let m = Matrix::new(rows, cols);
        for (cell, v) in m.data.iter().zip(values) {
            cell.set(*v);
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.cols + j].get()
    }

    #[inline]
    pub fn set(&self, i: usize, j: usize, v: f32) {
        self.data[i * self.cols + j].set(v);
    }

    /// Fills the matrix with uniform random values in `[-a, a]`.
    pub fn uniform(&mut self, a: f32) {
        let mut rng = StdRng::seed_from_u64(1);
        for cell in self.data.iter() {
            cell.set((rng.gen::<f64>() * 2.0 * a as f64 - a as f64) as f32);
        }
    }

    /// Row `i` += `a` * `vec`. Training threads race here; lost updates
    /// are tolerated.
    pub fn add_row(&self, vec: &Vector, i: usize, a: f32) {
        let row = &self.data[i * self.cols..(i + 1) * self.cols];
        for (cell, v) in row.iter().zip(vec.as_slice()) {
            cell.add(a * v);
        }
    }

    pub fn dot_row(&self, vec: &Vector, i: usize) -> f32 {
        let row = &self.data[i * self.cols..(i + 1) * self.cols];
        row.iter()
            .zip(vec.as_slice())
            .map(|(cell, v)| cell.get() * v)
            .sum()
    }

    pub fn l2_norm_row(&self, i: usize) -> f32 {
        let row = &self.data[i * self.cols..(i + 1) * self.cols];
        row.iter().map(|cell| cell.get() * cell.get()).sum::<f32>().sqrt()
    }

    pub fn copy_row(&self, i: usize, out: &mut [f32]) {
        let row = &self.data[i * self.cols..(i + 1) * self.cols];
        for (v, cell) in out.iter_mut().zip(row) {
            *v = cell.get();
        }
    }

    /// Snapshot of the whole matrix as a flat `Vec<f32>`.
    pub fn to_flat(&self) -> Vec<f32> {
        self.data[..self.rows * self.cols]
            .iter()
            .map(AtomicF32::get)
            .collect()
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        binio::write_i32(w, self.rows as i32)?;
        binio::write_i32(w, self.cols as i32)?;
        let mut row = vec![0.0f32; self.cols];
        for i in 0..self.rows {
            self.copy_row(i, &mut row);
            binio::write_f32_slice(w, &row)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Matrix> {
        let rows = binio::read_i32(r)? as usize;
        let cols = binio::read_i32(r)? as usize;
        let values = binio::read_f32_vec(r, rows * cols)?;
        Ok(Matrix::from_flat(rows, cols, &values))
    }
}

/// Dense float vector of embedding-dimension length.
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    pub fn zeros(dim: usize) -> Vector {
        Vector {
            data: vec![0.0; dim],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn scale(&mut self, a: f32) {
        for v in &mut self.data {
            *v *= a;
        }
    }

    pub fn add_vector(&mut self, other: &Vector) {
        for (v, o) in self.data.iter_mut().zip(other.as_slice()) {
            *v += o;
        }
    }

    /// `self` += `a` * row `i` of `m`.
    pub fn add_row(&mut self, m: &Matrix, i: usize, a: f32) {
        for (j, v) in self.data.iter_mut().enumerate() {
            *v += a * m.at(i, j);
        }
    }
}

impl Index<usize> for Vector {
    type Output = f32;

    fn index(&self, i: usize) -> &f32 {
        &self.data[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_and_add_row() {
        let m = Matrix::from_flat(2, 3, &[1.0, 2.0, 3.0, -1.0, 0.0, 0.5]);
        let mut v = Vector::zeros(3);
        v.add_row(&m, 0, 2.0);
        assert_eq!(v.as_slice(), &[2.0, 4.0, 6.0]);
        assert!((m.dot_row(&v, 1) - (-2.0 + 3.0)).abs() < 1e-6);

        m.add_row(&v, 1, 1.0);
        assert_eq!(m.at(1, 0), 1.0);
        assert_eq!(m.at(1, 2), 6.5);
    }

    #[test]
    fn norms() {
        let m = Matrix::from_flat(1, 2, &[3.0, 4.0]);
        assert!((m.l2_norm_row(0) - 5.0).abs() < 1e-6);
        let mut v = Vector::zeros(2);
        v.add_row(&m, 0, 1.0);
        assert!((v.norm() - 5.0).abs() < 1e-6);
        v.scale(0.2);
        assert!((v.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut m = Matrix::new(10, 10);
        m.uniform(0.01);
        for i in 0..10 {
            for j in 0..10 {
                assert!(m.at(i, j).abs() <= 0.01);
            }
        }
    }

    #[test]
    fn save_load_round_trip() {
        let m = Matrix::from_flat(2, 2, &[0.1, -0.2, 0.3, -0.4]);
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        let m2 = Matrix::load(&mut buf.as_slice()).unwrap();
        assert_eq!(m2.rows(), 2);
        assert_eq!(m2.cols(), 2);
        assert_eq!(m.to_flat(), m2.to_flat());
    }
}
