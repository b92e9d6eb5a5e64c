//! Matrix products shared by the convolution and fully connected paths.
//!
//! All matrices are row-major. The f32 products go through faer; the int8 products widen to
//! 32-bit accumulators and never round.

use std::cell::RefCell;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};

thread_local! {
    static COLUMNS_F32: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
    static COLUMNS_I8: RefCell<Vec<i8>> = const { RefCell::new(Vec::new()) };
}

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// Runs `f` over this thread's f32 column scratch, resized to `len` zeroed elements.
pub(crate) fn with_columns_f32<R>(len: usize, f: impl FnOnce(&mut [f32]) -> R) -> R {
    COLUMNS_F32.with(|cell| {
        let mut buf = cell.borrow_mut();
        buf.clear();
        buf.resize(len, 0.0);
        f(buf.as_mut_slice())
    })
}

pub(crate) fn with_columns_i8<R>(len: usize, f: impl FnOnce(&mut [i8]) -> R) -> R {
    COLUMNS_I8.with(|cell| {
        let mut buf = cell.borrow_mut();
        buf.clear();
        buf.resize(len, 0);
        f(buf.as_mut_slice())
    })
}

/// `out[m, n] = lhs[m, k] * rhs[k, n]`.
pub(crate) fn gemm_f32(lhs: &[f32], rhs: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(lhs.len(), m * k);
    debug_assert_eq!(rhs.len(), k * n);
    debug_assert_eq!(out.len(), m * n);
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        out.fill(0.0);
        return;
    }
    // faer writes column-major; C^T = B^T * A^T as an (n x m) column-major matrix has the
    // same buffer as C in row-major order.
    let a_t = MatRef::from_row_major_slice(lhs, m, k).transpose();
    let b_t = MatRef::from_row_major_slice(rhs, k, n).transpose();
    let mut out_view = MatMut::from_column_major_slice_mut(out, n, m);
    matmul(&mut out_view, Accum::Replace, b_t, a_t, 1.0f32, faer_parallelism());
}

/// `out[m, n] = lhs[m, k] * rows[n, k]^T`, the shape of a fully connected layer whose
/// weights are stored one output feature per row.
pub(crate) fn gemm_f32_nt(lhs: &[f32], rows: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(lhs.len(), m * k);
    debug_assert_eq!(rows.len(), n * k);
    debug_assert_eq!(out.len(), m * n);
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        out.fill(0.0);
        return;
    }
    let a_t = MatRef::from_row_major_slice(lhs, m, k).transpose();
    let b_rows = MatRef::from_row_major_slice(rows, n, k);
    let mut out_view = MatMut::from_column_major_slice_mut(out, n, m);
    matmul(&mut out_view, Accum::Replace, b_rows, a_t, 1.0f32, faer_parallelism());
}

/// `acc[m, n] += lhs[m, k] * rhs[k, n]` over int8 operands.
pub(crate) fn gemm_i8_accumulate(lhs: &[i8], rhs: &[i8], acc: &mut [i32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(lhs.len(), m * k);
    debug_assert_eq!(rhs.len(), k * n);
    debug_assert_eq!(acc.len(), m * n);
    if n == 0 || k == 0 {
        return;
    }
    for (row, out) in acc.chunks_exact_mut(n).enumerate() {
        let weights = &lhs[row * k..(row + 1) * k];
        for (&w, col) in weights.iter().zip(rhs.chunks_exact(n)) {
            let w = w as i32;
            for (a, &x) in out.iter_mut().zip(col) {
                *a = a.wrapping_add(w * x as i32);
            }
        }
    }
}

/// Dot product of two int8 rows, wrapping like the 32-bit accumulators it models.
#[inline]
pub(crate) fn dot_i8(lhs: &[i8], rhs: &[i8]) -> i32 {
    lhs.iter()
        .zip(rhs)
        .fold(0i32, |acc, (&a, &b)| acc.wrapping_add(a as i32 * b as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(lhs: &[f32], rhs: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                out[i * n + j] = (0..k).map(|p| lhs[i * k + p] * rhs[p * n + j]).sum();
            }
        }
        out
    }

    #[test]
    fn faer_product_is_row_major() {
        let (m, k, n) = (3, 5, 4);
        let lhs: Vec<f32> = (0..m * k).map(|v| v as f32 * 0.25 - 1.0).collect();
        let rhs: Vec<f32> = (0..k * n).map(|v| 0.5 - v as f32 * 0.125).collect();
        let mut out = vec![0.0; m * n];
        gemm_f32(&lhs, &rhs, &mut out, m, k, n);
        for (a, e) in out.iter().zip(naive(&lhs, &rhs, m, k, n)) {
            assert!((a - e).abs() < 1e-5, "{a} vs {e}");
        }
    }

    #[test]
    fn transposed_rows_match_plain_product() {
        let (m, k, n) = (2, 3, 4);
        let lhs: Vec<f32> = (0..m * k).map(|v| v as f32).collect();
        let rows: Vec<f32> = (0..n * k).map(|v| (v % 5) as f32 - 2.0).collect();
        let mut rhs = vec![0.0; k * n];
        for j in 0..n {
            for p in 0..k {
                rhs[p * n + j] = rows[j * k + p];
            }
        }
        let mut out = vec![0.0; m * n];
        gemm_f32_nt(&lhs, &rows, &mut out, m, k, n);
        assert_eq!(out, naive(&lhs, &rhs, m, k, n));
    }

    #[test]
    fn int8_product_accumulates_onto_bias() {
        let lhs = [1i8, -2, 3, 4];
        let rhs = [5i8, 6, -7, 8];
        let mut acc = vec![10, 10, -10, -10];
        gemm_i8_accumulate(&lhs, &rhs, &mut acc, 2, 2, 2);
        assert_eq!(acc, vec![10 + 5 + 14, 10 + 6 - 16, -10 + 15 - 28, -10 + 18 + 32]);
        assert_eq!(dot_i8(&[127, -128], &[127, -128]), 127 * 127 + 128 * 128);
    }
}
