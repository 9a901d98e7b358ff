//! Local dense block arithmetic.
//!
//! Nothing in here communicates. The multiply-accumulate kernel can spread
//! its rows over a rayon pool that lives only for the duration of one call,
//! so no queued work ever outlives the round that produced it.

use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::matrix::Matrix;

/// Blocks smaller than this are always multiplied on the calling thread
pub const PARALLEL_MIN_SIDE: usize = 32;

/// `c += a * b` for square `k x k` blocks.
///
/// With `threads > 1` the rows of `c` are split into contiguous ranges and
/// each range is owned by exactly one worker. Every element is summed in the
/// same order regardless of the thread count, so results are bitwise
/// reproducible.
pub fn multiply_accumulate(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    mut c: ArrayViewMut2<f64>,
    threads: usize,
) -> Result<()> {
    let k = check_square(a.dim(), "A block")?;
    check_dim(b.dim(), k)?;
    check_dim(c.dim(), k)?;

    if k == 0 {
        return Ok(());
    }

    let a = a.as_standard_layout();
    let b = b.as_standard_layout();
    let a = a.as_slice().ok_or_else(|| layout_error("A block"))?;
    let b = b.as_slice().ok_or_else(|| layout_error("B block"))?;

    match c.as_slice_mut() {
        Some(c_slice) => accumulate(a, b, c_slice, k, threads),
        None => {
            // Strided output: accumulate into scratch, then fold it back in
            let mut scratch = vec![0.0; k * k];
            accumulate(a, b, &mut scratch, k, threads)?;
            let scratch = Array2::from_shape_vec((k, k), scratch)?;
            c += &scratch;
            Ok(())
        }
    }
}

fn accumulate(a: &[f64], b: &[f64], c: &mut [f64], k: usize, threads: usize) -> Result<()> {
    if threads <= 1 || k < PARALLEL_MIN_SIDE {
        accumulate_rows(a, b, c, k);
        return Ok(());
    }

    let workers = threads.min(k);
    let rows_per_task = (k + workers - 1) / workers;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("block-math-{}", i))
        .build()?;

    log::trace!("multiplying {}x{} block on {} threads, {} rows each", k, k, workers, rows_per_task);

    pool.install(|| {
        c.par_chunks_mut(rows_per_task * k)
            .zip(a.par_chunks(rows_per_task * k))
            .for_each(|(c_rows, a_rows)| accumulate_rows(a_rows, b, c_rows, k));
    });

    Ok(())
}

/// i-p-j loop over a horizontal strip of A and the matching strip of C
fn accumulate_rows(a_rows: &[f64], b: &[f64], c_rows: &mut [f64], k: usize) {
    for (a_row, c_row) in a_rows.chunks_exact(k).zip(c_rows.chunks_exact_mut(k)) {
        for (p, &a_ip) in a_row.iter().enumerate() {
            let b_row = &b[p * k..(p + 1) * k];
            for (c_ij, &b_pj) in c_row.iter_mut().zip(b_row) {
                *c_ij += a_ip * b_pj;
            }
        }
    }
}

/// `c += other` for equally sized blocks
pub fn add_assign(mut c: ArrayViewMut2<f64>, other: ArrayView2<f64>) -> Result<()> {
    if c.dim() != other.dim() {
        return Err(Error::BlockSizeMismatch {
            expected: c.len(),
            actual: other.len(),
        });
    }

    Zip::from(&mut c).and(&other).for_each(|x, &y| *x += y);
    Ok(())
}

/// Reference triple-loop product of two square matrices
pub fn multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let n = check_square(a.dim(), "A")?;
    check_dim(b.dim(), n)?;

    let mut c = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            let mut sum = 0.0;
            for p in 0..n {
                sum += a[[i, p]] * b[[p, j]];
            }
            c[[i, j]] = sum;
        }
    }
    Ok(c)
}

/// Largest element-wise absolute difference, or infinity on shape mismatch
pub fn max_abs_diff(a: &Matrix, b: &Matrix) -> f64 {
    if a.dim() != b.dim() {
        return f64::INFINITY;
    }

    Zip::from(a)
        .and(b)
        .fold(0.0f64, |acc, &x, &y| acc.max((x - y).abs()))
}

/// Whether `actual` matches `expected` within `rel_tol`, scaled by the
/// magnitude of `expected`
pub fn approx_eq(actual: &Matrix, expected: &Matrix, rel_tol: f64) -> bool {
    let scale = expected.iter().fold(1.0f64, |acc, x| acc.max(x.abs()));
    max_abs_diff(actual, expected) <= rel_tol * scale
}

fn check_square(dim: (usize, usize), what: &str) -> Result<usize> {
    if dim.0 != dim.1 {
        return Err(Error::ValidationError(format!(
            "{} must be square, got {}x{}", what, dim.0, dim.1
        )));
    }
    Ok(dim.0)
}

fn check_dim(dim: (usize, usize), k: usize) -> Result<()> {
    if dim != (k, k) {
        return Err(Error::BlockSizeMismatch {
            expected: k * k,
            actual: dim.0 * dim.1,
        });
    }
    Ok(())
}

fn layout_error(what: &str) -> Error {
    Error::ValidationError(format!("{} is not contiguous in memory", what))
}
