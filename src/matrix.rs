//! Dense square matrices and the row-major buffers they travel in.

use ndarray::{s, Array2};

use crate::error::{Error, Result};

/// Dense matrix of 64-bit floats, stored row-major
pub type Matrix = Array2<f64>;

/// Build an `rows x cols` matrix from a row-major element buffer
pub fn from_row_major(rows: usize, cols: usize, data: &[f64]) -> Result<Matrix> {
    let len = rows.checked_mul(cols).ok_or_else(|| {
        Error::ValidationError(format!("{}x{} elements do not fit in memory", rows, cols))
    })?;
    if data.len() != len {
        return Err(Error::ValidationError(format!(
            "Buffer holds {} elements, expected {}x{} = {}",
            data.len(), rows, cols, len
        )));
    }

    Ok(Array2::from_shape_vec((rows, cols), data.to_vec())?)
}

/// Copy a matrix into a flat row-major vector
pub fn to_row_major(m: &Matrix) -> Vec<f64> {
    m.iter().copied().collect()
}

/// Side length of a square matrix, or a validation error naming `what`
pub fn square_side(m: &Matrix, what: &str) -> Result<usize> {
    let (rows, cols) = m.dim();
    if rows != cols {
        return Err(Error::ValidationError(format!(
            "{} must be square, got {}x{}", what, rows, cols
        )));
    }
    Ok(rows)
}

/// Zero-pad a square matrix up to `size x size`.
///
/// Returns a plain copy when no padding is needed.
pub fn pad_to(m: &Matrix, size: usize) -> Matrix {
    let (rows, cols) = m.dim();
    if rows == size && cols == size {
        return m.clone();
    }

    let mut padded = Array2::zeros((size, size));
    let rows = rows.min(size);
    let cols = cols.min(size);
    padded
        .slice_mut(s![..rows, ..cols])
        .assign(&m.slice(s![..rows, ..cols]));
    padded
}

/// Drop padding rows and columns, keeping the top-left `n x n` corner
pub fn truncate_to(m: Matrix, n: usize) -> Matrix {
    if m.dim() == (n, n) {
        return m;
    }
    m.slice(s![..n, ..n]).to_owned()
}

/// `n x n` identity matrix
pub fn identity(n: usize) -> Matrix {
    Array2::eye(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_row_major_layout() {
        let m = from_row_major(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m[[0, 2]], 3.0);
        assert_eq!(m[[1, 0]], 4.0);
        assert_eq!(to_row_major(&m), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_from_row_major_rejects_wrong_count() {
        let result = from_row_major(2, 2, &[1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_from_row_major_rejects_overflowing_shape() {
        let result = from_row_major(usize::MAX / 2 + 1, usize::MAX / 2 + 1, &[]);
        assert!(matches!(result, Err(Error::ValidationError(_))));

        let result = from_row_major(usize::MAX, 2, &[1.0]);
        assert!(matches!(result, Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_square_side() {
        let m = Array2::<f64>::zeros((3, 3));
        assert_eq!(square_side(&m, "A").unwrap(), 3);

        let rect = Array2::<f64>::zeros((3, 4));
        let err = square_side(&rect, "B").unwrap_err();
        assert!(format!("{}", err).contains("B must be square"));
    }

    #[test]
    fn test_pad_and_truncate() {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let padded = pad_to(&m, 4);
        assert_eq!(padded.dim(), (4, 4));
        assert_eq!(padded[[2, 2]], 9.0);
        assert_eq!(padded[[3, 3]], 0.0);
        assert_eq!(padded.row(3).sum(), 0.0);
        assert_eq!(padded.column(3).sum(), 0.0);

        let back = truncate_to(padded, 3);
        assert_eq!(back, m);
    }

    #[test]
    fn test_pad_without_growth_is_copy() {
        let m = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(pad_to(&m, 2), m);
    }
}
