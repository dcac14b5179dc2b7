//! Dense linear algebra helpers shared by PCA and TVN.

use nalgebra::{DMatrix, DVector};

/// Per-column means.
pub(crate) fn column_means(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_fn(m.ncols(), |j, _| m.column(j).mean())
}

/// Subtract `mean` from every row.
pub(crate) fn center(m: &DMatrix<f64>, mean: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)] - mean[j])
}

/// Sample covariance of the rows (n − 1 denominator).
///
/// Callers guarantee at least two rows.
pub(crate) fn covariance(m: &DMatrix<f64>, mean: &DVector<f64>) -> DMatrix<f64> {
    let centered = center(m, mean);
    let denom = (m.nrows() - 1) as f64;
    (centered.transpose() * &centered) / denom
}

/// Eigen-decomposition of a symmetric matrix, eigenvalues descending.
#[derive(Debug, Clone)]
pub(crate) struct SortedEigen {
    pub values: Vec<f64>,
    /// Eigenvectors as columns, in the order of `values`.
    pub vectors: DMatrix<f64>,
}

pub(crate) fn sorted_symmetric_eigen(m: DMatrix<f64>) -> SortedEigen {
    let eig = m.symmetric_eigen();
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let values = order.iter().map(|&i| eig.eigenvalues[i]).collect();
    let vectors = DMatrix::from_fn(eig.eigenvectors.nrows(), order.len(), |r, c| {
        eig.eigenvectors[(r, order[c])]
    });
    SortedEigen { values, vectors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_covariance() {
        let m = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let mean = column_means(&m);
        assert_relative_eq!(mean[0], 2.0);
        assert_relative_eq!(mean[1], 4.0);
        let cov = covariance(&m, &mean);
        assert_relative_eq!(cov[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], 2.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sorted_eigen_descending() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 3.0]);
        let eig = sorted_symmetric_eigen(m);
        assert_relative_eq!(eig.values[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(eig.values[1], 3.0, epsilon = 1e-12);
        assert_relative_eq!(eig.values[2], 1.0, epsilon = 1e-12);
        assert_relative_eq!(eig.vectors[(1, 0)].abs(), 1.0, epsilon = 1e-12);
    }
}
