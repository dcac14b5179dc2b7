//! Dense per-cell feature matrix.

use crate::error::{OpsError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;

/// A dense feature matrix storing one measurement vector per cell.
///
/// Rows represent cells, columns represent features. Missing values are
/// stored as `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    /// Dense matrix (cells × features).
    data: DMatrix<f64>,
    /// Feature identifiers (column names).
    feature_names: Vec<String>,
}

impl FeatureMatrix {
    /// Create a new FeatureMatrix from a dense matrix and feature names.
    pub fn new(data: DMatrix<f64>, feature_names: Vec<String>) -> Result<Self> {
        if data.ncols() != feature_names.len() {
            return Err(OpsError::DimensionMismatch {
                expected: data.ncols(),
                actual: feature_names.len(),
            });
        }
        Ok(Self {
            data,
            feature_names,
        })
    }

    /// Build from row vectors.
    pub fn from_rows(rows: &[Vec<f64>], feature_names: Vec<String>) -> Result<Self> {
        let n_features = feature_names.len();
        for row in rows {
            if row.len() != n_features {
                return Err(OpsError::DimensionMismatch {
                    expected: n_features,
                    actual: row.len(),
                });
            }
        }
        let data = DMatrix::from_fn(rows.len(), n_features, |i, j| rows[i][j]);
        Self::new(data, feature_names)
    }

    /// Number of cells (rows).
    #[inline]
    pub fn n_cells(&self) -> usize {
        self.data.nrows()
    }

    /// Number of features (columns).
    #[inline]
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    /// Feature identifiers.
    #[inline]
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Get the underlying matrix.
    #[inline]
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Consume into the underlying matrix.
    pub fn into_matrix(self) -> DMatrix<f64> {
        self.data
    }

    /// Value at (cell, feature).
    #[inline]
    pub fn get(&self, cell: usize, feature: usize) -> f64 {
        self.data[(cell, feature)]
    }

    /// Position of a feature by name.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|f| f == name)
    }

    /// A cell's feature vector.
    pub fn row(&self, cell: usize) -> Vec<f64> {
        self.data.row(cell).iter().copied().collect()
    }

    /// Number of missing values per feature.
    pub fn missing_per_feature(&self) -> Vec<usize> {
        (0..self.n_features())
            .into_par_iter()
            .map(|j| self.data.column(j).iter().filter(|v| v.is_nan()).count())
            .collect()
    }

    /// Total number of missing values.
    pub fn n_missing(&self) -> usize {
        self.data.iter().filter(|v| v.is_nan()).count()
    }

    /// Keep only the given cells, in the given order.
    pub fn subset_rows(&self, indices: &[usize]) -> Self {
        let data = DMatrix::from_fn(indices.len(), self.n_features(), |i, j| {
            self.data[(indices[i], j)]
        });
        Self {
            data,
            feature_names: self.feature_names.clone(),
        }
    }

    /// Keep only the given features, in the given order.
    pub fn subset_features(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&j| j >= self.n_features()) {
            return Err(OpsError::DimensionMismatch {
                expected: self.n_features(),
                actual: bad,
            });
        }
        let data = DMatrix::from_fn(self.n_cells(), indices.len(), |i, j| {
            self.data[(i, indices[j])]
        });
        let feature_names = indices
            .iter()
            .map(|&j| self.feature_names[j].clone())
            .collect();
        Ok(Self {
            data,
            feature_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_features() -> FeatureMatrix {
        FeatureMatrix::from_rows(
            &[
                vec![1.0, 10.0, f64::NAN],
                vec![2.0, 20.0, 200.0],
                vec![3.0, f64::NAN, 300.0],
            ],
            vec!["area".into(), "dapi_intensity".into(), "gfp_intensity".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_dimensions() {
        let feats = create_test_features();
        assert_eq!(feats.n_cells(), 3);
        assert_eq!(feats.n_features(), 3);
        assert_eq!(feats.feature_index("gfp_intensity"), Some(2));
    }

    #[test]
    fn test_missing_counts() {
        let feats = create_test_features();
        assert_eq!(feats.missing_per_feature(), vec![0, 1, 1]);
        assert_eq!(feats.n_missing(), 2);
    }

    #[test]
    fn test_subset_rows_preserves_order() {
        let feats = create_test_features();
        let subset = feats.subset_rows(&[2, 0]);
        assert_eq!(subset.n_cells(), 2);
        assert_eq!(subset.get(0, 0), 3.0);
        assert_eq!(subset.get(1, 1), 10.0);
    }

    #[test]
    fn test_subset_features() {
        let feats = create_test_features();
        let subset = feats.subset_features(&[1]).unwrap();
        assert_eq!(subset.feature_names(), &["dapi_intensity"]);
        assert_eq!(subset.row(1), vec![20.0]);
        assert!(feats.subset_features(&[5]).is_err());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = FeatureMatrix::from_rows(&[vec![1.0]], vec!["a".into(), "b".into()]);
        assert!(result.is_err());
    }
}
