//! Query-based cell filtering.

use crate::data::{CellMetadata, FeatureMatrix};
use crate::error::Result;
use crate::filter::expr::Query;
use crate::filter::stats::{check_aligned, Filtered, RowResolver};
use rayon::prelude::*;

/// Keep cells satisfying every query.
///
/// Queries are evaluated against the joined metadata+feature row. An empty
/// query list keeps every cell.
///
/// # Arguments
/// * `metadata` - Cell metadata
/// * `features` - Cell features, row-aligned with `metadata`
/// * `queries` - Boolean expressions, e.g. `"cell_class == 'interphase'"`
///
/// # Errors
/// `Config` if a query does not parse, `Schema` if it names an unknown column.
pub fn filter_queries<S: AsRef<str>>(
    metadata: &CellMetadata,
    features: &FeatureMatrix,
    queries: &[S],
) -> Result<Filtered> {
    check_aligned(metadata, features)?;
    let parsed = queries
        .iter()
        .map(|q| Query::parse(q.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    filter_parsed(metadata, features, &parsed)
}

/// Keep cells satisfying every already-parsed query.
pub fn filter_parsed(
    metadata: &CellMetadata,
    features: &FeatureMatrix,
    queries: &[Query],
) -> Result<Filtered> {
    check_aligned(metadata, features)?;
    let columns: Vec<&str> = queries.iter().flat_map(|q| q.columns()).collect();
    let resolver = RowResolver::new(metadata, features, &columns)?;

    let keep: Vec<usize> = (0..features.n_cells())
        .into_par_iter()
        .filter(|&row| {
            let lookup = |name: &str| resolver.value(row, name);
            queries.iter().all(|q| q.matches(&lookup))
        })
        .collect();

    Ok(Filtered::keep_rows("query filter", metadata, features, &keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Variable;
    use crate::error::OpsError;

    fn create_test_data() -> (CellMetadata, FeatureMatrix) {
        let classes = ["interphase", "mitotic", "interphase", "interphase", "mitotic"];
        let confidence = [0.95, 0.9, 0.4, 0.85, 0.99];
        let metadata = CellMetadata::from_columns(
            vec!["class".into(), "confidence".into()],
            vec![
                classes
                    .iter()
                    .map(|c| Variable::Categorical(c.to_string()))
                    .collect(),
                confidence.iter().map(|&c| Variable::Continuous(c)).collect(),
            ],
        )
        .unwrap();
        let features = FeatureMatrix::from_rows(
            &[
                vec![100.0],
                vec![250.0],
                vec![f64::NAN],
                vec![120.0],
                vec![90.0],
            ],
            vec!["nucleus_area".into()],
        )
        .unwrap();
        (metadata, features)
    }

    #[test]
    fn test_empty_query_list_is_identity() {
        let (meta, feats) = create_test_data();
        let queries: Vec<String> = Vec::new();
        let out = filter_queries(&meta, &feats, &queries).unwrap();
        assert_eq!(out.metadata, meta);
        assert_eq!(out.features.n_cells(), feats.n_cells());
        assert_eq!(out.stats.n_removed, 0);
    }

    #[test]
    fn test_all_queries_must_hold() {
        let (meta, feats) = create_test_data();
        let out = filter_queries(
            &meta,
            &feats,
            &["class == 'interphase'", "confidence > 0.8"],
        )
        .unwrap();
        assert_eq!(out.stats.n_after, 2);
        assert_eq!(out.features.row(0), vec![100.0]);
        assert_eq!(out.features.row(1), vec![120.0]);
    }

    #[test]
    fn test_feature_columns_queryable() {
        let (meta, feats) = create_test_data();
        let out = filter_queries(&meta, &feats, &["nucleus_area < 200"]).unwrap();
        // the NaN row fails the comparison
        assert_eq!(out.stats.n_after, 3);
    }

    #[test]
    fn test_idempotent() {
        let (meta, feats) = create_test_data();
        let queries = ["class == 'interphase' or nucleus_area > 200"];
        let once = filter_queries(&meta, &feats, &queries).unwrap();
        let twice = filter_queries(&once.metadata, &once.features, &queries).unwrap();
        assert_eq!(once.metadata, twice.metadata);
        assert_eq!(once.features.n_cells(), twice.features.n_cells());
        assert_eq!(twice.stats.n_removed, 0);
    }

    #[test]
    fn test_everything_removed_returns_empty() {
        let (meta, feats) = create_test_data();
        let out = filter_queries(&meta, &feats, &["confidence > 2"]).unwrap();
        assert_eq!(out.features.n_cells(), 0);
        assert_eq!(out.metadata.n_rows(), 0);
    }

    #[test]
    fn test_unknown_column() {
        let (meta, feats) = create_test_data();
        let result = filter_queries(&meta, &feats, &["tile == 3"]);
        assert!(matches!(result, Err(OpsError::Schema { .. })));
    }
}
