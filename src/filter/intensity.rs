//! Intensity outlier filter.
//!
//! Cells with aberrant channel intensities (debris, saturated or out-of-focus
//! cells) are removed with an isolation forest fit on the intensity-derived
//! features, either over all channels at once or with one detector per
//! channel.

use crate::capability::channel::channel_regex;
use crate::data::{CellMetadata, FeatureMatrix};
use crate::error::{OpsError, Result};
use crate::filter::isolation::{flag_outliers, IsolationForest, IsolationForestConfig};
use crate::filter::stats::{check_aligned, Filtered};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Feature names matching this pattern are treated as intensity features.
pub const DEFAULT_INTENSITY_PATTERN: &str = "(?i)intensity";

/// Configuration for the intensity outlier filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntensityFilterConfig {
    /// Fraction of cells flagged per detector, in [0, 1).
    pub contamination: f64,
    /// One detector per channel when set; a single global detector otherwise.
    pub channel_names: Option<Vec<String>>,
    /// Regex selecting intensity features by name.
    pub intensity_pattern: String,
    /// Isolation forest parameters.
    pub forest: IsolationForestConfig,
}

impl Default for IntensityFilterConfig {
    fn default() -> Self {
        Self {
            contamination: 0.01,
            channel_names: None,
            intensity_pattern: DEFAULT_INTENSITY_PATTERN.to_string(),
            forest: IsolationForestConfig::default(),
        }
    }
}

impl IntensityFilterConfig {
    /// Set contamination
    pub fn with_contamination(mut self, contamination: f64) -> Self {
        self.contamination = contamination;
        self
    }

    /// Set per-channel detection
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channel_names = Some(channels);
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.forest.seed = seed;
        self
    }
}

/// Remove cells flagged as intensity outliers.
///
/// Each detector flags exactly `floor(contamination × n)` cells; a cell
/// flagged by any detector is dropped. The count is relative to the input,
/// so applying the filter again to its own output removes another
/// `floor(contamination × n')` cells.
///
/// # Errors
/// * `Config` if `contamination` is outside [0, 1) or the pattern is invalid
/// * `AlignmentPrecondition` if a selected feature holds missing or infinite values
pub fn filter_intensity(
    metadata: &CellMetadata,
    features: &FeatureMatrix,
    config: &IntensityFilterConfig,
) -> Result<Filtered> {
    check_aligned(metadata, features)?;
    if !(0.0..1.0).contains(&config.contamination) {
        return Err(OpsError::config("contamination", config.contamination));
    }
    let pattern = Regex::new(&config.intensity_pattern)
        .map_err(|e| OpsError::config("intensity_pattern", e))?;

    let intensity: Vec<usize> = features
        .feature_names()
        .iter()
        .enumerate()
        .filter(|(_, name)| pattern.is_match(name))
        .map(|(j, _)| j)
        .collect();

    let n = features.n_cells();
    let all_rows: Vec<usize> = (0..n).collect();
    if intensity.is_empty() {
        log::warn!("No intensity features found; skipping intensity outlier filter");
        return Ok(Filtered::keep_rows("intensity filter", metadata, features, &all_rows));
    }
    if config.contamination == 0.0 || n < 2 {
        return Ok(Filtered::keep_rows("intensity filter", metadata, features, &all_rows));
    }

    let detectors: Vec<(String, Vec<usize>)> = match &config.channel_names {
        None => vec![("all channels".to_string(), intensity)],
        Some(channels) => {
            let mut groups = Vec::with_capacity(channels.len());
            for channel in channels {
                let re = channel_regex(channel)?;
                let cols: Vec<usize> = intensity
                    .iter()
                    .copied()
                    .filter(|&j| re.is_match(&features.feature_names()[j]))
                    .collect();
                if cols.is_empty() {
                    log::warn!("No intensity features for channel '{}'; detector skipped", channel);
                    continue;
                }
                groups.push((channel.clone(), cols));
            }
            groups
        }
    };

    let mut flagged = vec![false; n];
    for (label, cols) in &detectors {
        let subset = features.subset_features(cols)?;
        if let Some(j) = (0..subset.n_features())
            .find(|&j| subset.matrix().column(j).iter().any(|v| !v.is_finite()))
        {
            return Err(OpsError::AlignmentPrecondition(format!(
                "intensity feature '{}' holds missing or infinite values",
                subset.feature_names()[j]
            )));
        }
        let forest = IsolationForest::fit(subset.matrix(), &config.forest)?;
        let scores = forest.score_samples(subset.matrix())?;
        let flags = flag_outliers(&scores, config.contamination);
        log::debug!(
            "Detector '{}' over {} feature(s) flagged {} cells",
            label,
            cols.len(),
            flags.iter().filter(|&&f| f).count()
        );
        for (acc, f) in flagged.iter_mut().zip(flags) {
            *acc |= f;
        }
    }

    let keep: Vec<usize> = (0..n).filter(|&i| !flagged[i]).collect();
    Ok(Filtered::keep_rows("intensity filter", metadata, features, &keep))
}
