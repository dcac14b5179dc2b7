//! Channel-aware feature subsetting.
//!
//! Feature names carry channel tokens separated by underscores, e.g.
//! `nucleus_DAPI_mean_intensity` or `cell_COXIV_DAPI_correlation`. A channel
//! is mentioned when its name appears as a whole token, case-insensitively.

use crate::data::FeatureMatrix;
use crate::error::{OpsError, Result};
use regex::Regex;

/// Build the token matcher for a channel name.
pub fn channel_regex(channel: &str) -> Result<Regex> {
    if channel.trim().is_empty() {
        return Err(OpsError::config("channel_names", "empty channel name"));
    }
    let pattern = format!("(?i)(^|_){}(_|$)", regex::escape(channel));
    Regex::new(&pattern).map_err(|e| OpsError::config("channel_names", e))
}

/// Indices of features whose name mentions `channel`.
pub fn features_mentioning(features: &FeatureMatrix, channel: &str) -> Result<Vec<usize>> {
    let re = channel_regex(channel)?;
    Ok(features
        .feature_names()
        .iter()
        .enumerate()
        .filter(|(_, name)| re.is_match(name))
        .map(|(j, _)| j)
        .collect())
}

/// Restrict a feature matrix to a channel combination.
pub trait ChannelSubsetter {
    /// Keep the features relevant to `channels`.
    fn subset(&self, features: &FeatureMatrix, channels: &[String]) -> Result<FeatureMatrix>;
}

/// Subsets by channel tokens in feature names.
///
/// A feature is kept if every channel it mentions is in the subset. Features
/// mentioning no known channel (morphology, position) are always kept.
#[derive(Debug, Clone)]
pub struct NameChannelSubsetter {
    all_channels: Vec<String>,
}

impl NameChannelSubsetter {
    /// Create a subsetter over the full set of acquired channels.
    pub fn new(all_channels: Vec<String>) -> Self {
        Self { all_channels }
    }

    /// All channels known to this subsetter.
    pub fn all_channels(&self) -> &[String] {
        &self.all_channels
    }
}

impl ChannelSubsetter for NameChannelSubsetter {
    fn subset(&self, features: &FeatureMatrix, channels: &[String]) -> Result<FeatureMatrix> {
        if let Some(unknown) = channels.iter().find(|c| !self.all_channels.contains(c)) {
            return Err(OpsError::config("channel_combo", unknown));
        }
        let matchers = self
            .all_channels
            .iter()
            .map(|c| Ok((c, channel_regex(c)?)))
            .collect::<Result<Vec<_>>>()?;

        let keep: Vec<usize> = features
            .feature_names()
            .iter()
            .enumerate()
            .filter(|(_, name)| {
                matchers
                    .iter()
                    .filter(|(_, re)| re.is_match(name))
                    .all(|(c, _)| channels.contains(c))
            })
            .map(|(j, _)| j)
            .collect();

        log::debug!(
            "Channel subset {:?} keeps {} of {} features",
            channels,
            keep.len(),
            features.n_features()
        );
        features.subset_features(&keep)
    }
}
