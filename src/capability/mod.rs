//! Pluggable cell classification and channel subsetting.

pub mod channel;
pub mod classifier;

pub use channel::{channel_regex, features_mentioning, ChannelSubsetter, NameChannelSubsetter};
pub use classifier::{CellClassifier, ClassRule, RuleClassifier, CLASS_COL, CONFIDENCE_COL};
