//! Pipeline runner for composing and executing alignment and aggregation steps.

use crate::aggregate::{aggregate, AggMethod, AggregateOptions, AggregateTable};
use crate::align::{prepare_alignment_data, BATCH_VALUES_COL};
use crate::capability::{
    CellClassifier, ChannelSubsetter, NameChannelSubsetter, RuleClassifier, CLASS_COL,
};
use crate::combo::AggregateCombo;
use crate::data::{CellMetadata, CellTable, FeatureMatrix};
use crate::embed::{component_names, embed_by_pca, PcaBasis, PcaConfig};
use crate::error::{OpsError, Result};
use crate::filter::{
    filter_intensity, filter_missing, filter_perturbation, filter_queries, FilterStats, Filtered,
    IntensityFilterConfig, MissingValueConfig,
};
use crate::normalize::{tvn_with_summary, BatchWhitening};
use crate::pipeline::config::AggregateConfig;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Cell class meaning "every cell".
pub const ALL_CLASSES: &str = "all";

/// A step in the aggregation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineStep {
    // === Cell selection ===
    /// Assign `class`/`confidence` with rules from a YAML file.
    Classify { rules_path: PathBuf },
    /// Keep cells whose `column` value renders as `value`.
    SelectCells { column: String, value: String },
    /// Keep features relevant to a channel combination.
    SubsetChannels {
        all_channels: Vec<String>,
        channels: Vec<String>,
    },

    // === Filtering ===
    FilterQueries { queries: Vec<String> },
    FilterPerturbation { column: String },
    FilterMissing(MissingValueConfig),
    FilterIntensity(IntensityFilterConfig),

    // === Alignment ===
    PrepareAlignment {
        batch_cols: Vec<String>,
        perturbation_col: String,
        control_key: String,
        perturbation_id_col: Option<String>,
    },
    EmbedPca(PcaConfig),
    NormalizeTvn {
        perturbation_col: String,
        control_key: String,
    },

    // === Aggregation ===
    Aggregate {
        perturbation_col: String,
        method: AggMethod,
        options: AggregateOptions,
    },
}

impl PipelineStep {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStep::Classify { .. } => "classify",
            PipelineStep::SelectCells { .. } => "select_cells",
            PipelineStep::SubsetChannels { .. } => "subset_channels",
            PipelineStep::FilterQueries { .. } => "filter_queries",
            PipelineStep::FilterPerturbation { .. } => "filter_perturbation",
            PipelineStep::FilterMissing(_) => "filter_missing",
            PipelineStep::FilterIntensity(_) => "filter_intensity",
            PipelineStep::PrepareAlignment { .. } => "prepare_alignment",
            PipelineStep::EmbedPca(_) => "embed_pca",
            PipelineStep::NormalizeTvn { .. } => "normalize_tvn",
            PipelineStep::Aggregate { .. } => "aggregate",
        }
    }

    fn changes_rows(&self) -> bool {
        matches!(
            self,
            PipelineStep::SelectCells { .. }
                | PipelineStep::SubsetChannels { .. }
                | PipelineStep::FilterQueries { .. }
                | PipelineStep::FilterPerturbation { .. }
                | PipelineStep::FilterMissing(_)
                | PipelineStep::FilterIntensity(_)
        )
    }
}

/// Everything a pipeline run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Aggregated profiles.
    pub table: AggregateTable,
    /// One entry per filter step, in order.
    pub filter_stats: Vec<FilterStats>,
    /// PCA basis, when an embedding step ran.
    pub basis: Option<PcaBasis>,
    /// Per-batch whitening summaries, when TVN ran.
    pub batches: Vec<BatchWhitening>,
    /// Cell-level metadata at the end of the run.
    pub metadata: CellMetadata,
}

/// Builder for constructing and running aggregation pipelines.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
    name: String,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create a new empty pipeline.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            name: "unnamed".to_string(),
        }
    }

    /// Standard run: classify (if configured), filter, align, embed, normalize, aggregate.
    pub fn from_config(config: &AggregateConfig) -> Result<Self> {
        config.validate()?;
        let mut pipeline = Self::new().name("aggregate");
        if let Some(path) = &config.classifier_path {
            pipeline = pipeline.classify(path.clone());
        }
        Ok(pipeline.with_standard_steps(config))
    }

    /// Standard run restricted to one work unit.
    ///
    /// Cells are restricted to the unit's plate and well, and to its cell
    /// class unless the class is `all`. Features are restricted to the
    /// unit's channel combination.
    pub fn for_combo(config: &AggregateConfig, combo: &AggregateCombo) -> Result<Self> {
        config.validate()?;
        let all_channels = config.channel_names.clone().ok_or_else(|| {
            OpsError::config("channel_names", "required to run a channel combination")
        })?;
        let mut pipeline = Self::new().name(&combo.output_stem());
        if let Some(path) = &config.classifier_path {
            pipeline = pipeline.classify(path.clone());
        }
        pipeline = pipeline
            .select_cells(&config.plate_col, &combo.plate)
            .select_cells(&config.well_col, &combo.well);
        if combo.cell_class != ALL_CLASSES {
            pipeline = pipeline.select_cells(CLASS_COL, &combo.cell_class);
        }
        pipeline = pipeline.subset_channels(all_channels, combo.channel_combo.clone());
        Ok(pipeline.with_standard_steps(config))
    }

    fn with_standard_steps(self, config: &AggregateConfig) -> Self {
        self.filter_queries(&config.filter_queries)
            .filter_perturbation(&config.perturbation_name_col)
            .filter_missing(config.missing_value_config())
            .filter_intensity(config.intensity_config())
            .prepare_alignment(
                &config.batch_cols,
                &config.perturbation_name_col,
                &config.control_key,
                config.perturbation_id_col.as_deref(),
            )
            .embed_pca(config.pca_config())
            .normalize_tvn(&config.perturbation_name_col, &config.control_key)
            .aggregate(
                &config.perturbation_name_col,
                config.agg_method,
                config.aggregate_options(),
            )
    }

    /// Set the pipeline name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Add rule-based classification.
    pub fn classify(mut self, rules_path: PathBuf) -> Self {
        self.steps.push(PipelineStep::Classify { rules_path });
        self
    }

    /// Keep cells with a given value in a metadata column.
    pub fn select_cells(mut self, column: &str, value: &str) -> Self {
        self.steps.push(PipelineStep::SelectCells {
            column: column.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Keep features relevant to `channels`.
    pub fn subset_channels(mut self, all_channels: Vec<String>, channels: Vec<String>) -> Self {
        self.steps.push(PipelineStep::SubsetChannels {
            all_channels,
            channels,
        });
        self
    }

    /// Add query filtering.
    pub fn filter_queries<S: AsRef<str>>(mut self, queries: &[S]) -> Self {
        self.steps.push(PipelineStep::FilterQueries {
            queries: queries.iter().map(|q| q.as_ref().to_string()).collect(),
        });
        self
    }

    /// Drop cells without a perturbation.
    pub fn filter_perturbation(mut self, column: &str) -> Self {
        self.steps.push(PipelineStep::FilterPerturbation {
            column: column.to_string(),
        });
        self
    }

    /// Add missing-value filtering and imputation.
    pub fn filter_missing(mut self, config: MissingValueConfig) -> Self {
        self.steps.push(PipelineStep::FilterMissing(config));
        self
    }

    /// Add intensity outlier filtering.
    pub fn filter_intensity(mut self, config: IntensityFilterConfig) -> Self {
        self.steps.push(PipelineStep::FilterIntensity(config));
        self
    }

    /// Add batch and control annotation.
    pub fn prepare_alignment(
        mut self,
        batch_cols: &[String],
        perturbation_col: &str,
        control_key: &str,
        perturbation_id_col: Option<&str>,
    ) -> Self {
        self.steps.push(PipelineStep::PrepareAlignment {
            batch_cols: batch_cols.to_vec(),
            perturbation_col: perturbation_col.to_string(),
            control_key: control_key.to_string(),
            perturbation_id_col: perturbation_id_col.map(String::from),
        });
        self
    }

    /// Add PCA embedding.
    pub fn embed_pca(mut self, config: PcaConfig) -> Self {
        self.steps.push(PipelineStep::EmbedPca(config));
        self
    }

    /// Add TVN normalization against controls.
    pub fn normalize_tvn(mut self, perturbation_col: &str, control_key: &str) -> Self {
        self.steps.push(PipelineStep::NormalizeTvn {
            perturbation_col: perturbation_col.to_string(),
            control_key: control_key.to_string(),
        });
        self
    }

    /// Add aggregation.
    pub fn aggregate(
        mut self,
        perturbation_col: &str,
        method: AggMethod,
        options: AggregateOptions,
    ) -> Self {
        self.steps.push(PipelineStep::Aggregate {
            perturbation_col: perturbation_col.to_string(),
            method,
            options,
        });
        self
    }

    /// Split a raw table and run the pipeline.
    pub fn run_table(&self, table: &CellTable, metadata_cols: &[String]) -> Result<PipelineOutput> {
        let (metadata, features) = table.split(metadata_cols)?;
        self.run(&metadata, &features)
    }

    /// Run the pipeline on split data.
    pub fn run(&self, metadata: &CellMetadata, features: &FeatureMatrix) -> Result<PipelineOutput> {
        log::info!(
            "Running pipeline '{}' ({} steps) on {} cells × {} features",
            self.name,
            self.steps.len(),
            features.n_cells(),
            features.n_features()
        );
        let mut state = PipelineState::new(metadata.clone(), features.clone());

        for (i, step) in self.steps.iter().enumerate() {
            state = state.apply(step).map_err(|e| OpsError::Step {
                index: i + 1,
                step: step.name().to_string(),
                source: Box::new(e),
            })?;
        }

        state.finalize()
    }
}

/// Internal state during pipeline execution.
struct PipelineState {
    metadata: CellMetadata,
    features: FeatureMatrix,
    embeddings: Option<DMatrix<f64>>,
    basis: Option<PcaBasis>,
    batches: Vec<BatchWhitening>,
    filter_stats: Vec<FilterStats>,
    table: Option<AggregateTable>,
}

impl PipelineState {
    fn new(metadata: CellMetadata, features: FeatureMatrix) -> Self {
        Self {
            metadata,
            features,
            embeddings: None,
            basis: None,
            batches: Vec::new(),
            filter_stats: Vec::new(),
            table: None,
        }
    }

    fn take_filtered(&mut self, filtered: Filtered) {
        self.metadata = filtered.metadata;
        self.features = filtered.features;
        self.filter_stats.push(filtered.stats);
    }

    fn apply(mut self, step: &PipelineStep) -> Result<Self> {
        if step.changes_rows() && self.embeddings.is_some() {
            return Err(OpsError::Pipeline(
                "Cell and feature selection must run before embedding".to_string(),
            ));
        }
        match step {
            // === Cell selection ===
            PipelineStep::Classify { rules_path } => {
                let classifier = RuleClassifier::from_yaml_file(rules_path)?;
                let (metadata, features) = classifier.classify(&self.metadata, &self.features)?;
                self.metadata = metadata;
                self.features = features;
            }
            PipelineStep::SelectCells { column, value } => {
                let keep: Vec<usize> = self
                    .metadata
                    .column(column)?
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.key().as_deref() == Some(value.as_str()))
                    .map(|(i, _)| i)
                    .collect();
                let name = format!("{} == {}", column, value);
                let filtered = Filtered::keep_rows(&name, &self.metadata, &self.features, &keep);
                self.take_filtered(filtered);
            }
            PipelineStep::SubsetChannels {
                all_channels,
                channels,
            } => {
                let subsetter = NameChannelSubsetter::new(all_channels.clone());
                self.features = subsetter.subset(&self.features, channels)?;
            }

            // === Filtering ===
            PipelineStep::FilterQueries { queries } => {
                let filtered = filter_queries(&self.metadata, &self.features, queries)?;
                self.take_filtered(filtered);
            }
            PipelineStep::FilterPerturbation { column } => {
                let filtered = filter_perturbation(&self.metadata, &self.features, column)?;
                self.take_filtered(filtered.cells);
            }
            PipelineStep::FilterMissing(config) => {
                let filtered = filter_missing(&self.metadata, &self.features, config)?;
                self.take_filtered(filtered);
            }
            PipelineStep::FilterIntensity(config) => {
                let filtered = filter_intensity(&self.metadata, &self.features, config)?;
                self.take_filtered(filtered);
            }

            // === Alignment ===
            PipelineStep::PrepareAlignment {
                batch_cols,
                perturbation_col,
                control_key,
                perturbation_id_col,
            } => {
                let (metadata, features) = prepare_alignment_data(
                    &self.metadata,
                    &self.features,
                    batch_cols,
                    perturbation_col,
                    control_key,
                    perturbation_id_col.as_deref(),
                )?;
                self.metadata = metadata;
                self.features = features;
            }
            PipelineStep::EmbedPca(config) => {
                let embedding = embed_by_pca(&self.features, config)?;
                self.embeddings = Some(embedding.embeddings);
                self.basis = Some(embedding.basis);
            }
            PipelineStep::NormalizeTvn {
                perturbation_col,
                control_key,
            } => {
                let embeddings = self.embeddings.as_ref().ok_or_else(|| {
                    OpsError::Pipeline("Must embed before TVN normalization".to_string())
                })?;
                let tvn = tvn_with_summary(
                    embeddings,
                    &self.metadata,
                    perturbation_col,
                    control_key,
                    BATCH_VALUES_COL,
                )?;
                self.embeddings = Some(tvn.data);
                self.batches = tvn.batches;
            }

            // === Aggregation ===
            PipelineStep::Aggregate {
                perturbation_col,
                method,
                options,
            } => {
                let table = match &self.embeddings {
                    Some(embeddings) => {
                        let options = AggregateOptions {
                            feature_names: Some(component_names(embeddings.ncols())),
                            ..options.clone()
                        };
                        aggregate(embeddings, &self.metadata, perturbation_col, *method, &options)?
                    }
                    None => {
                        let options = AggregateOptions {
                            feature_names: Some(self.features.feature_names().to_vec()),
                            ..options.clone()
                        };
                        aggregate(
                            self.features.matrix(),
                            &self.metadata,
                            perturbation_col,
                            *method,
                            &options,
                        )?
                    }
                };
                self.table = Some(table);
            }
        }
        Ok(self)
    }

    fn finalize(self) -> Result<PipelineOutput> {
        let table = self.table.ok_or_else(|| {
            OpsError::Pipeline("Pipeline must include an aggregate step".to_string())
        })?;
        Ok(PipelineOutput {
            table,
            filter_stats: self.filter_stats,
            basis: self.basis,
            batches: self.batches,
            metadata: self.metadata,
        })
    }
}

/// Run the standard pipeline for a configuration on a raw table.
pub fn run_aggregation(config: &AggregateConfig, table: &CellTable) -> Result<PipelineOutput> {
    let metadata_cols = config.resolve_metadata_cols()?;
    Pipeline::from_config(config)?.run_table(table, &metadata_cols)
}
