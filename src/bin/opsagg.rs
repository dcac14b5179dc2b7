//! opsagg - OPS feature alignment and aggregation CLI
//!
//! Command-line interface for turning per-cell feature tables into
//! per-perturbation profiles.

use clap::{Parser, Subcommand, ValueEnum};
use ops_aggregate::combo::{combos_from_tsv, combos_to_tsv, enumerate_combos, AggregateCombo};
use ops_aggregate::data::CellTable;
use ops_aggregate::error::{OpsError, Result};
use ops_aggregate::filter::{filter_intensity, filter_missing, filter_perturbation, filter_queries};
use ops_aggregate::pipeline::{AggregateConfig, Pipeline, PipelineOutput};
use std::path::{Path, PathBuf};

/// Field delimiter of the input table
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Delimiter {
    Tab,
    Comma,
}

impl Delimiter {
    fn byte(self) -> u8 {
        match self {
            Delimiter::Tab => b'\t',
            Delimiter::Comma => b',',
        }
    }
}

/// OPS feature alignment and aggregation
#[derive(Parser)]
#[command(name = "opsagg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Default log filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter, align, and aggregate a per-cell table
    Run {
        /// Path to aggregation configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the per-cell table
        #[arg(short, long)]
        input: PathBuf,

        /// Output TSV (or directory when the config lists work units)
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the aggregated table as JSON
        #[arg(long)]
        json: Option<PathBuf>,

        /// Read only the first N rows
        #[arg(long)]
        max_rows: Option<usize>,

        #[arg(long, value_enum, default_value = "tab")]
        delimiter: Delimiter,
    },

    /// Apply the filter chain only and write the surviving cells
    Filter {
        /// Path to aggregation configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the per-cell table
        #[arg(short, long)]
        input: PathBuf,

        /// Output TSV of surviving cells
        #[arg(short, long)]
        output: PathBuf,

        /// Read only the first N rows
        #[arg(long)]
        max_rows: Option<usize>,

        #[arg(long, value_enum, default_value = "tab")]
        delimiter: Delimiter,
    },

    /// Enumerate plate × well × class × channel work units
    Combos {
        /// Path to aggregation configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the per-cell table
        #[arg(short, long)]
        input: PathBuf,

        /// Output TSV of work units
        #[arg(short, long)]
        output: PathBuf,

        /// Cell classes (comma-separated, "all" for every cell)
        #[arg(long, default_value = "all")]
        cell_classes: String,

        /// Channel combinations: channels comma-separated, combinations
        /// semicolon-separated (e.g. "DAPI,COXIV;DAPI")
        #[arg(long)]
        channel_combos: String,

        #[arg(long, value_enum, default_value = "tab")]
        delimiter: Delimiter,
    },

    /// Generate an example aggregation configuration
    Example {
        /// Output path for the example YAML
        #[arg(short, long, default_value = "aggregate.yaml")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let result = match cli.command {
        Commands::Run {
            config,
            input,
            output,
            json,
            max_rows,
            delimiter,
        } => cmd_run(&config, &input, &output, json.as_deref(), max_rows, delimiter),

        Commands::Filter {
            config,
            input,
            output,
            max_rows,
            delimiter,
        } => cmd_filter(&config, &input, &output, max_rows, delimiter),

        Commands::Combos {
            config,
            input,
            output,
            cell_classes,
            channel_combos,
            delimiter,
        } => cmd_combos(&config, &input, &output, &cell_classes, &channel_combos, delimiter),

        Commands::Example { output } => cmd_example(&output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<AggregateConfig> {
    log::info!("Loading configuration from {}", path.display());
    let config = AggregateConfig::from_yaml_file(path)?;
    config.validate()?;
    Ok(config)
}

/// Run the full pipeline, once or per work unit
fn cmd_run(
    config_path: &Path,
    input: &Path,
    output: &Path,
    json: Option<&Path>,
    max_rows: Option<usize>,
    delimiter: Delimiter,
) -> Result<()> {
    let config = load_config(config_path)?;
    let table = CellTable::from_delimited(input, delimiter.byte(), max_rows)?;
    let metadata_cols = config.resolve_metadata_cols()?;

    match &config.aggregate_combo_fp {
        None => {
            let result = Pipeline::from_config(&config)?.run_table(&table, &metadata_cols)?;
            write_output(&result, output, json)?;
        }
        Some(combo_fp) => {
            let combos = combos_from_tsv(combo_fp)?;
            std::fs::create_dir_all(output)?;
            for combo in &combos {
                let result = run_combo(&config, &table, &metadata_cols, combo)?;
                let path = output.join(format!("{}__aggregated.tsv", combo.output_stem()));
                write_output(&result, &path, None)?;
            }
            log::info!("Ran {} work units into {}", combos.len(), output.display());
        }
    }
    Ok(())
}

fn run_combo(
    config: &AggregateConfig,
    table: &CellTable,
    metadata_cols: &[String],
    combo: &AggregateCombo,
) -> Result<PipelineOutput> {
    log::info!("Work unit {}", combo.output_stem());
    Pipeline::for_combo(config, combo)?.run_table(table, metadata_cols)
}

fn write_output(result: &PipelineOutput, output: &Path, json: Option<&Path>) -> Result<()> {
    result.table.to_tsv(output)?;
    if let Some(json_path) = json {
        result.table.to_json_file(json_path)?;
    }
    log::info!(
        "Wrote {} profiles ({} cells) to {}",
        result.table.len(),
        result.table.total_cells(),
        output.display()
    );
    for stats in &result.filter_stats {
        log::debug!("{}", stats);
    }
    Ok(())
}

/// Apply the filter chain and write surviving cells
fn cmd_filter(
    config_path: &Path,
    input: &Path,
    output: &Path,
    max_rows: Option<usize>,
    delimiter: Delimiter,
) -> Result<()> {
    let config = load_config(config_path)?;
    let table = CellTable::from_delimited(input, delimiter.byte(), max_rows)?;
    let (metadata, features) = table.split(&config.resolve_metadata_cols()?)?;

    let queried = filter_queries(&metadata, &features, &config.filter_queries)?;
    let perturbed =
        filter_perturbation(&queried.metadata, &queried.features, &config.perturbation_name_col)?;
    let complete = filter_missing(
        &perturbed.cells.metadata,
        &perturbed.cells.features,
        &config.missing_value_config(),
    )?;
    let filtered = filter_intensity(
        &complete.metadata,
        &complete.features,
        &config.intensity_config(),
    )?;

    CellTable::from_parts(&filtered.metadata, &filtered.features)?.to_tsv(output)?;
    log::info!(
        "Wrote {} of {} cells to {}",
        filtered.features.n_cells(),
        table.n_rows(),
        output.display()
    );
    Ok(())
}

/// Enumerate work units from observed plate/well pairs
fn cmd_combos(
    config_path: &Path,
    input: &Path,
    output: &Path,
    cell_classes: &str,
    channel_combos: &str,
    delimiter: Delimiter,
) -> Result<()> {
    let config = load_config(config_path)?;
    let table = CellTable::from_delimited(input, delimiter.byte(), None)?;
    let (metadata, _) = table.split(&config.resolve_metadata_cols()?)?;

    let classes = split_list(cell_classes, ',');
    let combos: Vec<Vec<String>> = channel_combos
        .split(';')
        .map(|c| split_list(c, ','))
        .filter(|c| !c.is_empty())
        .collect();
    if let Some(known) = &config.channel_names {
        if let Some(unknown) = combos.iter().flatten().find(|c| !known.contains(c)) {
            return Err(OpsError::config("channel_combos", unknown));
        }
    }

    let units = enumerate_combos(
        &metadata,
        &config.plate_col,
        &config.well_col,
        &classes,
        &combos,
    )?;
    combos_to_tsv(&units, output)?;
    log::info!("Wrote {} work units to {}", units.len(), output.display());
    Ok(())
}

fn split_list(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect()
}

/// Generate example aggregation configuration
fn cmd_example(output: &Path) -> Result<()> {
    let config = AggregateConfig {
        metadata_cols_fp: Some(PathBuf::from("metadata_cols.tsv")),
        collapse_cols: vec!["gene_symbol_0".to_string(), "sgRNA_0".to_string()],
        filter_queries: vec!["mapped_single_gene == True".to_string()],
        perturbation_id_col: Some("sgRNA_0".to_string()),
        channel_names: Some(vec![
            "DAPI".to_string(),
            "COXIV".to_string(),
            "CENPA".to_string(),
            "WGA".to_string(),
        ]),
        ..Default::default()
    };
    let yaml = config.to_yaml()?;
    std::fs::write(output, &yaml)?;
    log::info!("Wrote example configuration to {}", output.display());
    println!("{}", yaml);
    Ok(())
}
