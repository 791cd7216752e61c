use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::Parser;
use failure;
use tracing_subscriber::EnvFilter;

use sbr_serving::artifact::{self, ScoringArtifact};
use sbr_serving::batch::{Batch, BatchAssembler};
use sbr_serving::consistency::{compare, score_all};
use sbr_serving::data::read_instances;
use sbr_serving::evaluation::{evaluate, predictions, Auc, LogLoss, Metric, Mrr};
use sbr_serving::models::attention::Hyperparameters;
use sbr_serving::vocabulary::Vocabularies;
use sbr_serving::DataError;

/// Train a model, export it, reload it frozen and check both score
/// a test log identically.
#[derive(Parser, Debug)]
#[command(name = "serving-consistency")]
struct Cli {
    /// Tab-delimited training log.
    #[arg(long)]
    train: PathBuf,
    /// Tab-delimited test log.
    #[arg(long)]
    test: PathBuf,
    /// JSON hyperparameter file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where to write the exported artifact.
    #[arg(long, default_value = "artifact.json")]
    artifact: PathBuf,
    /// Where to write the frozen scores, one per line.
    #[arg(long)]
    scores: Option<PathBuf>,
    /// Directory to write the vocabularies to.
    #[arg(long)]
    vocabularies: Option<PathBuf>,
    /// Largest acceptable relative error between the two scorers.
    #[arg(long, default_value_t = 1e-4)]
    tolerance: f32,
}

fn batches(
    path: &Path,
    vocabularies: &Vocabularies,
    assembler: &BatchAssembler,
    batch_size: usize,
) -> Result<Vec<Batch>, failure::Error> {
    let instances = read_instances(path)?;

    if instances.is_empty() {
        return Err(DataError::EmptyBatch.into());
    }

    let mapped = vocabularies.map_all(&instances);
    let batches = assembler
        .minibatches(&mapped, batch_size)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(batches)
}

fn write_scores(path: &Path, scores: &[f32]) -> Result<(), failure::Error> {
    let mut writer = BufWriter::new(File::create(path)?);

    for score in scores {
        writeln!(writer, "{}", score)?;
    }

    Ok(())
}

fn save_vocabularies(dir: &Path, vocabularies: &Vocabularies) -> Result<(), failure::Error> {
    fs::create_dir_all(dir)?;

    vocabularies.users().save(dir.join("users.json"))?;
    vocabularies.items().save(dir.join("items.json"))?;
    vocabularies.categories().save(dir.join("categories.json"))?;

    Ok(())
}

fn run(cli: &Cli) -> Result<bool, failure::Error> {
    let train = read_instances(&cli.train)?;
    let vocabularies = Vocabularies::build(&train);

    if let Some(dir) = &cli.vocabularies {
        save_vocabularies(dir, &vocabularies)?;
    }

    let hyper = match &cli.config {
        Some(path) => Hyperparameters::from_file(path)?,
        None => Hyperparameters::default(),
    }
    .num_items(vocabularies.items().len())
    .num_categories(vocabularies.categories().len());

    let assembler = hyper.assembler();
    let batch_size = hyper.get_batch_size();

    let train_batches = batches(&cli.train, &vocabularies, &assembler, batch_size)?;
    let test_batches = batches(&cli.test, &vocabularies, &assembler, batch_size)?;

    let mut model = hyper.build();

    let start = Instant::now();
    let loss = model.fit(&train_batches)?;
    println!("Fitted in {:#?}, final loss {}", start.elapsed(), loss);

    let offline = score_all(&model, &test_batches)?;

    artifact::export(&model).save(&cli.artifact)?;
    let frozen = artifact::load(ScoringArtifact::read(&cli.artifact)?)?;
    let online = score_all(&frozen, &test_batches)?;

    if let Some(path) = &cli.scores {
        write_scores(path, &online)?;
    }

    let metrics: [&dyn Metric; 3] = [&Auc, &LogLoss, &Mrr];
    for (name, value) in evaluate(&metrics, &predictions(&test_batches, &online)) {
        match value {
            Some(value) => println!("{}: {}", name, value),
            None => println!("{}: undefined", name),
        }
    }

    let report = compare(&offline, &online, cli.tolerance);

    println!(
        "Compared {} instances: {} mismatches, max relative error {}",
        report.compared, report.mismatches, report.max_relative_error
    );
    if let Some(mismatch) = &report.first_mismatch {
        println!(
            "First mismatch at instance {}: offline {} online {} (delta {})",
            mismatch.index, mismatch.offline, mismatch.online, mismatch.delta
        );
    }

    Ok(report.is_consistent())
}

/// Directives from the environment win; without usable ones, log at info.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn main() {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(directives.as_deref()))
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(error) => {
            eprintln!("Error: {}", error);
            process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn environment_directives_override_default_level() {
        assert_eq!(
            log_filter(Some("debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(
            log_filter(Some("warn")).max_level_hint(),
            Some(LevelFilter::WARN)
        );
    }

    #[test]
    fn default_level_is_info() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
    }
}
