// Command-line runner for the preparation and voting batches.
//
//   recurrence_prep prep <config.json> <manifest.csv>
//   recurrence_prep vote <config.json> <manifest.csv> <predictions.csv>

use anyhow::{Context, Result, bail};
use recurrence_prep::{PrepConfig, PrepPipeline};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  recurrence_prep prep <config.json> <manifest.csv>
  recurrence_prep vote <config.json> <manifest.csv> <predictions.csv>";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [command, config, manifest] if command == "prep" => {
            let pipeline = load(config)?;
            let report = pipeline.run(manifest).await?;
            for bucket in &report.buckets {
                match &bucket.outcome {
                    Ok(()) => println!("{}\t{}", bucket.path.display(), bucket.count),
                    Err(err) => println!("{}\tFAILED: {}", bucket.path.display(), err),
                }
            }
            println!(
                "{} built, {} failed, {} skipped; errors in {}",
                report.built,
                report.failed,
                report.skipped,
                report.error_report.display()
            );
            if !report.all_buckets_written() {
                bail!("one or more condition files could not be written");
            }
        }
        [command, config, manifest, predictions] if command == "vote" => {
            let pipeline = load(config)?;
            let report = pipeline.vote(manifest, predictions)?;
            println!(
                "{} subjects, {} decided, {} no data; report in {}",
                report.summary.subjects,
                report.summary.decided,
                report.summary.no_data,
                report.report.display()
            );
        }
        _ => bail!(USAGE),
    }
    Ok(())
}

fn load(path: &str) -> Result<PrepPipeline> {
    let config = PrepConfig::from_json_file(path)?;
    PrepPipeline::new(config).with_context(|| format!("invalid configuration {path}"))
}
