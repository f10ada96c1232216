use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shiftcopy_core::{calc_hours, CopyStrategy, PatternSource, WeekPattern};
use shiftcopy_sync::{CopyConfig, CopyEngine, CopyRequest, StoreBackend};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "shiftcopy-cli")]
#[command(about = "Copy weekly shift patterns onto salon employees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Print the pattern a source resolves to, with its weekly hours.
    Pattern(SourceArgs),
    /// Dry run: classify every interval per target without writing.
    Preview(CopyArgs),
    /// Write the copy, target by target.
    Apply(CopyArgs),
    /// Serve the JSON API.
    Serve,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Copy from this employee's current shifts.
    #[arg(long, value_name = "EMPLOYEE_ID")]
    employee: Option<Uuid>,
    /// Copy from the salon's opening hours.
    #[arg(long)]
    opening_hours: bool,
    /// Copy an edited pattern saved as JSON.
    #[arg(long, value_name = "FILE")]
    pattern_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CopyArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Target employee; repeat for several.
    #[arg(long = "target", value_name = "EMPLOYEE_ID")]
    targets: Vec<Uuid>,
    /// Target every employee except the source employee.
    #[arg(long, conflicts_with = "targets")]
    all: bool,
    #[arg(long, default_value_t = CopyStrategy::Additive)]
    strategy: CopyStrategy,
}

#[derive(Serialize)]
struct PatternOutput<'a> {
    pattern: &'a WeekPattern,
    hours: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CopyConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            shiftcopy_storage::migrate(&config.database_url)
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => shiftcopy_web::serve_from_env().await?,
        Commands::Pattern(source) => {
            let backend = StoreBackend::from_config(&config).await?;
            let engine = CopyEngine::new(backend.shift_store());
            let pattern = load_pattern(&engine, &source).await?;
            print_json(&PatternOutput {
                hours: calc_hours(&pattern),
                pattern: &pattern,
            })?;
        }
        Commands::Preview(args) => {
            let backend = StoreBackend::from_config(&config).await?;
            let engine = CopyEngine::new(backend.shift_store());
            let request = build_request(&engine, args).await?;
            print_json(&engine.preview(&request).await?)?;
        }
        Commands::Apply(args) => {
            let backend = StoreBackend::from_config(&config).await?;
            let engine = CopyEngine::new(backend.shift_store())
                .with_apply_concurrency(config.apply_concurrency);
            let request = build_request(&engine, args).await?;
            let applied = backend.persist_applied(engine.apply(&request).await?).await;
            print_json(&applied)?;
            if let Some(err) = &applied.persist_error {
                bail!("copy applied but not saved: {err}");
            }
            let result = &applied.result;
            if !result.errors.is_empty() {
                bail!(
                    "{} of {} targets failed; rerun with only the failed targets: {}",
                    result.errors.len(),
                    result.per_target.len(),
                    result
                        .failed_targets()
                        .iter()
                        .map(|id| format!("--target {id}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
        }
    }

    Ok(())
}

async fn load_pattern(engine: &CopyEngine, source: &SourceArgs) -> Result<WeekPattern> {
    if let Some(path) = &source.pattern_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()));
    }
    let pattern_source = match source.employee {
        Some(employee_id) => PatternSource::Employee { employee_id },
        None => PatternSource::OpeningHours,
    };
    Ok(engine.resolve_pattern(&pattern_source).await?)
}

async fn build_request(engine: &CopyEngine, args: CopyArgs) -> Result<CopyRequest> {
    let pattern = load_pattern(engine, &args.source).await?;
    let targets = if args.all {
        engine
            .store()
            .employees()
            .await?
            .into_iter()
            .map(|e| e.id)
            .filter(|id| Some(*id) != args.source.employee)
            .collect()
    } else {
        args.targets
    };
    Ok(CopyRequest::new(pattern, targets, args.strategy))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_parses_targets_and_strategy() {
        let target = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "shiftcopy-cli",
            "apply",
            "--opening-hours",
            "--target",
            &target.to_string(),
            "--strategy",
            "replace",
        ])
        .expect("valid args");
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert!(args.source.opening_hours);
        assert_eq!(args.targets, vec![target]);
        assert_eq!(args.strategy, CopyStrategy::Replace);
    }

    #[test]
    fn pattern_output_carries_hours_next_to_pattern() {
        let mut pattern = WeekPattern::empty();
        pattern.add_interval(
            shiftcopy_core::WEEKDAYS[0],
            shiftcopy_core::Interval::parse("09:00", "13:30").expect("interval"),
        );
        let json = serde_json::to_value(PatternOutput {
            hours: calc_hours(&pattern),
            pattern: &pattern,
        })
        .expect("json");
        assert_eq!(json["hours"], 4.5);
        assert_eq!(json["pattern"]["days"][0]["intervals"][0]["end"], "13:30");
    }

    #[test]
    fn source_flags_are_mutually_exclusive() {
        let err = Cli::try_parse_from([
            "shiftcopy-cli",
            "preview",
            "--opening-hours",
            "--employee",
            &Uuid::new_v4().to_string(),
        ]);
        assert!(err.is_err());
        assert!(Cli::try_parse_from(["shiftcopy-cli", "preview", "--all"]).is_err());
    }
}
