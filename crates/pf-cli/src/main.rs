//! partforge command-line front end
//!
//! ```bash
//! # Verify the kernel works headless
//! pf check
//!
//! # Build request documents, several at once
//! pf build bracket.json flange.json --format step,stl --out build/
//!
//! # Generate the basket stud
//! pf stud --set prongCount=6 --set includeBackingDisk=false --format stl
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pf_core::{
    BuildOutcome, CancelToken, Dispatcher, ExportFormat, Pipeline, PipelineConfig, basket_stud, cache,
    check_headless,
};
use pf_kernel::{KernelFactory, default_kernel};
use serde_json::{Map, Value};
use tokio::task::JoinSet;

/// Exit status when the headless environment check fails
const ENVIRONMENT_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "pf")]
#[command(version)]
#[command(about = "Headless parametric CAD build-and-export pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pipeline configuration file (RON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the geometry kernel and exit
    Check,

    /// Build JSON request documents
    Build {
        /// Request files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Export formats: step, stl, glb, obj
        #[arg(long, short, value_delimiter = ',', default_value = "step")]
        format: Vec<ExportFormat>,

        /// Output directory
        #[arg(long, short, default_value = ".")]
        out: PathBuf,
    },

    /// Build the basket stud template
    Stud {
        /// Template input, e.g. `stoneDiameterMm=6.5`
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Export formats: step, stl, glb, obj
        #[arg(long, short, value_delimiter = ',', default_value = "stl")]
        format: Vec<ExportFormat>,

        /// Output directory
        #[arg(long, short, default_value = ".")]
        out: PathBuf,

        /// Print the generated request instead of building it
        #[arg(long)]
        print_request: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pf_core=info,pf_kernel=info,pf_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {:#}", error);
            ExitCode::FAILURE
        }
    };
    cache::shutdown_global();
    code
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let report = match check_headless(&default_kernel) {
        Ok(report) => report,
        Err(error) => {
            tracing::error!(%error, "environment check failed");
            eprintln!("{}", error);
            return Ok(ExitCode::from(ENVIRONMENT_FATAL));
        }
    };

    let (requests, formats, out) = match cli.command {
        Command::Check => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Build { files, format, out } => {
            let mut requests = Vec::with_capacity(files.len());
            for file in files {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                requests.push((stem_of(&file), text));
            }
            (requests, format, out)
        }
        Command::Stud {
            set,
            format,
            out,
            print_request,
        } => {
            let request = basket_stud(&parse_assignments(&set)?);
            if print_request {
                println!("{}", serde_json::to_string_pretty(&request)?);
                return Ok(ExitCode::SUCCESS);
            }
            (vec![("stud".to_string(), request.to_string())], format, out)
        }
    };

    let cache = cache::init_global(&config.cache).context("failed to initialize the artifact cache")?;
    let pipeline = Pipeline::new(default_kernel, &config).with_cache(cache);
    let dispatcher = Arc::new(Dispatcher::new(pipeline, &config.workers));

    std::fs::create_dir_all(&out).with_context(|| format!("failed to create {}", out.display()))?;
    build_all(dispatcher, requests, formats, &out).await
}

/// Submit every request at once and write artifacts as they complete
async fn build_all<F: KernelFactory + 'static>(
    dispatcher: Arc<Dispatcher<F>>,
    requests: Vec<(String, String)>,
    formats: Vec<ExportFormat>,
    out: &Path,
) -> Result<ExitCode> {
    let mut tasks = JoinSet::new();
    for (stem, request) in requests {
        let dispatcher = dispatcher.clone();
        let formats = formats.clone();
        tasks.spawn(async move {
            let result = dispatcher.submit(request, formats, CancelToken::new()).await;
            (stem, result)
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let (stem, result) = joined.context("build task failed")?;
        match result {
            Ok(outcome) => write_outcome(&stem, &outcome, out)?,
            Err(failure) => {
                failed += 1;
                tracing::error!(request = %stem, kind = ?failure.kind, "build failed");
                eprintln!("{}: {}", stem, serde_json::to_string(&failure)?);
            }
        }
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn write_outcome(stem: &str, outcome: &BuildOutcome, out: &Path) -> Result<()> {
    for warning in &outcome.warnings {
        eprintln!("{}: warning: {}: {}", stem, warning.node, warning.message);
    }
    for artifact in &outcome.artifacts {
        let path = out.join(artifact.file_name(stem));
        std::fs::write(&path, artifact.bytes()).with_context(|| format!("failed to write {}", path.display()))?;
        println!(
            "{}\t{}\t{} bytes{}",
            path.display(),
            artifact.format.mime_type(),
            artifact.len(),
            if outcome.cache_hit { "\t(cached)" } else { "" }
        );
    }
    Ok(())
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "part".to_string())
}

/// `key=value` pairs; values that read as JSON keep their type, anything else is text
fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{}'", pair);
        };
        let value = serde_json::from_str(value.trim()).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}
