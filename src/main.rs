use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bytetwist::loader::Loader;
use bytetwist::output::{ClassOutputPass, JarOutputPass};
use bytetwist::passes::{self, DEFAULT_PASSES};
use bytetwist::report;
use bytetwist::settings::Settings;

/// CLI arguments for bytetwist execution.
#[derive(Parser, Debug)]
#[command(
    name = "bytetwist",
    about = "Reference-consistent rewriting of JVM class files and JAR files.",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// JSON settings file.
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,
    /// Worker threads for scanning; overrides the settings file.
    #[arg(long, value_name = "N")]
    threads: Option<usize>,
    /// Pass to run, in order. Repeatable; `all` runs the default passes.
    #[arg(long = "pass", value_name = "ID")]
    passes: Vec<String>,
    /// SARIF report destination; `-` or nothing writes to stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    jar_out: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    class_out: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    run(cli)
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if cli.threads.is_some() {
        settings.worker_threads = cli.threads;
    }

    let started_at = Instant::now();
    let mut loader = Loader::new(settings);
    loader.set_input(&cli.input);
    loader
        .scan()
        .with_context(|| format!("failed to scan {}", cli.input.display()))?;

    for id in expand_passes(&cli.passes) {
        let pass = passes::by_name(id).with_context(|| {
            format!(
                "unknown pass `{id}`; expected one of: all, {}",
                DEFAULT_PASSES.join(", ")
            )
        })?;
        loader.add_pass(pass);
    }
    if let Some(path) = &cli.jar_out {
        loader.add_pass(Box::new(JarOutputPass::new(path)));
    }
    if let Some(dir) = &cli.class_out {
        loader.add_pass(Box::new(ClassOutputPass::new(dir)));
    }
    let pipeline = loader.launch()?;

    let (artifacts, class_count) = loader
        .scan_output()
        .map(|scan| (scan.artifacts.clone(), scan.class_count()))
        .unwrap_or_default();
    let artifact_count = artifacts.len();
    let mut results = report::edit_results(&pipeline.edits);
    results.extend(report::cfg_results(loader.program()));
    let invocation = report::build_invocation(std::env::args().collect(), true);
    let sarif = report::build_sarif(artifacts, results, invocation);

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} artifacts={} edits={}",
            started_at.elapsed().as_millis(),
            class_count,
            artifact_count,
            pipeline.edits.len()
        );
    }

    Ok(())
}

fn expand_passes(requested: &[String]) -> Vec<&str> {
    requested
        .iter()
        .flat_map(|id| match id.as_str() {
            "all" => DEFAULT_PASSES.to_vec(),
            other => vec![other],
        })
        .collect()
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
