use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use sc_compiler::FileCache;
use sc_environ::ConfigStore;
use sc_engine::{ProgressSink, RunConfig, Session};

use shadercombo::{flags_from_switches, parse_include_manifest, parse_manifest, MovingAverage, ProcessBackend};

/// Batch shader-combo build engine: enumerates a preprocessor combo space
/// from a configuration manifest, compiles every combo, packs the results
/// and emits one `.vcs` container per shader.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration manifest (the `#BEGIN .. #END` shader list).
    manifest: PathBuf,

    /// Directory containing the shader sources the manifest refers to.
    #[arg(long = "shaderpath", default_value = ".")]
    shader_path: PathBuf,

    /// Directory `.vcs` containers are written to.
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Path to the external compiler-backend executable.
    #[arg(long, default_value = "shadercombo-backend")]
    compiler: PathBuf,

    /// Target shader profile forwarded to the back end (e.g. `ps_3_0`).
    #[arg(long, default_value = "ps_3_0")]
    target_profile: String,

    /// Worker thread count (defaults to available parallelism).
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long = "partial-precision")]
    partial_precision: bool,
    #[arg(long = "no-validation")]
    no_validation: bool,
    #[arg(long = "disable-preshader")]
    disable_preshader: bool,
    #[arg(long = "no-flow-control")]
    no_flow_control: bool,
    #[arg(long = "prefer-flow-control")]
    prefer_flow_control: bool,
    #[arg(long = "disable-optimization")]
    disable_optimization: bool,

    /// Print per-combo listings and periodic throughput progress.
    #[arg(long)]
    verbose: bool,
}

struct LoggingProgress {
    verbose: bool,
}

impl ProgressSink for LoggingProgress {
    fn on_command_complete(&self, command_number: u64, total_commands: u64) {
        if self.verbose && total_commands > 0 && command_number % 1000 == 0 {
            info!("progress: {command_number}/{total_commands} commands complete");
        }
        debug!("command {command_number} complete");
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let entries =
        parse_manifest(&cli.manifest).with_context(|| format!("parsing {}", cli.manifest.display()))?;
    info!("loaded {} shader entries", entries.len());

    let include_manifest = sibling_path(&cli.manifest, "uniquefilestocopy.txt");
    let file_cache = if include_manifest.exists() {
        let paths = parse_include_manifest(&include_manifest)
            .with_context(|| format!("parsing {}", include_manifest.display()))?;
        FileCache::from_manifest_paths(&cli.shader_path, &paths)
            .context("building include-file cache")?
    } else {
        FileCache::new()
    };

    let config = ConfigStore::build(entries).context("building configuration store")?;

    let flags = flags_from_switches(
        cli.partial_precision,
        cli.no_validation,
        cli.disable_preshader,
        cli.no_flow_control,
        cli.prefer_flow_control,
        cli.disable_optimization,
    );

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("creating output directory {}", cli.output.display()))?;

    let backend = Arc::new(ProcessBackend::new(cli.compiler.clone()));
    let progress: Arc<dyn ProgressSink> = Arc::new(LoggingProgress {
        verbose: cli.verbose,
    });

    let session = Session::new(
        &config,
        backend,
        Arc::new(file_cache),
        cli.shader_path.clone(),
        cli.output.clone(),
        cli.target_profile.clone(),
        flags,
        Some(progress),
    );

    let run_config = match cli.threads {
        Some(n) => RunConfig { num_workers: n.max(1) },
        None => RunConfig::default_parallelism(),
    };

    let started = Instant::now();
    let report = session.run(run_config);
    let elapsed = started.elapsed();

    if cli.verbose {
        let mut avg = MovingAverage::new(1);
        let rate = if elapsed.as_secs_f64() > 0.0 {
            config.total_commands() as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        avg.push_value(rate);
        info!(
            "compiled {} commands in {:.2}s ({:.1} combos/sec)",
            config.total_commands(),
            elapsed.as_secs_f64(),
            avg.get_average()
        );
    }

    print_listing_table(&report.messages);

    std::process::exit(report.shaders_with_errors as i32);
}

fn sibling_path(manifest: &std::path::Path, name: &str) -> PathBuf {
    manifest
        .parent()
        .map(|p| p.join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// One line per unique diagnostic message, per §7's `CompileListing`
/// dedup table: first offending command and total occurrence count.
fn print_listing_table(messages: &std::collections::HashMap<String, sc_engine::MessageRecord>) {
    if messages.is_empty() {
        return;
    }
    let mut rows: Vec<(&String, &sc_engine::MessageRecord)> = messages.iter().collect();
    rows.sort_by_key(|(_, r)| r.first_command);
    println!("{} unique diagnostic message(s):", rows.len());
    for (text, record) in rows {
        println!(
            "  [first @ {}, x{}] {}",
            record.first_command, record.count, text
        );
    }
}
