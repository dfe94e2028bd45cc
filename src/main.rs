use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use cpu_topology::affinity::PinnedRunner;
use cpu_topology::logging::init_logging;
use cpu_topology::opcode::RecordedCpuid;
use cpu_topology::{DiscoveryOptions, Gatherer, ProfileCache};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cpu-topology")]
#[command(about = "Print the processor, cache and core topology of this machine as JSON", long_about = None)]
struct Args {
    /// Sample the cycle counter on every core to estimate clock speeds
    #[arg(long)]
    measure_clock: bool,

    /// Ignore the memoized profile and probe again
    #[arg(long)]
    fresh: bool,

    /// Options file (defaults to cpu-topology.json next to the executable)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Answer identification from a recorded leaf dump instead of the processor
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Do not restrict per-core workers to their core
    #[arg(long)]
    no_pin: bool,

    /// Store the effective options in the options file
    #[arg(long)]
    save_config: bool,

    /// Print JSON on a single line
    #[arg(long)]
    compact: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,
}

fn load_options(args: &Args) -> DiscoveryOptions {
    let loaded = match &args.config {
        Some(path) => DiscoveryOptions::load(path),
        None => DiscoveryOptions::load_or_default(),
    };
    let mut options = match loaded {
        Ok(options) => options,
        Err(e) => {
            error!(error = %e, "failed to load options");
            process::exit(2);
        }
    };
    options.measure_clock_speed |= args.measure_clock;
    options.invalidate_cache |= args.fresh;
    if args.no_pin {
        options.pin_threads = false;
    }
    options
}

fn build_gatherer(args: &Args) -> Gatherer {
    let Some(path) = &args.replay else {
        return Gatherer::new();
    };
    let recorded = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|json| RecordedCpuid::from_json(&json).map_err(|e| e.to_string()));
    let recorded = match recorded {
        Ok(recorded) => recorded,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read leaf dump");
            process::exit(2);
        }
    };

    let mut builder = Gatherer::builder()
        .runner(PinnedRunner::unpinned())
        .cache(Arc::new(ProfileCache::new()));
    if let Some(cores) = recorded.core_count() {
        builder = builder.logical_cores(cores);
    }
    builder.cpuid(Arc::new(recorded)).build()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log = init_logging(args.verbose);

    let options = load_options(&args);
    if args.save_config {
        let path = args.config.clone().unwrap_or_else(DiscoveryOptions::default_path);
        match options.save_to_path(&path) {
            Ok(()) => info!(path = %path.display(), "options saved"),
            Err(e) => error!(error = %e, "failed to save options"),
        }
    }
    let gatherer = build_gatherer(&args);
    let profile = gatherer.gather(&options).await;
    info!(
        cpus = profile.cpus.len(),
        logical_cores = profile.total_logical_cores(),
        "discovery finished"
    );

    let json = if args.compact {
        serde_json::to_string(&*profile)
    } else {
        serde_json::to_string_pretty(&*profile)
    };
    match json {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!(error = %e, "failed to serialize profile");
            process::exit(1);
        }
    }
}
