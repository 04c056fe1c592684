use clap::Parser;
use conduit::config::RuntimeConfig;
use conduit::map::spec::parse_map_spec;
use conduit::redistribute::{self, Scenario};
use conduit::report::{self, ProcessReport};
use conduit::stats::TransferStats;
use conduit::transfer::TransferKind;
use conduit::LocalWorld;
use std::io;
use std::sync::Arc;

/// Stream array frames between two process groups with different layouts
#[derive(Parser)]
#[command(name = "conduit", version)]
struct Cli {
    /// Source layout, e.g. "block(4)" or "block(2) x cyclic(2)"
    #[arg(long, default_value = "block(4)")]
    src: String,

    /// Destination layout
    #[arg(long, default_value = "cyclic(3)")]
    dst: String,

    /// Array shape, comma separated
    #[arg(long, value_delimiter = ',', default_value = "100")]
    shape: Vec<usize>,

    /// Frames to stream
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Buffer slots per connection
    #[arg(long, default_value_t = 2)]
    depth: usize,

    #[arg(long, default_value_t = 1)]
    src_replicas: usize,

    #[arg(long, default_value_t = 1)]
    dst_replicas: usize,

    /// Swap the first two axes between source and destination
    #[arg(long)]
    transpose: bool,

    /// Run the destination on the source's ranks
    #[arg(long)]
    shared_ranks: bool,

    /// Use synchronous hand-off between tasks of one process
    #[arg(long)]
    sync: bool,

    /// Do not send frame sequence numbers
    #[arg(long)]
    no_sequencing: bool,

    /// Stop the destination with an end-of-chunk marker instead of a frame count
    #[arg(long)]
    end_of_chunk: bool,

    /// Run over MPI (one rank per process) instead of local threads
    #[arg(long)]
    mpi: bool,

    /// Write the transfer counters as CSV after the run report
    #[arg(long)]
    counters: bool,

    /// Print transfer stats to stderr
    #[arg(long)]
    stats: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let src = parse_map_spec(&cli.src).unwrap_or_else(|e| {
        eprintln!("Source layout error: {}", e);
        std::process::exit(1);
    });
    let dst = parse_map_spec(&cli.dst).unwrap_or_else(|e| {
        eprintln!("Destination layout error: {}", e);
        std::process::exit(1);
    });

    let scenario = Scenario {
        src,
        dst,
        shape: cli.shape.clone(),
        frames: cli.frames,
        src_replicas: cli.src_replicas,
        dst_replicas: cli.dst_replicas,
        transpose: cli.transpose,
        shared_ranks: cli.shared_ranks,
        end_of_chunk: cli.end_of_chunk,
    };
    let config = RuntimeConfig::default()
        .with_buffer_depth(cli.depth)
        .with_sequencing(!cli.no_sequencing)
        .with_local_transfer(if cli.sync {
            TransferKind::Sync
        } else {
            TransferKind::Async
        });
    config.validate().unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    let stats = Arc::new(TransferStats::new());
    let reports = if cli.mpi {
        run_mpi(&scenario, config, Arc::clone(&stats))
    } else {
        LocalWorld::new(scenario.ranks_needed())
            .with_config(config)
            .with_stats(Arc::clone(&stats))
            .run(|ctx| redistribute::run(ctx, &scenario))
            .map(|per_rank| per_rank.into_iter().flatten().collect::<Vec<_>>())
            .unwrap_or_else(|e| {
                eprintln!("Run error: {}", e);
                std::process::exit(1);
            })
    };

    let mut stdout = io::stdout();
    report::write_run_csv(&reports, &mut stdout).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });
    if cli.counters {
        report::write_stats_csv(&stats.snapshot(), &mut stdout).unwrap_or_else(|e| {
            eprintln!("Output error: {}", e);
            std::process::exit(1);
        });
    }

    if cli.stats {
        stats.display();
    }

    let mismatches: u64 = reports.iter().map(|r| r.mismatches).sum();
    if mismatches > 0 {
        eprintln!("{} mismatched elements", mismatches);
        std::process::exit(2);
    }
}

#[cfg(feature = "distributed")]
fn run_mpi(scenario: &Scenario, config: RuntimeConfig, stats: Arc<TransferStats>) -> Vec<ProcessReport> {
    use conduit::transport::mpi::MpiTransport;
    use conduit::ProcessContext;

    let (_universe, _) = mpi::initialize_with_threading(mpi::Threading::Multiple).unwrap_or_else(|| {
        eprintln!("MPI initialization failed");
        std::process::exit(1);
    });
    let ctx = ProcessContext::with_stats(Arc::new(MpiTransport::new()), config, stats).unwrap_or_else(|e| {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    });
    let _root = ctx.enter_root();
    redistribute::run(&ctx, scenario).unwrap_or_else(|e| {
        eprintln!("Run error on rank {}: {}", ctx.rank(), e);
        std::process::exit(1);
    })
}

#[cfg(not(feature = "distributed"))]
fn run_mpi(_scenario: &Scenario, _config: RuntimeConfig, _stats: Arc<TransferStats>) -> Vec<ProcessReport> {
    eprintln!("--mpi requires a build with the `distributed` feature");
    std::process::exit(1);
}
