//! Standalone topology driver.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use munet::{config::CONFIG_STEM, state, Config, Error, Topology, TopologyOptions};

/// Build and run a virtual network topology. Requires CAP_SYS_ADMIN
/// (typically via sudo).
#[derive(Parser, Debug)]
#[command(name = "munet", version, about)]
struct Args {
    /// Config file, or stem probed as <stem>.{json,yaml,toml}.
    #[arg(default_value = CONFIG_STEM)]
    config: String,

    /// Log level (trace, debug, info, warn, error) or filter directives.
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Don't offer interactive command execution (the topology still runs
    /// until its processes exit or a signal arrives).
    #[arg(long)]
    no_interactive: bool,

    /// Build the topology and idle; tear down on SIGINT/SIGTERM.
    #[arg(long)]
    topology_only: bool,

    /// Tear down a previously named run and exit.
    #[arg(long, value_name = "RUN_ID")]
    cleanup_only: Option<String>,

    /// Tear the whole topology down when any node command exits non-zero.
    #[arg(long)]
    fail_on_exit: bool,

    /// Runtime directory (default: $MUNET_RUNDIR or /tmp/munet).
    #[arg(long)]
    rundir: Option<PathBuf>,

    /// Name this run (default: munet-<pid>).
    #[arg(long)]
    run_id: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(kind = error.kind_name(), "{error}");
            ExitCode::from(error.exit_code().clamp(0, 255) as u8)
        }
    }
}

async fn run(args: Args) -> munet::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::PermissionDenied(
            "munet needs CAP_SYS_ADMIN to create namespaces; run it with sudo".into(),
        ));
    }

    let rundir = args.rundir.clone().unwrap_or_else(state::default_rundir);

    if let Some(run_id) = &args.cleanup_only {
        return state::cleanup_run(&rundir, run_id).await;
    }

    let config = Config::load(&args.config)?;
    tracing::info!(
        config = %config.config_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        nodes = config.topology.nodes.len(),
        networks = config.topology.networks.len(),
        "loaded topology"
    );

    let options = TopologyOptions {
        rundir: Some(rundir),
        run_id: args.run_id.clone(),
        fail_on_exit: args.fail_on_exit,
    };
    let mut topology = Topology::build(config, options)?;

    topology.bring_up().await?;
    topology.run(args.topology_only).await
}
