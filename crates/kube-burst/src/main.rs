use anyhow::Result;
use clap::Parser;
use kube_burst::app::Application;
use kube_burst::config::Cli;
use kube_burst::config::Commands;
use kube_burst::config::DaemonArgs;
use kube_burst::k8s::kube_client;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init();

    tracing::info!("Starting kube-burst {}", &**version::VERSION);

    let config = daemon_args.agent_config();
    tracing::info!(
        node_name = %config.node_name,
        cgroup_path = %config.cgroup_path.display(),
        dry_run = config.dry_run,
        max_burst_percent = config.max_burst_percent,
        watch_timeout = ?config.watch_timeout,
        "agent configuration"
    );

    let client = kube_client::init_kube_client(daemon_args.kubeconfig.clone())
        .await
        .map_err(|report| {
            tracing::error!("{report:?}");
            anyhow::anyhow!("{report}")
        })?;

    Application::new(config, client).run().await
}
