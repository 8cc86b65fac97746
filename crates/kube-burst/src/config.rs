use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use utils::version;

/// Default cgroup v1 `cpu,cpuacct` hierarchy under which kubelet places pods.
pub const DEFAULT_CGROUP_PATH: &str = "/sys/fs/cgroup/cpu,cpuacct/kubepods";

/// Default ceiling for namespace burst percentages.
pub const DEFAULT_MAX_BURST_PERCENT: u32 = 200;

/// Watch streams are closed and reopened after this many seconds.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the burst agent on this node
    Daemon(DaemonArgs),
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "MY_NODE_NAME",
        help = "Name of the node this agent runs on, pods are filtered to this node only"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "CGROUP_PATH",
        default_value = DEFAULT_CGROUP_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the kubepods cpu cgroup hierarchy"
    )]
    pub cgroup_path: PathBuf,

    #[arg(
        long,
        env = "DRY_RUN",
        default_value = "Y",
        value_parser = parse_dry_run,
        action = clap::ArgAction::Set,
        help = "Log burst changes without writing them, set to N to apply changes"
    )]
    pub dry_run: bool,

    #[arg(
        long,
        env = "MAX_BURST_PERCENT",
        default_value_t = DEFAULT_MAX_BURST_PERCENT,
        help = "Highest burst percentage a namespace annotation may request"
    )]
    pub max_burst_percent: u32,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubeconfig file(s), separated like PATH (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "WATCH_TIMEOUT_SECS",
        default_value_t = DEFAULT_WATCH_TIMEOUT_SECS,
        help = "Seconds after which every watch stream is closed and reopened"
    )]
    pub watch_timeout_secs: u64,
}

impl DaemonArgs {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            node_name: self.node_name.clone(),
            cgroup_path: self.cgroup_path.clone(),
            dry_run: self.dry_run,
            max_burst_percent: self.max_burst_percent,
            watch_timeout: Duration::from_secs(self.watch_timeout_secs.max(1)),
        }
    }
}

/// Runtime settings shared by the watchers and the cgroup updater.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub cgroup_path: PathBuf,
    pub dry_run: bool,
    pub max_burst_percent: u32,
    pub watch_timeout: Duration,
}

/// Dry-run stays on unless explicitly switched off.
fn parse_dry_run(s: &str) -> Result<bool, String> {
    match s.trim() {
        "N" | "n" | "no" | "NO" | "false" | "FALSE" | "0" => Ok(false),
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Result<DaemonArgs, clap::Error> {
        let mut argv = vec!["kube-burst", "daemon"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).map(|cli| match cli.command {
            Commands::Daemon(args) => args,
        })
    }

    #[test]
    fn defaults_keep_dry_run_enabled() {
        let args = parse(&["--node-name", "node-a"]).expect("should parse with node name");

        assert_eq!(args.node_name, "node-a");
        assert_eq!(args.cgroup_path, PathBuf::from(DEFAULT_CGROUP_PATH));
        assert!(args.dry_run, "dry run should default to enabled");
        assert_eq!(args.max_burst_percent, 200);
        assert_eq!(args.watch_timeout_secs, 1800);
    }

    #[test]
    fn explicit_n_disables_dry_run() {
        let args = parse(&["--node-name", "node-a", "--dry-run", "N"]).expect("should parse");
        assert!(!args.dry_run);

        let args = parse(&["--node-name", "node-a", "--dry-run", "yes"]).expect("should parse");
        assert!(args.dry_run, "anything but a negative value keeps dry run on");
    }

    #[test]
    fn malformed_ceiling_is_rejected() {
        let result = parse(&["--node-name", "node-a", "--max-burst-percent", "lots"]);
        assert!(result.is_err(), "non-integer ceiling must fail fast");
    }

    #[test]
    fn agent_config_converts_timeout() {
        let args = parse(&[
            "--node-name",
            "node-a",
            "--cgroup-path",
            "/tmp/kubepods",
            "--watch-timeout-secs",
            "60",
        ])
        .expect("should parse");
        let config = args.agent_config();

        assert_eq!(config.cgroup_path, PathBuf::from("/tmp/kubepods"));
        assert_eq!(config.watch_timeout, Duration::from_secs(60));
        assert_eq!(config.max_burst_percent, 200);
    }
}
