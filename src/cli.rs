use clap::Parser;

use crate::config::Config;

/// Distributed crawler frontier node.
#[derive(Parser, Debug)]
#[command(name = "orbweaver")]
#[command(about = "Distributed web crawler frontier with per-host politeness")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(long, default_value = "orbweaver.toml")]
    pub conf: String,

    /// Node listen address; enables distribution
    #[arg(long)]
    pub addr: Option<String>,

    /// Node to bootstrap the ring from
    #[arg(long)]
    pub bootstrap_node: Option<String>,

    /// Seed list path
    #[arg(long)]
    pub seed: Option<String>,

    /// Crawl scope regex
    #[arg(long)]
    pub scope: Option<String>,

    /// Directory for persistent state
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Worker task count
    #[arg(long)]
    pub workers: Option<usize>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Flags override whatever the config file said.
    pub fn apply(&self, config: &mut Config) {
        if let Some(addr) = &self.addr {
            config.distributed.addr = addr.clone();
        }
        if let Some(bootstrap) = &self.bootstrap_node {
            config.distributed.bootstrap_node = bootstrap.clone();
        }
        if let Some(seed) = &self.seed {
            config.seed = seed.clone();
        }
        if let Some(scope) = &self.scope {
            config.scope = scope.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "orbweaver",
            "--addr",
            "127.0.0.1:7001",
            "--seed",
            "other.txt",
            "--workers",
            "8",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.distributed.addr, "127.0.0.1:7001");
        assert_eq!(config.seed, "other.txt");
        assert_eq!(config.workers, 8);
        assert_eq!(config.data_dir, "./data", "untouched without a flag");
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["orbweaver"]);
        assert_eq!(cli.conf, "orbweaver.toml");
        assert!(cli.addr.is_none());
    }
}
