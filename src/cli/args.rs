// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "k8s-replicator")]
#[command(author, version, about = "Label-scoped Kubernetes caches for replicated objects")]
pub struct Args {
    /// Kubernetes context to use (defaults to in-cluster config or the current context)
    #[arg(short, long, value_name = "CONTEXT")]
    pub context: Option<String>,

    /// Mandatory label selector for tracked resources
    /// Example: -r "replicator.nadundesilva.github.io/object-type=replicated"
    #[arg(short, long, value_name = "SELECTOR")]
    pub resource_selector: Option<String>,

    /// Mandatory label selector for namespaces
    /// Example: -n "team in (platform,infra)"
    #[arg(short, long, value_name = "SELECTOR")]
    pub namespace_selector: Option<String>,

    /// Resource kinds to cache, comma-separated (configmaps, secrets)
    #[arg(long, value_name = "KINDS")]
    pub resources: Option<String>,

    /// Full re-list interval in seconds
    #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    pub resync_period: Option<u64>,

    /// Persist the effective settings to the config file
    #[arg(long)]
    pub save_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Overlay command line flags onto a loaded config
    pub fn apply_to(&self, config: &mut k8s_replicator::config::Config) {
        if let Some(ref context) = self.context {
            config.context = Some(context.clone());
        }
        if let Some(ref selector) = self.resource_selector {
            config.resource_selector = selector.clone();
        }
        if let Some(ref selector) = self.namespace_selector {
            config.namespace_selector = selector.clone();
        }
        if let Some(ref resources) = self.resources {
            config.resources = resources
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(secs) = self.resync_period {
            config.resync_period_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_replicator::config::Config;

    #[test]
    fn test_args_defaults_keep_config() {
        let args = Args::parse_from(["k8s-replicator"]);
        let mut config = Config::default();
        args.apply_to(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "k8s-replicator",
            "-c",
            "prod",
            "-n",
            "team=platform",
            "--resources",
            "secrets, cm",
            "--resync-period",
            "120",
        ]);
        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.context.as_deref(), Some("prod"));
        assert_eq!(config.namespace_selector, "team=platform");
        assert_eq!(config.resources, vec!["secrets", "cm"]);
        assert_eq!(config.resync_period_secs, 120);
    }

    #[test]
    fn test_args_reject_zero_resync_period() {
        assert!(Args::try_parse_from(["k8s-replicator", "--resync-period", "0"]).is_err());
        assert!(Args::try_parse_from(["k8s-replicator", "--resync-period", "1"]).is_ok());
    }
}
