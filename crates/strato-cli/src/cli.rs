use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "strato",
    about = "Declarative multi-cloud orchestration: reconcile a YAML stack against a live cloud account",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply (launch/update) a stack: create whatever is missing.
    Apply {
        /// Skip detection and treat the cloud as empty.
        #[arg(long)]
        assume_empty: bool,

        /// Only consider resources tagged with this namespace.
        #[arg(long)]
        namespace: Option<String>,

        /// Register a new cluster with the control plane before applying.
        #[arg(long, conflicts_with = "cluster")]
        new_cluster: bool,

        /// Update an already-registered cluster at this URL.
        #[arg(long)]
        cluster: Option<String>,

        /// Control plane base URL used with --new-cluster.
        #[arg(long, env = "STRATO_API", default_value = "https://api.strato.cloud/devel")]
        api: String,

        /// Stack description (YAML).
        #[arg(long, default_value = "stack.yaml")]
        stack: PathBuf,

        /// Cloud config (INI).
        #[arg(long)]
        cloud: PathBuf,

        /// Worker pool width for create/delete batches.
        #[arg(long, default_value_t = 10)]
        threads: usize,

        /// key=value substitutions for script interpolation.
        substitutions: Vec<String>,
    },

    /// Detect and print the current resources in the cloud account.
    Detect {
        #[arg(long)]
        namespace: Option<String>,

        /// Cloud config (INI).
        #[arg(long)]
        cloud: PathBuf,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,

        #[arg(long, default_value_t = 10)]
        threads: usize,
    },

    /// Delete everything the driver detects.
    Clean {
        #[arg(long)]
        namespace: Option<String>,

        #[arg(long, default_value_t = 10)]
        threads: usize,

        /// Cloud config (INI).
        cloud: PathBuf,
    },

    /// Run a named deployment against OpenStack (provision + shell steps).
    Deploy {
        /// Deployment config file.
        #[arg(long, default_value = ".strato.yaml")]
        cfg: PathBuf,

        /// Resource name suffix keeping parallel deployments disjoint.
        #[arg(long)]
        suffix: Option<String>,

        /// Resource map file (INI).
        #[arg(long)]
        mappings: Option<PathBuf>,

        /// Public key file to register as a keypair.
        #[arg(long)]
        key: Option<PathBuf>,

        /// Record created resources here for later `cleanup`.
        #[arg(long)]
        cleanup: Option<PathBuf>,

        /// Retry a failing node build this many times before giving up.
        #[arg(long, default_value_t = 0)]
        retry_count: u32,

        /// Skip resources whose (suffixed) names already exist.
        #[arg(long)]
        incremental: bool,

        /// Deployment to perform.
        name: String,
    },

    /// Tear down resources recorded by a previous deploy, newest first.
    Cleanup {
        /// Cleanup log written by `deploy --cleanup`.
        log: PathBuf,
    },

    /// List the symbolic images/flavors a stack references.
    ListRefs {
        /// Output a template mappings INI instead of text.
        #[arg(long)]
        tmpl: bool,

        /// Stack description (YAML).
        stack: PathBuf,
    },
}
