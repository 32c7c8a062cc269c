mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Apply {
            assume_empty,
            namespace,
            new_cluster,
            cluster,
            api,
            stack,
            cloud,
            threads,
            substitutions,
        } => {
            commands::apply(
                assume_empty,
                namespace,
                new_cluster,
                cluster,
                api,
                stack,
                cloud,
                threads,
                substitutions,
            )
            .await
        }
        Command::Detect { namespace, cloud, json, threads } => {
            commands::detect(namespace, cloud, json, threads).await
        }
        Command::Clean { namespace, cloud, threads } => {
            commands::clean(namespace, cloud, threads).await
        }
        Command::Deploy {
            cfg,
            suffix,
            mappings,
            key,
            cleanup,
            retry_count,
            incremental,
            name,
        } => {
            commands::deploy(cfg, suffix, mappings, key, cleanup, retry_count, incremental, name)
                .await
        }
        Command::Cleanup { log } => commands::cleanup(log).await,
        Command::ListRefs { tmpl, stack } => commands::list_refs(tmpl, stack),
    }
}
