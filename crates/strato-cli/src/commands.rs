use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use strato_config::cloud::{load_cloud_config, parse_mappings_ini, CloudConfig, ProviderKind};
use strato_driver::{
    AwsDriver, AwsDriverConfig, CloudDriver, ClusterClient, DigitalOceanDriver,
    DigitalOceanDriverConfig, DriverOptions, GceDriver, GceDriverConfig, OpenStackCredentials,
    OpenStackDriver, WorkerPool,
};
use strato_runner::{
    cleanup_from_journal, DeploymentConfig, DeploymentRunner, FileJournal,
};
use tracing::info;

use crate::output;

/// `key=value` tokens; the value may itself contain `=`.
fn parse_substitutions(tokens: &[String]) -> Result<HashMap<String, String>> {
    let mut substitutions = HashMap::new();
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            bail!("substitution '{}' is not of the form key=value", token);
        };
        substitutions.insert(key.to_string(), value.to_string());
    }
    Ok(substitutions)
}

fn build_driver(
    cfg: &CloudConfig,
    namespace: Option<String>,
    threads: usize,
    cluster: Option<ClusterClient>,
) -> Result<Arc<dyn CloudDriver>> {
    let options = DriverOptions {
        namespace,
        mappings: cfg.mappings.clone(),
        pool: WorkerPool::new(threads),
        cluster,
    };

    let driver: Arc<dyn CloudDriver> = match cfg.driver {
        ProviderKind::Aws => Arc::new(AwsDriver::new(AwsDriverConfig::from_cloud_config(cfg)?, options)),
        ProviderKind::Gce => {
            Arc::new(GceDriver::from_key_file(GceDriverConfig::from_cloud_config(cfg)?, options)?)
        }
        ProviderKind::DigitalOcean => Arc::new(DigitalOceanDriver::new(
            DigitalOceanDriverConfig::from_cloud_config(cfg)?,
            options,
        )),
        ProviderKind::OpenStack => {
            Arc::new(OpenStackDriver::new(OpenStackCredentials::from_env()?, options))
        }
    };
    Ok(driver)
}

#[allow(clippy::too_many_arguments)]
pub async fn apply(
    assume_empty: bool,
    namespace: Option<String>,
    new_cluster: bool,
    cluster: Option<String>,
    api: String,
    stack: PathBuf,
    cloud: PathBuf,
    threads: usize,
    substitutions: Vec<String>,
) -> Result<()> {
    let substitutions = parse_substitutions(&substitutions)?;
    let desired = strato_config::load(&stack, &substitutions)
        .with_context(|| format!("failed to load stack {}", stack.display()))?;

    let cluster_client = if new_cluster {
        Some(ClusterClient::create(&api).await?)
    } else {
        cluster.map(ClusterClient::at)
    };

    let cfg = load_cloud_config(&cloud)?;
    let driver = build_driver(&cfg, namespace, threads, cluster_client)?;

    let mut resources = desired;
    if !assume_empty {
        let detected = driver.detect_resources().await?;
        resources = &resources - &detected;
    }

    driver.apply_resources(&mut resources).await?;

    print!("{}", output::render_apply_summary(&resources));
    Ok(())
}

pub async fn detect(
    namespace: Option<String>,
    cloud: PathBuf,
    json: bool,
    threads: usize,
) -> Result<()> {
    let cfg = load_cloud_config(&cloud)?;
    let driver = build_driver(&cfg, namespace, threads, None)?;

    let collection = driver.detect_resources().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&collection.to_json())?);
    } else {
        print!("{}", output::render_collection(&collection));
    }
    Ok(())
}

pub async fn clean(namespace: Option<String>, cloud: PathBuf, threads: usize) -> Result<()> {
    let cfg = load_cloud_config(&cloud)?;
    let driver = build_driver(&cfg, namespace, threads, None)?;

    let collection = driver.detect_resources().await?;
    info!(
        "Deleting {} nodes, {} security groups, {} rules",
        collection.nodes.len(),
        collection.security_groups.len(),
        collection.security_group_rules.len()
    );
    driver.clean_resources(&collection).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn deploy(
    cfg: PathBuf,
    suffix: Option<String>,
    mappings: Option<PathBuf>,
    key: Option<PathBuf>,
    cleanup: Option<PathBuf>,
    retry_count: u32,
    incremental: bool,
    name: String,
) -> Result<()> {
    let config = DeploymentConfig::load(&cfg)
        .with_context(|| format!("failed to load deployment config {}", cfg.display()))?;

    let mappings = match mappings {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read mappings {}", path.display()))?;
            parse_mappings_ini(&content)
        }
        None => Default::default(),
    };

    let key = match key {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read key {}", path.display()))?,
        ),
        None => None,
    };

    let mut driver = OpenStackDriver::new(OpenStackCredentials::from_env()?, DriverOptions::default());
    if let Some(log) = cleanup {
        driver = driver.with_recorder(Arc::new(FileJournal::new(log)));
    }

    let mut runner = DeploymentRunner::new(Arc::new(driver));
    runner.config = config;
    runner.suffix = suffix;
    runner.mappings = mappings;
    runner.key = key;
    runner.retry_count = retry_count;

    if incremental {
        runner.detect_existing_resources().await?;
    }

    runner.deploy(&name).await?;
    Ok(())
}

pub async fn cleanup(log: PathBuf) -> Result<()> {
    let driver =
        OpenStackDriver::new(OpenStackCredentials::from_env()?, DriverOptions::default());
    cleanup_from_journal(&driver, &log).await?;
    Ok(())
}

pub fn list_refs(tmpl: bool, stack: PathBuf) -> Result<()> {
    let raw = strato_config::load_stack_raw(&stack)
        .with_context(|| format!("failed to load stack {}", stack.display()))?;
    let (images, flavors, _networks) = strato_config::find_weak_refs(&raw);

    print!("{}", output::render_refs(&images, &flavors, tmpl));
    Ok(())
}
