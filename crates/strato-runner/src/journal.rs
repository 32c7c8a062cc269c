use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use strato_driver::{DriverError, OpenStackDriver, ResourceRecorder};
use tracing::{info, warn};

use crate::error::RunnerError;

/// Append-only journal of created resources, one `"{type}: {id}"` line per
/// record, flushed per write so a crash loses at most the in-flight line.
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResourceRecorder for FileJournal {
    fn record(&self, resource_type: &str, id: &str) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                writeln!(file, "{}: {}", resource_type, id)?;
                file.flush()
            });
        if let Err(e) = result {
            // Losing a journal line must never abort a deployment.
            warn!("failed to journal {} {}: {}", resource_type, id, e);
        }
    }
}

/// Parse a journal back into `(type, id)` records, oldest first.
pub fn read_journal(path: &Path) -> Result<Vec<(String, String)>, RunnerError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let (resource_type, id) = line.split_once(": ")?;
            Some((resource_type.trim().to_string(), id.trim().to_string()))
        })
        .collect())
}

/// Something that can delete a recorded resource by type tag. The OpenStack
/// driver is the production implementation; tests substitute their own.
#[async_trait]
pub trait JournalTarget {
    async fn delete_resource(&self, resource_type: &str, id: &str) -> Result<(), DriverError>;
}

#[async_trait]
impl JournalTarget for OpenStackDriver {
    async fn delete_resource(&self, resource_type: &str, id: &str) -> Result<(), DriverError> {
        match resource_type {
            "server" => self.delete_server(id).await,
            "port" => self.delete_port(id).await,
            "floatingip" => self.delete_floatingip(id).await,
            "network" => self.delete_network(id).await,
            "subnet" => self.delete_subnet(id).await,
            "router" => self.delete_router(id).await,
            "secgroup" => self.delete_secgroup(id).await,
            "secgroup_rule" => self.delete_secgroup_rule(id).await,
            "keypair" => self.delete_keypair(id).await,
            "volume" => self.delete_volume(id).await,
            other => Err(DriverError::DeleteFailed(format!(
                "unknown resource type '{}' in journal",
                other
            ))),
        }
    }
}

/// Tear down everything a journal records, newest first. Failures are
/// logged and skipped so a broken entry never blocks the rest of the
/// rollback.
pub async fn cleanup_from_journal(
    target: &impl JournalTarget,
    path: &Path,
) -> Result<(), RunnerError> {
    let mut records = read_journal(path)?;
    records.reverse();

    for (resource_type, id) in records {
        info!("Deleting {} {}", resource_type, id);
        if let Err(e) = target.delete_resource(&resource_type, &id).await {
            warn!("failed to delete {} {}: {}", resource_type, id, e);
        }
    }
    Ok(())
}
