pub mod aws;
pub mod cluster;
pub mod digitalocean;
pub mod driver;
pub mod error;
pub mod gce;
pub mod openstack;
pub mod pool;

pub use aws::{AwsDriver, AwsDriverConfig};
pub use cluster::ClusterClient;
pub use digitalocean::{DigitalOceanDriver, DigitalOceanDriverConfig};
pub use driver::{
    expand_path, openssh_fingerprint, pubkey_comment, CloudDriver, DriverOptions, KeyPairInfo,
    NullRecorder, ResourceRecorder,
};
pub use error::DriverError;
pub use gce::{GceDriver, GceDriverConfig};
pub use openstack::{OpenStackCredentials, OpenStackDriver};
pub use pool::WorkerPool;
