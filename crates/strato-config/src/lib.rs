mod loader;
pub mod cloud;
pub mod error;
pub mod interpolate;
pub mod raw;

pub use cloud::{load_cloud_config, parse_mappings_ini, CloudConfig, Mappings, ProviderKind};
pub use error::ConfigError;
pub use interpolate::interpolate;
pub use loader::{find_weak_refs, load, load_stack_raw, load_stack_str};
