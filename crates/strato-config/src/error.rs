use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown url type '{0}' (expected 'static' or 'backend')")]
    UnknownUrlType(String),

    #[error("unknown driver '{0}' (expected gce, aws, digitalocean or openstack)")]
    UnknownDriver(String),

    #[error("missing key '{key}' in section [{section}] of {path}")]
    MissingKey {
        path: String,
        section: String,
        key: String,
    },

    #[error("conversion error in {path}: {message}")]
    Conversion { path: String, message: String },
}
