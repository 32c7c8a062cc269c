pub mod collection;
pub mod named_set;
pub mod types;

pub use collection::Collection;
pub use named_set::{Named, NamedSet};
pub use types::{
    FloatingIp, NetworkAttachment, Node, PortRecord, RuleSource, SecurityGroup,
    SecurityGroupRule, UrlConf,
};
