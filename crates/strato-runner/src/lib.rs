pub mod error;
pub mod journal;
pub mod runner;
pub mod shell;
pub mod time;

pub use error::RunnerError;
pub use journal::{cleanup_from_journal, read_journal, FileJournal, JournalTarget};
pub use runner::{DeploymentConfig, DeploymentRunner, ProvisionStep, RunnerNode, Step};
pub use shell::{run_cmd_once, run_with_retries, shell_quote, RetryPolicy, ShellStep};
pub use time::parse_time;
