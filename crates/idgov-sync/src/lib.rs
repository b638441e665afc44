//! Job orchestration for idgov: configuration, secrets, reconciliation recipes, the job
//! registry and the pipeline that runs jobs once or on a cron schedule.

pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod reconcile;
pub mod secrets;
pub mod sources;

pub use config::SyncConfig;
pub use jobs::{JobId, JobRegistry, RegistryError, WriteMode};
pub use pipeline::{run_job_from_env, JobRunSummary, ScheduledRun, SyncPipeline, TableWrite};
pub use reconcile::{Recipe, SafetyGate};
pub use secrets::{EnvSecrets, JsonFileSecrets, LayeredSecrets, SecretError, SecretProvider};

pub const CRATE_NAME: &str = "idgov-sync";
