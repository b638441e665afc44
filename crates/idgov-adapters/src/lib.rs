//! Source clients: each one fetches its upstream datasets, normalizes them into tables
//! and keeps them in a per-client [`EntityCache`].

use std::fmt;

use async_trait::async_trait;
use idgov_core::{SourceSystem, Table, TableError};
use idgov_storage::FetchError;
use thiserror::Error;

pub mod cache;
pub mod directory;
pub mod erp;
pub mod helpdesk;
pub mod normalize;
pub mod training;

pub use cache::EntityCache;
pub use directory::{DirectoryClient, DirectoryDataset};
pub use erp::{ErpClient, ErpDataset};
pub use helpdesk::{HelpdeskClient, HelpdeskDataset, NewAgent};
pub use normalize::NormalizeError;
pub use training::{TrainingClient, TrainingDataset};

pub const CRATE_NAME: &str = "idgov-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One upstream system's dataset catalogue.
#[async_trait]
pub trait SourceClient: Send {
    type Dataset: Copy + fmt::Debug + Send + Sync + 'static;

    fn system(&self) -> SourceSystem;

    /// Returns the dataset's normalized table, served from the cache unless `refresh`.
    async fn dataset(&mut self, dataset: Self::Dataset, refresh: bool) -> Result<Table, SourceError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use idgov_storage::scripted::ScriptedTransport;
    use idgov_storage::{ApiSession, Auth, BackoffPolicy};

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    /// Transport answering from `fixtures/<source>/<file>`.
    pub fn fixture_transport(source: &str, file: &str) -> Arc<ScriptedTransport> {
        let path = workspace_root().join("fixtures").join(source).join(file);
        Arc::new(ScriptedTransport::from_routes_file(&path).expect("fixture routes"))
    }

    pub fn session(transport: &Arc<ScriptedTransport>, source: &str, base_url: &str) -> ApiSession {
        ApiSession::new(transport.clone(), source, base_url, Auth::None)
            .with_backoff(BackoffPolicy::immediate(0))
    }
}
