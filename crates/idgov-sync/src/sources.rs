use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use idgov_adapters::erp::restlet_base_url;
use idgov_adapters::helpdesk::IT_TICKET_DATES;
use idgov_adapters::{DirectoryClient, ErpClient, HelpdeskClient, SourceClient, TrainingClient};
use idgov_core::Table;
use idgov_storage::{
    client_credentials_token, ApiSession, Auth, BackoffPolicy, HttpTransport, OAuth1Credentials,
    OAuth1Signer, Warehouse, WarehouseError,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::jobs::{Fetch, HelpdeskBrand, DIRECTORY_USERS_TABLE};
use crate::reconcile::Recipe;
use crate::secrets::SecretProvider;

pub const DIRECTORY_SCOPE: &str = "https://graph.microsoft.com/.default";
pub const HELPDESK_KEY_HEADER: &str = "x-api-key";

fn directory_token_url(tenant: &str) -> String {
    format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token")
}

/// Turns configuration and secrets into request-ready sessions.
#[derive(Clone)]
pub struct SessionFactory {
    config: SyncConfig,
    transport: Arc<dyn HttpTransport>,
    secrets: Arc<dyn SecretProvider>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn HttpTransport>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Self {
        let backoff = config.backoff();
        Self {
            config,
            transport,
            secrets,
            backoff,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn secret(&self, name: &str) -> Result<String> {
        self.secrets
            .get_secret(name)
            .with_context(|| format!("loading secret `{name}`"))
    }

    fn session(&self, source: &str, base_url: &str, auth: Auth, run_id: Uuid) -> ApiSession {
        ApiSession::new(Arc::clone(&self.transport), source, base_url, auth)
            .with_backoff(self.backoff)
            .with_run_id(run_id)
    }

    pub async fn directory(&self, run_id: Uuid) -> Result<DirectoryClient> {
        let token_url = match &self.config.directory_token_url {
            Some(url) => url.clone(),
            None => directory_token_url(&self.secret("directory-tenant-id")?),
        };
        let client_id = self.secret("directory-client-id")?;
        let client_secret = self.secret("directory-client-secret")?;
        let base_url = &self.config.directory_base_url;

        let bootstrap = self.session("directory", base_url, Auth::None, run_id);
        let token = client_credentials_token(
            &bootstrap,
            &token_url,
            &client_id,
            &client_secret,
            DIRECTORY_SCOPE,
        )
        .await
        .context("exchanging directory client credentials")?;

        let session = self.session("directory", base_url, Auth::Bearer(token), run_id);
        Ok(DirectoryClient::new(session).with_beta_base(self.config.directory_beta_url.clone()))
    }

    pub async fn helpdesk(&self, brand: HelpdeskBrand, run_id: Uuid) -> Result<HelpdeskClient> {
        let key = self.secret(&format!("helpdesk-{}-api-key", brand.name()))?;
        let base_url = self.secret(&format!("helpdesk-{}-base-url", brand.name()))?;
        let auth = Auth::ApiKey {
            header: HELPDESK_KEY_HEADER.to_string(),
            key,
        };
        let source = format!("helpdesk-{}", brand.name());
        let client = HelpdeskClient::new(self.session(&source, &base_url, auth, run_id));
        Ok(match brand {
            HelpdeskBrand::It => client.with_ticket_dates(&IT_TICKET_DATES),
            HelpdeskBrand::Care => client,
        })
    }

    pub async fn erp(&self, run_id: Uuid) -> Result<ErpClient> {
        let account_id = self.secret("erp-account-id")?;
        let credentials = OAuth1Credentials {
            realm: account_id.clone(),
            consumer_key: self.secret("erp-consumer-key")?,
            consumer_secret: self.secret("erp-consumer-secret")?,
            token_id: self.secret("erp-token-id")?,
            token_secret: self.secret("erp-token-secret")?,
        };
        let base_url = self
            .config
            .erp_base_url
            .clone()
            .unwrap_or_else(|| restlet_base_url(&account_id));
        let auth = Auth::OAuth1(Arc::new(OAuth1Signer::new(credentials)));
        Ok(ErpClient::new(self.session("erp", &base_url, auth, run_id))
            .with_deployment(self.config.erp_script.clone(), self.config.erp_deploy.clone()))
    }

    pub async fn training(&self, run_id: Uuid) -> Result<TrainingClient> {
        let key = self.secret("training-api-key")?;
        let session = self.session(
            "training",
            &self.config.training_base_url,
            Auth::Bearer(key),
            run_id,
        );
        Ok(TrainingClient::new(
            session,
            self.config.training_timeline_campaign.clone(),
        ))
    }
}

/// Clients of one job run, created on first use. Their caches live as long as the run.
pub struct JobSources<'a> {
    factory: &'a SessionFactory,
    run_id: Uuid,
    directory: Option<DirectoryClient>,
    helpdesk: HashMap<HelpdeskBrand, HelpdeskClient>,
    erp: Option<ErpClient>,
    training: Option<TrainingClient>,
}

impl<'a> JobSources<'a> {
    pub fn new(factory: &'a SessionFactory, run_id: Uuid) -> Self {
        Self {
            factory,
            run_id,
            directory: None,
            helpdesk: HashMap::new(),
            erp: None,
            training: None,
        }
    }

    pub async fn directory(&mut self) -> Result<&mut DirectoryClient> {
        let client = match self.directory.take() {
            Some(client) => client,
            None => self.factory.directory(self.run_id).await?,
        };
        Ok(self.directory.insert(client))
    }

    pub async fn helpdesk(&mut self, brand: HelpdeskBrand) -> Result<&mut HelpdeskClient> {
        let factory = self.factory;
        match self.helpdesk.entry(brand) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(factory.helpdesk(brand, self.run_id).await?)),
        }
    }

    pub async fn erp(&mut self) -> Result<&mut ErpClient> {
        let client = match self.erp.take() {
            Some(client) => client,
            None => self.factory.erp(self.run_id).await?,
        };
        Ok(self.erp.insert(client))
    }

    pub async fn training(&mut self) -> Result<&mut TrainingClient> {
        let client = match self.training.take() {
            Some(client) => client,
            None => self.factory.training(self.run_id).await?,
        };
        Ok(self.training.insert(client))
    }

    /// Directory users as the directory job last wrote them, or live when that table is absent.
    pub async fn directory_users(&mut self, warehouse: &Warehouse) -> Result<Table> {
        match warehouse.get_table(DIRECTORY_USERS_TABLE).await {
            Ok(table) => {
                info!(table = DIRECTORY_USERS_TABLE, rows = table.len(), "read back from warehouse");
                Ok(table)
            }
            Err(WarehouseError::TableNotFound(_)) => {
                warn!(
                    table = DIRECTORY_USERS_TABLE,
                    "table not written yet, fetching directory users live"
                );
                Ok(self.directory().await?.users(false).await?)
            }
            Err(err) => Err(anyhow::Error::new(err).context("reading directory users")),
        }
    }

    pub async fn fetch(&mut self, fetch: Fetch, warehouse: &Warehouse) -> Result<Table> {
        let table = match fetch {
            Fetch::Directory(dataset) => self.directory().await?.dataset(dataset, false).await?,
            Fetch::Helpdesk(brand, dataset) => {
                self.helpdesk(brand).await?.dataset(dataset, false).await?
            }
            Fetch::Erp(dataset) => self.erp().await?.dataset(dataset, false).await?,
            Fetch::Training(dataset) => self.training().await?.dataset(dataset, false).await?,
            Fetch::Reconcile(recipe) => {
                let left = match recipe {
                    Recipe::EmployeesWithDirectory => self.erp().await?.employees(false).await?,
                    Recipe::PartnersWithDirectory => {
                        self.erp().await?.partners_active(false).await?
                    }
                    Recipe::AgentsWithDirectory => {
                        self.helpdesk(HelpdeskBrand::It).await?.agents(false).await?
                    }
                };
                let users = self.directory_users(warehouse).await?;
                let table = recipe.apply(&left, &users)?;
                info!(recipe = recipe.name(), rows = table.len(), "reconciled");
                table
            }
        };
        Ok(table)
    }
}
