//! Helpdesk platform client: contacts, agents, tickets and the agent write-back calls.

use async_trait::async_trait;
use idgov_core::{Cell, SourceSystem, Table};
use idgov_storage::{ApiSession, Method, PageProtocol};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::cache::EntityCache;
use crate::normalize::{
    coerce_temporal, flatten_record, fold_identity, join_list, records_to_table, require_columns,
    set_field, Temporal,
};
use crate::{SourceClient, SourceError};

const TICKET_DATES: [&str; 6] = [
    "created_on",
    "closed_on",
    "last_status_changed_on",
    "resolution_due",
    "last_replied_on",
    "last_updated_on",
];

/// Extra date columns carried by the IT brand's tickets.
pub const IT_TICKET_DATES: [&str; 3] = [
    "cf_last_date_of_service",
    "cf_last_day_of_retention",
    "response_due",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelpdeskDataset {
    Contacts,
    Agents,
    Tickets,
    /// Agents and contacts keyed by email, agents first.
    Users,
}

/// Body of an agent creation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgent {
    pub name: String,
    pub email_id: String,
    pub display_name: String,
    pub has_all_brand_access: bool,
    pub brand_ids: String,
    pub role_ids: String,
    pub ticket_access_scope_id: i64,
    pub is_verified: bool,
}

impl NewAgent {
    /// A verified agent with access to all brands and the default agent role.
    pub fn verified(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email_id: email.to_string(),
            display_name: name.to_string(),
            has_all_brand_access: true,
            brand_ids: "1".into(),
            role_ids: "1002".into(),
            ticket_access_scope_id: 2,
            is_verified: true,
        }
    }
}

#[derive(Debug)]
pub struct HelpdeskClient {
    session: ApiSession,
    cache: EntityCache<HelpdeskDataset>,
    ticket_dates: Vec<String>,
}

impl HelpdeskClient {
    /// `session` must carry the brand's API key and point at its `/api/v1` root.
    pub fn new(session: ApiSession) -> Self {
        let mut cache = EntityCache::new();
        cache.depends_on(
            HelpdeskDataset::Users,
            &[HelpdeskDataset::Agents, HelpdeskDataset::Contacts],
        );
        Self {
            session,
            cache,
            ticket_dates: TICKET_DATES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Adds brand-specific date columns to the ticket normalization.
    pub fn with_ticket_dates(mut self, extra: &[&str]) -> Self {
        for column in extra {
            if !self.ticket_dates.iter().any(|c| c == column) {
                self.ticket_dates.push(column.to_string());
            }
        }
        self
    }

    async fn fetch(&self, path: &str) -> Result<Vec<JsonValue>, SourceError> {
        let request = self.session.request(Method::Get, path);
        Ok(self.session.fetch_all(request, &PageProtocol::helpdesk()).await?)
    }

    pub async fn contacts(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(HelpdeskDataset::Contacts, refresh) {
            return Ok(table);
        }
        let raw = self.fetch("contacts").await?;
        let mut table = records_to_table("helpdesk contacts", &raw, &["contactCustomFields"])?;
        fold_identity(&mut table, "helpdesk contacts", "email_id")?;
        coerce_temporal(
            &mut table,
            "helpdesk contacts",
            &["created_on", "last_modified_on"],
            Temporal::Timestamp,
        )?;
        info!(source = "helpdesk", entity = "contacts", rows = table.len(), "normalized");
        self.cache.store(HelpdeskDataset::Contacts, table.clone());
        Ok(table)
    }

    pub async fn agents(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(HelpdeskDataset::Agents, refresh) {
            return Ok(table);
        }
        let raw = self.fetch("agents").await?;
        let mut records = Vec::with_capacity(raw.len());
        for value in &raw {
            let mut record = flatten_record("helpdesk agents", value, &[])?;
            let roles = value.get("roles");
            set_field(&mut record, "role_names", join_list(roles, "roleName"));
            set_field(&mut record, "role_ids", join_list(roles, "roleId"));
            records.push(record);
        }
        let mut table = Table::from_records(records).drop_columns(&[
            "roles",
            "availability_status",
            "short_code",
            "color_code",
        ]);
        fold_identity(&mut table, "helpdesk agents", "email_id")?;
        coerce_temporal(
            &mut table,
            "helpdesk agents",
            &["last_modified_on", "created_on", "last_activity_on"],
            Temporal::Timestamp,
        )?;
        info!(source = "helpdesk", entity = "agents", rows = table.len(), "normalized");
        self.cache.store(HelpdeskDataset::Agents, table.clone());
        Ok(table)
    }

    pub async fn tickets(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(HelpdeskDataset::Tickets, refresh) {
            return Ok(table);
        }
        let raw = self.fetch("tickets").await?;
        let mut table = records_to_table("helpdesk tickets", &raw, &[])?;
        let dates: Vec<&str> = self.ticket_dates.iter().map(String::as_str).collect();
        coerce_temporal(&mut table, "helpdesk tickets", &dates, Temporal::Timestamp)?;
        info!(source = "helpdesk", entity = "tickets", rows = table.len(), "normalized");
        self.cache.store(HelpdeskDataset::Tickets, table.clone());
        Ok(table)
    }

    /// Every helpdesk identity with an email: agents first, then contacts not already seen.
    pub async fn users(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(HelpdeskDataset::Users, refresh) {
            return Ok(table);
        }
        let mut agents = self.agents(refresh).await?;
        let mut contacts = self.contacts(refresh).await?;
        require_columns(&agents, "helpdesk agents", &["email_id"])?;
        require_columns(&contacts, "helpdesk contacts", &["email_id"])?;
        agents.set_column("user_kind", |_| Cell::text("agent"));
        contacts.set_column("user_kind", |_| Cell::text("contact"));

        let union = Table::concat(&[agents, contacts]);
        let table = if union.is_empty() {
            union
        } else {
            union
                .filter(|row| !row.cell("email_id").is_null())
                .distinct_by("email_id")?
        };
        self.cache.store(HelpdeskDataset::Users, table.clone());
        Ok(table)
    }

    pub async fn add_agent(&mut self, agent: &NewAgent) -> Result<JsonValue, SourceError> {
        let body = serde_json::to_value(agent)?;
        let response = self.session.post("agents", body).await?;
        info!(email = %agent.email_id, "helpdesk agent provisioned");
        self.cache.invalidate(HelpdeskDataset::Agents);
        Ok(response)
    }

    pub async fn deactivate_agent(&mut self, user_id: &str) -> Result<JsonValue, SourceError> {
        let response = self
            .session
            .put(&format!("agents/{user_id}/deactivate"), json!({}))
            .await?;
        info!(user_id, "helpdesk agent deactivated");
        self.cache.invalidate(HelpdeskDataset::Agents);
        Ok(response)
    }
}

#[async_trait]
impl SourceClient for HelpdeskClient {
    type Dataset = HelpdeskDataset;

    fn system(&self) -> SourceSystem {
        SourceSystem::Helpdesk
    }

    async fn dataset(&mut self, dataset: HelpdeskDataset, refresh: bool) -> Result<Table, SourceError> {
        match dataset {
            HelpdeskDataset::Contacts => self.contacts(refresh).await,
            HelpdeskDataset::Agents => self.agents(refresh).await,
            HelpdeskDataset::Tickets => self.tickets(refresh).await,
            HelpdeskDataset::Users => self.users(refresh).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use idgov_storage::Body;

    use super::*;
    use crate::test_support::{fixture_transport, session};

    const BASE: &str = "https://care.helpdesk.test/api/v1";

    #[tokio::test]
    async fn agents_are_normalized_and_cached() {
        let transport = fixture_transport("helpdesk", "routes.json");
        let mut client = HelpdeskClient::new(session(&transport, "helpdesk", BASE));

        let agents = client.agents(false).await.expect("agents");
        assert_eq!(agents.len(), 2);
        assert_eq!(agents.value(0, "email_id"), Some(&Cell::text("ana.lopez@example.com")));
        assert_eq!(agents.value(0, "role_names"), Some(&Cell::text("Agent,Supervisor")));
        assert_eq!(agents.value(0, "role_ids"), Some(&Cell::text("1002,1004")));
        assert!(!agents.has_column("roles"));
        assert!(!agents.has_column("color_code"));
        let created = NaiveDate::from_ymd_opt(2023, 1, 10)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .expect("date");
        assert_eq!(agents.value(0, "created_on"), Some(&Cell::Timestamp(created)));

        let before = transport.request_count();
        client.agents(false).await.expect("cached");
        assert_eq!(transport.request_count(), before);

        client.agents(true).await.expect("refetched");
        assert_eq!(transport.request_count(), before + 1);
    }

    #[tokio::test]
    async fn contacts_strip_custom_field_prefix() {
        let transport = fixture_transport("helpdesk", "routes.json");
        let mut client = HelpdeskClient::new(session(&transport, "helpdesk", BASE));

        let contacts = client.contacts(false).await.expect("contacts");
        assert!(contacts.has_column("cf_department"));
        assert_eq!(contacts.value(1, "email_id"), Some(&Cell::text("omar.said@example.com")));
        assert_eq!(contacts.value(1, "cf_department"), Some(&Cell::Null));
    }

    #[tokio::test]
    async fn users_union_prefers_agents_and_follows_refreshes() {
        let transport = fixture_transport("helpdesk", "routes.json");
        let mut client = HelpdeskClient::new(session(&transport, "helpdesk", BASE));

        let users = client.users(false).await.expect("users");
        let emails: Vec<String> = users
            .column_values("email_id")
            .expect("emails")
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(
            emails,
            ["ana.lopez@example.com", "li.wei@example.com", "omar.said@example.com"]
        );
        assert_eq!(users.value(0, "user_kind"), Some(&Cell::text("agent")));

        let before = transport.request_count();
        client.contacts(true).await.expect("contacts refresh");
        client.users(false).await.expect("users recomputed");
        assert_eq!(transport.request_count(), before + 1);
    }

    #[tokio::test]
    async fn it_tickets_carry_extra_dates() {
        let transport = fixture_transport("helpdesk", "routes.json");
        let mut client = HelpdeskClient::new(session(&transport, "helpdesk", BASE))
            .with_ticket_dates(&IT_TICKET_DATES);

        let tickets = client.tickets(false).await.expect("tickets");
        assert_eq!(tickets.len(), 2);
        assert!(matches!(
            tickets.value(0, "cf_last_date_of_service"),
            Some(Cell::Timestamp(_))
        ));
        assert_eq!(tickets.value(1, "closed_on"), Some(&Cell::Null));
        assert!(tickets.has_column("requested_by_email_id"));
    }

    #[tokio::test]
    async fn write_back_calls_hit_agent_endpoints() {
        let transport = fixture_transport("helpdesk", "routes.json");
        let mut client = HelpdeskClient::new(session(&transport, "helpdesk", BASE));

        client
            .add_agent(&NewAgent::verified("Nia Brown", "nia.brown@example.com"))
            .await
            .expect("add");
        client.deactivate_agent("42").await.expect("deactivate");

        let sent = transport.requests();
        let add = sent.iter().find(|r| r.method == Method::Post).expect("post");
        match &add.body {
            Body::Json(body) => {
                assert_eq!(body["emailId"], "nia.brown@example.com");
                assert_eq!(body["roleIds"], "1002");
                assert_eq!(body["isVerified"], true);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert!(sent
            .iter()
            .any(|r| r.method == Method::Put && r.url.ends_with("/agents/42/deactivate")));
    }
}
