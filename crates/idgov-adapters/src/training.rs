//! Security-awareness training platform client.

use async_trait::async_trait;
use idgov_core::{join, Cell, JoinKind, JoinSpec, SourceSystem, Table};
use idgov_storage::{ApiSession, Method, PageProtocol};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::cache::EntityCache;
use crate::normalize::{
    coerce_temporal, fold_identity, records_to_table, require_columns, Temporal,
};
use crate::{SourceClient, SourceError};

pub const PROGRESS_COLUMNS: [&str; 8] = [
    "learner_id",
    "email",
    "first_name",
    "last_name",
    "campaign_id",
    "run_id",
    "status",
    "completed_on",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrainingDataset {
    Learners,
    Campaigns,
    /// Run-level progress of every awareness campaign.
    LearnerProgress,
    /// Latest timeline event per learner for the designated campaign.
    TimelineEvents,
}

#[derive(Debug)]
pub struct TrainingClient {
    session: ApiSession,
    cache: EntityCache<TrainingDataset>,
    timeline_campaign: String,
}

/// Maps a timeline event type onto a progress status.
pub fn timeline_status(event_type: &str) -> &'static str {
    match event_type {
        "completed-aware-module" => "completed",
        "started-aware-reminder" => "not_started",
        _ => "started",
    }
}

impl TrainingClient {
    pub fn new(session: ApiSession, timeline_campaign: impl Into<String>) -> Self {
        let mut cache = EntityCache::new();
        cache.depends_on(
            TrainingDataset::LearnerProgress,
            &[TrainingDataset::Learners, TrainingDataset::Campaigns],
        );
        Self {
            session,
            cache,
            timeline_campaign: timeline_campaign.into(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<JsonValue>, SourceError> {
        let request = self.session.request(Method::Get, path);
        Ok(self.session.fetch_all(request, &PageProtocol::page_limit()).await?)
    }

    pub async fn learners(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(TrainingDataset::Learners, refresh) {
            return Ok(table);
        }
        let raw = self.fetch("learners").await?;
        let mut table = records_to_table("training learners", &raw, &[])?;
        fold_identity(&mut table, "training learners", "email")?;
        coerce_temporal(&mut table, "training learners", &["modified"], Temporal::Timestamp)?;
        info!(source = "training", entity = "learners", rows = table.len(), "normalized");
        self.cache.store(TrainingDataset::Learners, table.clone());
        Ok(table)
    }

    pub async fn campaigns(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(TrainingDataset::Campaigns, refresh) {
            return Ok(table);
        }
        let raw = self.fetch("campaigns").await?;
        let table = records_to_table("training campaigns", &raw, &[])?;
        require_columns(&table, "training campaigns", &["id", "type"])?;
        self.cache.store(TrainingDataset::Campaigns, table.clone());
        Ok(table)
    }

    pub async fn learner_progress(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(TrainingDataset::LearnerProgress, refresh) {
            return Ok(table);
        }
        let campaigns = self.campaigns(refresh).await?;
        let awareness = campaigns.filter(|row| row.str("type") == Some("awareness"));

        let mut per_run = Vec::new();
        for campaign in awareness.iter() {
            let campaign_id = campaign.cell("id").to_string();
            let runs = self.fetch(&format!("campaigns/{campaign_id}/runs")).await?;
            for run in &runs {
                let run_id = run
                    .get("id")
                    .map(Cell::from_json)
                    .unwrap_or(Cell::Null)
                    .to_string();
                let raw = self
                    .fetch(&format!("campaigns/{campaign_id}/runs/{run_id}/learners"))
                    .await?;
                let mut table = records_to_table("training run learners", &raw, &[])?;
                if table.is_empty() {
                    continue;
                }
                require_columns(&table, "training run learners", &["id", "status"])?;
                coerce_temporal(
                    &mut table,
                    "training run learners",
                    &["completed_on"],
                    Temporal::Timestamp,
                )?;
                table.rename("id", "learner_id")?;
                table.set_column("campaign_id", |_| Cell::text(campaign_id.clone()));
                table.set_column("run_id", |_| Cell::text(run_id.clone()));
                per_run.push(table.select(&[
                    "learner_id",
                    "campaign_id",
                    "run_id",
                    "status",
                    "completed_on",
                ])?);
            }
        }

        let table = if per_run.is_empty() {
            Table::with_columns(&PROGRESS_COLUMNS)
        } else {
            let mut learners = self
                .learners(false)
                .await?
                .project(&["id", "email", "first_name", "last_name"]);
            learners.rename("id", "learner_id")?;
            let progress = Table::concat(&per_run);
            join(&progress, &learners, &JoinSpec::on(JoinKind::Left, &["learner_id"]))?
                .select(&PROGRESS_COLUMNS)?
        };
        info!(source = "training", entity = "learner_progress", rows = table.len(), "normalized");
        self.cache.store(TrainingDataset::LearnerProgress, table.clone());
        Ok(table)
    }

    /// Events of the designated campaign, reduced to each learner's latest one.
    pub async fn timeline_events(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(TrainingDataset::TimelineEvents, refresh) {
            return Ok(table);
        }
        let raw = self.fetch("timeline-events").await?;
        let events = records_to_table("training timeline events", &raw, &[])?;
        require_columns(
            &events,
            "training timeline events",
            &["learner_id", "campaign_id", "campaign_run_id", "type", "timestamp"],
        )?;
        let campaign = self.timeline_campaign.clone();
        let mut events = events.filter(|row| row.cell("campaign_id").to_string() == campaign);

        let table = if events.is_empty() {
            Table::with_columns(&PROGRESS_COLUMNS)
        } else {
            coerce_temporal(
                &mut events,
                "training timeline events",
                &["timestamp"],
                Temporal::Timestamp,
            )?;
            events.rename("campaign_run_id", "run_id")?;
            events.rename("type", "status")?;
            events.rename("timestamp", "completed_on")?;
            let mut latest = events.latest_by("learner_id", "completed_on")?;
            latest.map_column("status", |cell| Cell::text(timeline_status(&cell.to_string())))?;
            latest.project(&PROGRESS_COLUMNS)
        };
        info!(source = "training", entity = "timeline_events", rows = table.len(), "normalized");
        self.cache.store(TrainingDataset::TimelineEvents, table.clone());
        Ok(table)
    }
}

#[async_trait]
impl SourceClient for TrainingClient {
    type Dataset = TrainingDataset;

    fn system(&self) -> SourceSystem {
        SourceSystem::Training
    }

    async fn dataset(&mut self, dataset: TrainingDataset, refresh: bool) -> Result<Table, SourceError> {
        match dataset {
            TrainingDataset::Learners => self.learners(refresh).await,
            TrainingDataset::Campaigns => self.campaigns(refresh).await,
            TrainingDataset::LearnerProgress => self.learner_progress(refresh).await,
            TrainingDataset::TimelineEvents => self.timeline_events(refresh).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use idgov_storage::scripted::ScriptedTransport;
    use serde_json::json;

    use super::*;
    use crate::test_support::{fixture_transport, session};

    const BASE: &str = "https://training.test/api/v1";

    #[test]
    fn timeline_status_mapping() {
        assert_eq!(timeline_status("completed-aware-module"), "completed");
        assert_eq!(timeline_status("started-aware-reminder"), "not_started");
        assert_eq!(timeline_status("opened-aware-module"), "started");
    }

    #[tokio::test]
    async fn progress_joins_run_learners_to_learners() {
        let transport = fixture_transport("training", "routes.json");
        let mut client = TrainingClient::new(session(&transport, "training", BASE), "GiT");

        let progress = client.learner_progress(false).await.expect("progress");
        assert_eq!(progress.columns(), PROGRESS_COLUMNS);
        assert_eq!(progress.len(), 3);
        assert_eq!(progress.value(0, "email"), Some(&Cell::text("ana.lopez@example.com")));
        assert_eq!(progress.value(0, "campaign_id"), Some(&Cell::text("c-100")));
        assert_eq!(progress.value(2, "run_id"), Some(&Cell::text("r-2")));
        // Learner removed from the roster keeps its progress row.
        assert_eq!(progress.value(2, "email"), Some(&Cell::Null));
        assert_eq!(transport.count_matching("/campaigns/c-200"), 0);
    }

    #[tokio::test]
    async fn timeline_keeps_latest_event_per_learner() {
        let transport = fixture_transport("training", "routes.json");
        let mut client = TrainingClient::new(session(&transport, "training", BASE), "GiT");

        let events = client.timeline_events(false).await.expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events.value(0, "learner_id"), Some(&Cell::text("l-1")));
        assert_eq!(events.value(0, "status"), Some(&Cell::text("completed")));
        assert_eq!(events.value(1, "status"), Some(&Cell::text("not_started")));
        let completed = NaiveDate::from_ymd_opt(2024, 5, 3)
            .and_then(|d| d.and_hms_milli_opt(10, 0, 0, 250))
            .expect("date");
        assert_eq!(events.value(0, "completed_on"), Some(&Cell::Timestamp(completed)));
        assert_eq!(events.value(0, "email"), Some(&Cell::Null));
    }

    #[tokio::test]
    async fn no_awareness_campaigns_yields_empty_progress_with_columns() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_always("GET", "/campaigns", json!({"data": [{"id": "c-1", "type": "phishing"}]}));
        let mut client = TrainingClient::new(session(&transport, "training", BASE), "GiT");

        let progress = client.learner_progress(false).await.expect("progress");
        assert!(progress.is_empty());
        assert_eq!(progress.columns(), PROGRESS_COLUMNS);
    }
}
