use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use idgov_core::Table;
use idgov_storage::{
    BackoffPolicy, HttpTransport, PgWarehouse, ReqwestTransport, Warehouse, WriteSummary,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::jobs::{HelpdeskBrand, JobAction, JobId, JobRegistry, TableStep, WriteMode};
use crate::reconcile::{plan_deactivations, plan_provisioning, SafetyGate};
use crate::secrets::{LayeredSecrets, SecretProvider};
use crate::sources::{JobSources, SessionFactory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableWrite {
    pub table: String,
    pub mode: WriteMode,
    pub rows: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleSummary {
    /// Emails of the agents created, or that would have been on a dry run.
    pub provisioned: Vec<String>,
    pub deactivation_candidates: usize,
    pub population: usize,
    pub gate_permitted: bool,
    /// Helpdesk user ids deactivated.
    pub deactivated: Vec<String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunSummary {
    pub job: JobId,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableWrite>,
    pub lifecycle: Option<LifecycleSummary>,
}

impl JobRunSummary {
    pub fn rows_written(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

#[derive(Debug)]
pub enum ScheduledRun {
    Completed(JobRunSummary),
    /// The previous run of the same job had not finished.
    Skipped,
    Failed,
}

/// Marks a job as running until dropped.
struct RunningGuard {
    running: Arc<Mutex<HashSet<JobId>>>,
    id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct SyncPipeline {
    config: SyncConfig,
    registry: JobRegistry,
    sessions: SessionFactory,
    warehouse: Warehouse,
    gate: SafetyGate,
    apply_write_back: bool,
    running: Arc<Mutex<HashSet<JobId>>>,
}

impl fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("jobs", &self.registry.jobs().len())
            .field("warehouse", &self.warehouse)
            .field("gate", &self.gate)
            .field("apply_write_back", &self.apply_write_back)
            .finish_non_exhaustive()
    }
}

impl SyncPipeline {
    /// Production wiring: reqwest transport, settings-file and environment secrets,
    /// `jobs.yaml` overrides and the Postgres warehouse.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.http_client_config())?;
        let secrets = LayeredSecrets::from_settings(config.settings_file.as_deref())
            .context("loading secrets")?;
        let registry = JobRegistry::load(&config.jobs_file)?;
        let sink = PgWarehouse::connect_lazy(&config.database_url)
            .context("configuring warehouse pool")?
            .with_parameter_limit(config.warehouse_parameter_limit);
        Ok(Self::with_parts(
            config,
            registry,
            Arc::new(transport),
            Arc::new(secrets),
            Warehouse::new(Arc::new(sink)),
        ))
    }

    pub fn with_parts(
        config: SyncConfig,
        registry: JobRegistry,
        transport: Arc<dyn HttpTransport>,
        secrets: Arc<dyn SecretProvider>,
        warehouse: Warehouse,
    ) -> Self {
        let sessions = SessionFactory::new(config.clone(), transport, secrets);
        Self {
            config,
            registry,
            sessions,
            warehouse,
            gate: SafetyGate::default(),
            apply_write_back: true,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_warehouse(mut self, warehouse: Warehouse) -> Self {
        self.warehouse = warehouse;
        self
    }

    pub fn with_safety_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    /// When false, helpdesk write-back is planned and reported but never sent.
    pub fn with_write_back(mut self, apply: bool) -> Self {
        self.apply_write_back = apply;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.sessions = self.sessions.with_backoff(backoff);
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Runs every step of `id` in order. The first failing step fails the job; tables
    /// refreshed before it keep their new contents.
    pub async fn run_job(&self, id: JobId) -> Result<JobRunSummary> {
        let spec = self.registry.get(id)?.clone();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("job_run", job = id.name(), %run_id);

        async move {
            info!("job started");
            let mut sources = JobSources::new(&self.sessions, run_id);
            let mut tables = Vec::new();
            let mut lifecycle = None;

            match &spec.action {
                JobAction::Tables(steps) => {
                    for step in steps {
                        let write = self
                            .run_step(&mut sources, step)
                            .await
                            .with_context(|| format!("job {id}: writing {}", step.table))?;
                        tables.push(write);
                    }
                }
                JobAction::AgentLifecycle => {
                    let summary = self
                        .run_agent_lifecycle(&mut sources)
                        .await
                        .with_context(|| format!("job {id}: agent lifecycle"))?;
                    lifecycle = Some(summary);
                }
            }

            let summary = JobRunSummary {
                job: id,
                run_id,
                started_at,
                finished_at: Utc::now(),
                tables,
                lifecycle,
            };
            info!(
                tables = summary.tables.len(),
                rows = summary.rows_written(),
                "job finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn run_step(&self, sources: &mut JobSources<'_>, step: &TableStep) -> Result<TableWrite> {
        let rows = sources.fetch(step.fetch, &self.warehouse).await?;
        let written = self.write(step, &rows).await?;
        Ok(TableWrite {
            table: written.table,
            mode: step.mode,
            rows: written.rows,
            batches: written.batches,
        })
    }

    async fn write(&self, step: &TableStep, rows: &Table) -> Result<WriteSummary> {
        let summary = match step.mode {
            WriteMode::Refresh => self.warehouse.refresh(step.table, rows).await?,
            WriteMode::Append => self.warehouse.append(step.table, rows).await?,
            WriteMode::RefreshRows { key_column } => match rows.value(0, key_column) {
                Some(key) if !key.is_null() => {
                    self.warehouse
                        .refresh_rows(step.table, rows, key_column, &key.clone())
                        .await?
                }
                _ => {
                    warn!(table = step.table, key_column, "no key value, appending without erase");
                    self.warehouse.append(step.table, rows).await?
                }
            },
        };
        Ok(summary)
    }

    async fn run_agent_lifecycle(&self, sources: &mut JobSources<'_>) -> Result<LifecycleSummary> {
        let directory_users = sources.directory().await?.users(false).await?;
        let helpdesk = sources.helpdesk(HelpdeskBrand::It).await?;
        let helpdesk_users = helpdesk.users(false).await?;
        let apply = self.apply_write_back;
        let mut summary = LifecycleSummary {
            applied: apply,
            ..Default::default()
        };

        let to_add = plan_provisioning(&helpdesk_users, &directory_users)?;
        for agent in &to_add {
            if apply {
                helpdesk.add_agent(agent).await?;
            }
            summary.provisioned.push(agent.email_id.clone());
        }

        let agents = helpdesk.agents(!to_add.is_empty()).await?;
        let plan = plan_deactivations(&agents, &directory_users)?;
        summary.deactivation_candidates = plan.agents.len();
        summary.population = plan.population;
        summary.gate_permitted = self.gate.permits(plan.agents.len(), plan.population);

        if !summary.gate_permitted {
            warn!(
                candidates = plan.agents.len(),
                population = plan.population,
                max_fraction = self.gate.max_fraction,
                "deactivation skipped by safety gate"
            );
        } else {
            for agent in &plan.agents {
                if apply {
                    helpdesk.deactivate_agent(&agent.user_id).await?;
                }
                summary.deactivated.push(agent.user_id.clone());
            }
        }
        if !apply {
            info!(
                provisioned = summary.provisioned.len(),
                deactivated = summary.deactivated.len(),
                "write-back planned only"
            );
        }
        Ok(summary)
    }

    fn try_begin(&self, id: JobId) -> Option<RunningGuard> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(id) {
            return None;
        }
        Some(RunningGuard {
            running: Arc::clone(&self.running),
            id,
        })
    }

    /// Scheduler entry point: never overlaps a run of the same job, and logs failures
    /// instead of returning them.
    pub async fn run_guarded(&self, id: JobId) -> ScheduledRun {
        let Some(_guard) = self.try_begin(id) else {
            warn!(job = %id, "previous run still in progress, skipping");
            return ScheduledRun::Skipped;
        };
        match self.run_job(id).await {
            Ok(summary) => ScheduledRun::Completed(summary),
            Err(err) => {
                error!(job = %id, error = format!("{err:#}"), "scheduled job failed");
                ScheduledRun::Failed
            }
        }
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for spec in self.registry.enabled() {
            let id = spec.id;
            let pipeline = self.clone();
            let job = Job::new_async(spec.cron.as_str(), move |_uuid, _l| {
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    pipeline.run_guarded(id).await;
                })
            })
            .with_context(|| format!("creating scheduler job {id} for cron {}", spec.cron))?;
            sched
                .add(job)
                .await
                .with_context(|| format!("adding scheduler job {id}"))?;
            info!(job = %id, cron = %spec.cron, "job scheduled");
        }
        Ok(Some(sched))
    }
}

pub async fn run_job_from_env(id: JobId) -> Result<JobRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_job(id).await
}
