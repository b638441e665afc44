//! Job registry: every scheduled job, the tables it owns and how each one is written.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use idgov_adapters::{DirectoryDataset, ErpDataset, HelpdeskDataset, TrainingDataset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::Recipe;

/// Warehouse table the ERP reconciliation reads directory users back from.
pub const DIRECTORY_USERS_TABLE: &str = "directory_users";

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("job `{0}` is registered twice")]
    DuplicateJob(JobId),
    #[error("table `{table}` is written by both `{first}` and `{second}`")]
    SharedTable {
        table: String,
        first: JobId,
        second: JobId,
    },
    #[error("job `{job}` has invalid cron `{cron}`: expected 6 or 7 fields")]
    InvalidCron { job: JobId, cron: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobId {
    Directory,
    DirectoryWeekly,
    HelpdeskIt,
    HelpdeskCare,
    Erp,
    Training,
    AgentLifecycle,
}

impl JobId {
    pub const ALL: [JobId; 7] = [
        JobId::Directory,
        JobId::DirectoryWeekly,
        JobId::HelpdeskIt,
        JobId::HelpdeskCare,
        JobId::Erp,
        JobId::Training,
        JobId::AgentLifecycle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobId::Directory => "directory",
            JobId::DirectoryWeekly => "directory-weekly",
            JobId::HelpdeskIt => "helpdesk-it",
            JobId::HelpdeskCare => "helpdesk-care",
            JobId::Erp => "erp",
            JobId::Training => "training",
            JobId::AgentLifecycle => "agent-lifecycle",
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::ALL
            .into_iter()
            .find(|id| id.name() == s.trim())
            .ok_or_else(|| RegistryError::UnknownJob(s.to_string()))
    }
}

/// Helpdesk brands run as separate platform tenants with their own credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelpdeskBrand {
    It,
    Care,
}

impl HelpdeskBrand {
    pub fn name(&self) -> &'static str {
        match self {
            HelpdeskBrand::It => "it",
            HelpdeskBrand::Care => "care",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    Directory(DirectoryDataset),
    Helpdesk(HelpdeskBrand, HelpdeskDataset),
    Erp(ErpDataset),
    Training(TrainingDataset),
    Reconcile(Recipe),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Erase the table, then append.
    Refresh,
    Append,
    /// Erase rows whose `key_column` equals the first fetched row's value, then append.
    RefreshRows { key_column: &'static str },
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Refresh => f.write_str("refresh"),
            WriteMode::Append => f.write_str("append"),
            WriteMode::RefreshRows { key_column } => write!(f, "refresh_rows({key_column})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStep {
    pub table: &'static str,
    pub fetch: Fetch,
    pub mode: WriteMode,
}

const fn refresh(table: &'static str, fetch: Fetch) -> TableStep {
    TableStep {
        table,
        fetch,
        mode: WriteMode::Refresh,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    Tables(Vec<TableStep>),
    /// Helpdesk agent provisioning and gated deactivation. Writes no table.
    AgentLifecycle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub id: JobId,
    /// `sec min hour day-of-month month day-of-week`, UTC.
    pub cron: String,
    pub enabled: bool,
    pub action: JobAction,
}

impl JobSpec {
    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables = Vec::new();
        if let JobAction::Tables(steps) = &self.action {
            for step in steps {
                if !tables.contains(&step.table) {
                    tables.push(step.table);
                }
            }
        }
        tables
    }
}

fn directory_steps() -> Vec<TableStep> {
    use DirectoryDataset::*;
    [
        ("directory_users", Users),
        ("directory_groups", Groups),
        ("directory_group_user_members", GroupUserMembers),
        ("directory_group_group_members", GroupGroupMembers),
        ("directory_group_owners", GroupOwners),
        ("directory_device_users", DeviceUsers),
        ("directory_user_licenses", UserLicenses),
        ("directory_targets", Targets),
        ("directory_service_principals", ServicePrincipals),
        ("directory_auth_methods", AuthMethods),
        ("directory_managed_devices", ManagedDevices),
    ]
    .into_iter()
    .map(|(table, dataset)| refresh(table, Fetch::Directory(dataset)))
    .collect()
}

fn erp_steps() -> Vec<TableStep> {
    use ErpDataset::*;
    let mut steps: Vec<TableStep> = [
        ("erp_subsidiaries", Subsidiaries),
        ("erp_roles", Roles),
        ("erp_role_permissions", RolePermissions),
        ("erp_role_record_usage", RoleRecordUsage),
        ("erp_role_subsidiaries", RoleSubsidiaries),
        ("erp_employees", Employees),
        ("erp_employees_all", EmployeesAll),
        ("erp_employees_licensed", EmployeesLicensed),
        ("erp_partners_active", PartnersActive),
        ("erp_partners_licensed", PartnersLicensed),
        ("erp_employee_roles", EmployeeRoles),
        ("erp_partner_roles", PartnerRoles),
        ("erp_employee_licenses", EmployeeLicenses),
        ("erp_licensed_union", LicensedUnion),
        ("erp_approval_matrix", ApprovalMatrix),
        ("erp_login_audits", LoginAudits),
        ("erp_login_failures", LoginFailures),
        ("erp_scripts", Scripts),
        ("erp_client_scripts", ClientScripts),
        ("erp_client_script_deployments", ClientScriptDeployments),
        ("erp_script_logs", ScriptLogs),
    ]
    .into_iter()
    .map(|(table, dataset)| refresh(table, Fetch::Erp(dataset)))
    .collect();
    steps.push(refresh(
        "erp_employees_directory",
        Fetch::Reconcile(Recipe::EmployeesWithDirectory),
    ));
    steps.push(refresh(
        "erp_partners_directory",
        Fetch::Reconcile(Recipe::PartnersWithDirectory),
    ));
    steps
}

/// The built-in job table.
pub fn default_jobs() -> Vec<JobSpec> {
    let job = |id, cron: &str, action| JobSpec {
        id,
        cron: cron.to_string(),
        enabled: true,
        action,
    };
    let care = |table, dataset| refresh(table, Fetch::Helpdesk(HelpdeskBrand::Care, dataset));

    vec![
        job(JobId::Directory, "0 0 1-10 * * 1-5", JobAction::Tables(directory_steps())),
        job(
            JobId::DirectoryWeekly,
            "0 0 1 * * 1",
            JobAction::Tables(vec![TableStep {
                table: "directory_onedrive_usage",
                fetch: Fetch::Directory(DirectoryDataset::OneDriveUsage),
                mode: WriteMode::RefreshRows {
                    key_column: "refresh_date",
                },
            }]),
        ),
        job(
            JobId::HelpdeskIt,
            "0 20 1-10 * * 1-5",
            JobAction::Tables(vec![refresh(
                "helpdesk_it_tickets",
                Fetch::Helpdesk(HelpdeskBrand::It, HelpdeskDataset::Tickets),
            )]),
        ),
        job(
            JobId::HelpdeskCare,
            "0 30 1-10 * * 1-5",
            JobAction::Tables(vec![
                care("helpdesk_care_contacts", HelpdeskDataset::Contacts),
                care("helpdesk_care_agents", HelpdeskDataset::Agents),
                care("helpdesk_care_tickets", HelpdeskDataset::Tickets),
            ]),
        ),
        job(JobId::Erp, "0 10 1-10 * * 1-5", JobAction::Tables(erp_steps())),
        job(
            JobId::Training,
            "0 40 1 * * 1-5",
            JobAction::Tables(vec![
                refresh("training_learners", Fetch::Training(TrainingDataset::Learners)),
                refresh("training_campaigns", Fetch::Training(TrainingDataset::Campaigns)),
                refresh(
                    "training_learner_progress",
                    Fetch::Training(TrainingDataset::LearnerProgress),
                ),
                TableStep {
                    table: "training_learner_progress",
                    fetch: Fetch::Training(TrainingDataset::TimelineEvents),
                    mode: WriteMode::Append,
                },
            ]),
        ),
        JobSpec {
            enabled: false,
            ..job(JobId::AgentLifecycle, "0 45 1-10 * * 1-5", JobAction::AgentLifecycle)
        },
    ]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobOverride {
    pub enabled: Option<bool>,
    pub cron: Option<String>,
}

/// Contents of `jobs.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobOverride>,
}

#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Vec<JobSpec>,
}

impl JobRegistry {
    /// Validates job and table ownership uniqueness and cron shape.
    pub fn new(jobs: Vec<JobSpec>) -> Result<Self, RegistryError> {
        let mut seen_jobs = Vec::new();
        let mut owners: HashMap<&'static str, JobId> = HashMap::new();
        for job in &jobs {
            if seen_jobs.contains(&job.id) {
                return Err(RegistryError::DuplicateJob(job.id));
            }
            seen_jobs.push(job.id);
            validate_cron(job)?;
            for table in job.tables() {
                if let Some(first) = owners.insert(table, job.id) {
                    return Err(RegistryError::SharedTable {
                        table: table.to_string(),
                        first,
                        second: job.id,
                    });
                }
            }
        }
        Ok(Self { jobs })
    }

    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(default_jobs())
    }

    /// Built-in jobs with `jobs.yaml` overrides applied. A missing file means no overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let registry = Self::builtin()?;
        if !path.exists() {
            return Ok(registry);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: JobsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry
            .with_overrides(&file)
            .with_context(|| format!("applying {}", path.display()))
    }

    pub fn with_overrides(mut self, file: &JobsFile) -> Result<Self, RegistryError> {
        for (name, patch) in &file.jobs {
            let id: JobId = name.parse()?;
            let job = self
                .jobs
                .iter_mut()
                .find(|job| job.id == id)
                .ok_or_else(|| RegistryError::UnknownJob(name.clone()))?;
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
            }
            if let Some(cron) = &patch.cron {
                job.cron = cron.trim().to_string();
            }
        }
        Self::new(self.jobs)
    }

    pub fn get(&self, id: JobId) -> Result<&JobSpec, RegistryError> {
        self.jobs
            .iter()
            .find(|job| job.id == id)
            .ok_or_else(|| RegistryError::UnknownJob(id.name().to_string()))
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn enabled(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.iter().filter(|job| job.enabled)
    }
}

fn validate_cron(job: &JobSpec) -> Result<(), RegistryError> {
    let fields = job.cron.split_whitespace().count();
    if (6..=7).contains(&fields) {
        Ok(())
    } else {
        Err(RegistryError::InvalidCron {
            job: job.id,
            cron: job.cron.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn builtin_registry_is_valid_and_complete() {
        let registry = JobRegistry::builtin().expect("registry");
        let names: Vec<&str> = registry.jobs().iter().map(|j| j.id.name()).collect();
        assert_eq!(
            names,
            [
                "directory",
                "directory-weekly",
                "helpdesk-it",
                "helpdesk-care",
                "erp",
                "training",
                "agent-lifecycle"
            ]
        );
        assert_eq!(registry.enabled().count(), 6);

        let erp = registry.get(JobId::Erp).expect("erp");
        assert_eq!(erp.cron, "0 10 1-10 * * 1-5");
        assert_eq!(erp.tables().len(), 23);
        assert!(erp.tables().contains(&"erp_employees_directory"));

        let training = registry.get(JobId::Training).expect("training");
        assert_eq!(
            training.tables(),
            ["training_learners", "training_campaigns", "training_learner_progress"]
        );
        assert!(registry
            .get(JobId::Directory)
            .expect("directory")
            .tables()
            .contains(&DIRECTORY_USERS_TABLE));
    }

    #[test]
    fn job_names_round_trip_and_unknown_names_fail() {
        for id in JobId::ALL {
            assert_eq!(id.name().parse::<JobId>(), Ok(id));
        }
        assert_eq!(
            "payroll".parse::<JobId>(),
            Err(RegistryError::UnknownJob("payroll".into()))
        );
    }

    #[test]
    fn two_jobs_writing_one_table_are_rejected() {
        let mut jobs = default_jobs();
        jobs.push(JobSpec {
            id: JobId::AgentLifecycle,
            cron: "0 0 * * * *".into(),
            enabled: true,
            action: JobAction::AgentLifecycle,
        });
        assert_eq!(
            JobRegistry::new(jobs).unwrap_err(),
            RegistryError::DuplicateJob(JobId::AgentLifecycle)
        );

        let mut jobs = default_jobs();
        if let JobAction::Tables(steps) = &mut jobs[3].action {
            steps[0].table = "helpdesk_it_tickets";
        }
        assert_eq!(
            JobRegistry::new(jobs).unwrap_err(),
            RegistryError::SharedTable {
                table: "helpdesk_it_tickets".into(),
                first: JobId::HelpdeskIt,
                second: JobId::HelpdeskCare,
            }
        );
    }

    #[test]
    fn yaml_overrides_toggle_and_reschedule() {
        let mut file = tempfile::NamedTempFile::new().expect("temp");
        writeln!(
            file,
            "jobs:\n  agent-lifecycle:\n    enabled: true\n  erp:\n    cron: \"0 15 2 * * 1-5\"\n"
        )
        .expect("write");

        let registry = JobRegistry::load(file.path()).expect("load");
        assert!(registry.get(JobId::AgentLifecycle).expect("job").enabled);
        assert_eq!(registry.get(JobId::Erp).expect("job").cron, "0 15 2 * * 1-5");
        assert_eq!(registry.enabled().count(), 7);
    }

    #[test]
    fn unknown_jobs_and_bad_crons_fail_at_startup() {
        let file: JobsFile = serde_yaml::from_str("jobs:\n  payroll:\n    enabled: true\n").expect("yaml");
        assert_eq!(
            JobRegistry::builtin().expect("registry").with_overrides(&file).unwrap_err(),
            RegistryError::UnknownJob("payroll".into())
        );

        let file: JobsFile = serde_yaml::from_str("jobs:\n  erp:\n    cron: \"0 10 * * *\"\n").expect("yaml");
        assert!(matches!(
            JobRegistry::builtin().expect("registry").with_overrides(&file),
            Err(RegistryError::InvalidCron { job: JobId::Erp, .. })
        ));

        assert!(serde_yaml::from_str::<JobsFile>("jobs:\n  erp:\n    enabeld: true\n").is_err());
    }

    #[test]
    fn missing_jobs_file_keeps_defaults() {
        let registry = JobRegistry::load(Path::new("/no/such/jobs.yaml")).expect("load");
        assert!(!registry.get(JobId::AgentLifecycle).expect("job").enabled);
    }

    #[test]
    fn write_modes_render_for_summaries() {
        assert_eq!(WriteMode::Refresh.to_string(), "refresh");
        assert_eq!(
            WriteMode::RefreshRows { key_column: "refresh_date" }.to_string(),
            "refresh_rows(refresh_date)"
        );
    }
}
