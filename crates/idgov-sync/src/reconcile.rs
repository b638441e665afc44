//! Cross-source join recipes and the helpdesk agent write-back plans derived from them.

use std::collections::HashSet;

use idgov_adapters::NewAgent;
use idgov_core::{identity_key, join, JoinKind, JoinSpec, Table, TableError};
use serde::Serialize;

pub const DIRECTORY_PREFIX: &str = "dir_";
pub const DIRECTORY_KEY: &str = "dir_user_principal_name";

/// Directory columns never carried into a reconciliation table.
const DIRECTORY_DROPPED: [&str; 3] = [
    "id",
    "password_profile_force_change_password_next_sign_in",
    "password_profile_force_change_password_next_sign_in_with_mfa",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipe {
    /// Both populations overlap without either containing the other.
    EmployeesWithDirectory,
    /// Partners are authoritative; directory columns are supplementary.
    PartnersWithDirectory,
    AgentsWithDirectory,
}

impl Recipe {
    pub fn name(&self) -> &'static str {
        match self {
            Recipe::EmployeesWithDirectory => "employees_with_directory",
            Recipe::PartnersWithDirectory => "partners_with_directory",
            Recipe::AgentsWithDirectory => "agents_with_directory",
        }
    }

    pub fn kind(&self) -> JoinKind {
        match self {
            Recipe::EmployeesWithDirectory => JoinKind::Outer,
            Recipe::PartnersWithDirectory | Recipe::AgentsWithDirectory => JoinKind::Left,
        }
    }

    /// Identity column of the non-directory side.
    pub fn left_key(&self) -> &'static str {
        match self {
            Recipe::EmployeesWithDirectory | Recipe::PartnersWithDirectory => "email",
            Recipe::AgentsWithDirectory => "email_id",
        }
    }

    pub fn apply(&self, left: &Table, directory_users: &Table) -> Result<Table, TableError> {
        left.require_column(self.left_key())?;
        let right = directory_side(directory_users)?;
        let spec = JoinSpec::new(self.kind(), self.left_key(), DIRECTORY_KEY).identity();
        join(left, &right, &spec)
    }
}

/// Directory users as they enter a recipe: named columns dropped, the rest prefixed.
pub fn directory_side(users: &Table) -> Result<Table, TableError> {
    users.require_column("user_principal_name")?;
    Ok(users.drop_columns(&DIRECTORY_DROPPED).prefixed(DIRECTORY_PREFIX))
}

/// Enabled member accounts whose mailbox belongs to a person.
pub fn eligible_directory_users(users: &Table) -> Table {
    users.filter(|row| {
        row.str("user_purpose") == Some("user")
            && row.str("user_type") == Some("Member")
            && row.cell("account_enabled").as_bool() == Some(true)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SafetyGate {
    pub max_fraction: f64,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self { max_fraction: 0.10 }
    }
}

impl SafetyGate {
    /// True when `actions` is strictly below `max_fraction` of a non-empty population.
    pub fn permits(&self, actions: usize, population: usize) -> bool {
        population > 0 && (actions as f64) / (population as f64) < self.max_fraction
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRef {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeactivationPlan {
    pub agents: Vec<AgentRef>,
    /// Size of the authoritative population the gate measures against.
    pub population: usize,
}

/// Active agents with no eligible directory account. The population is every directory user.
pub fn plan_deactivations(
    agents: &Table,
    directory_users: &Table,
) -> Result<DeactivationPlan, TableError> {
    if agents.is_empty() {
        return Ok(DeactivationPlan {
            agents: Vec::new(),
            population: directory_users.len(),
        });
    }
    agents.require_column("user_id")?;
    agents.require_column("status")?;
    let eligible = eligible_directory_users(directory_users);
    let matched = Recipe::AgentsWithDirectory.apply(agents, &eligible)?;

    let mut seen = HashSet::new();
    let mut planned = Vec::new();
    for row in matched.iter() {
        if row.str("status") != Some("Active") || !row.cell(DIRECTORY_KEY).is_null() {
            continue;
        }
        let user_id = row.cell("user_id").to_string();
        if !seen.insert(user_id.clone()) {
            continue;
        }
        planned.push(AgentRef {
            user_id,
            email: row.str("email_id").map(str::to_string),
            name: row.str("name").map(str::to_string),
        });
    }
    Ok(DeactivationPlan {
        agents: planned,
        population: directory_users.len(),
    })
}

/// Eligible directory users unknown to the helpdesk, as verified agents to create.
pub fn plan_provisioning(
    helpdesk_users: &Table,
    directory_users: &Table,
) -> Result<Vec<NewAgent>, TableError> {
    let mut known = HashSet::new();
    if helpdesk_users.has_column("email_id") {
        known.extend(
            helpdesk_users
                .column_values("email_id")?
                .into_iter()
                .filter_map(|cell| cell.as_str().map(identity_key)),
        );
    }

    let eligible = eligible_directory_users(directory_users);
    eligible.require_column("user_principal_name")?;
    let mut planned = Vec::new();
    let mut seen = HashSet::new();
    for row in eligible.iter() {
        let Some(upn) = row.str("user_principal_name") else {
            continue;
        };
        let key = identity_key(upn);
        if known.contains(&key) || !seen.insert(key.clone()) {
            continue;
        }
        let name = row.str("display_name").unwrap_or(upn);
        planned.push(NewAgent::verified(name, &key));
    }
    Ok(planned)
}

#[cfg(test)]
mod tests {
    use idgov_core::Cell;

    use super::*;

    fn directory(rows: &[(&str, &str, &str, bool)]) -> Table {
        let columns = [
            "id",
            "user_principal_name",
            "display_name",
            "user_purpose",
            "user_type",
            "account_enabled",
            "password_profile_force_change_password_next_sign_in",
        ];
        let rows = rows
            .iter()
            .enumerate()
            .map(|(i, (upn, purpose, kind, enabled))| {
                vec![
                    Cell::text(format!("u-{i}")),
                    Cell::text(*upn),
                    Cell::text(upn.split('@').next().unwrap_or_default()),
                    Cell::text(*purpose),
                    Cell::text(*kind),
                    Cell::Bool(*enabled),
                    Cell::Bool(false),
                ]
            })
            .collect();
        Table::from_rows(columns.iter().map(|c| c.to_string()).collect(), rows).expect("table")
    }

    fn people(key: &str, emails: &[&str]) -> Table {
        let rows = emails
            .iter()
            .enumerate()
            .map(|(i, e)| vec![Cell::Int(i as i64 + 1), Cell::text(*e)])
            .collect();
        Table::from_rows(vec!["id".into(), key.into()], rows).expect("table")
    }

    #[test]
    fn directory_side_drops_and_prefixes_by_name() {
        let side = directory_side(&directory(&[("a1@x.com", "user", "Member", true)])).expect("side");
        assert_eq!(
            side.columns(),
            [
                "dir_user_principal_name",
                "dir_display_name",
                "dir_user_purpose",
                "dir_user_type",
                "dir_account_enabled",
            ]
        );
    }

    #[test]
    fn join_kinds_follow_the_recipe() {
        let dir = directory(&[
            ("a1@x.com", "user", "Member", true),
            ("a3@x.com", "user", "Member", true),
        ]);
        let erp = people("email", &["A1@X.com ", "a2@x.com"]);

        let employees = Recipe::EmployeesWithDirectory.apply(&erp, &dir).expect("outer");
        assert_eq!(employees.len(), 3);
        assert_eq!(employees.value(0, DIRECTORY_KEY), Some(&Cell::text("a1@x.com")));
        assert_eq!(employees.value(1, DIRECTORY_KEY), Some(&Cell::Null));
        assert_eq!(employees.value(2, "email"), Some(&Cell::Null));
        assert_eq!(employees.value(2, DIRECTORY_KEY), Some(&Cell::text("a3@x.com")));

        let partners = Recipe::PartnersWithDirectory.apply(&erp, &dir).expect("left");
        assert_eq!(partners.len(), 2);
        assert_eq!(partners.value(1, "dir_display_name"), Some(&Cell::Null));

        let inner = join(
            &erp,
            &directory_side(&dir).expect("side"),
            &JoinSpec::new(JoinKind::Inner, "email", DIRECTORY_KEY).identity(),
        )
        .expect("inner");
        assert_eq!(inner.len(), 1);
    }

    #[test]
    fn null_keys_never_match_but_rows_survive() {
        let dir = directory(&[("a1@x.com", "user", "Member", true)]);
        let mut erp = people("email", &["a1@x.com"]);
        erp.push_row(vec![Cell::Int(9), Cell::Null]).expect("row");

        let partners = Recipe::PartnersWithDirectory.apply(&erp, &dir).expect("left");
        assert_eq!(partners.len(), 2);
        assert_eq!(partners.value(1, DIRECTORY_KEY), Some(&Cell::Null));
    }

    #[test]
    fn safety_gate_threshold_is_strict() {
        let gate = SafetyGate::default();
        assert!(!gate.permits(11, 100));
        assert!(!gate.permits(10, 100));
        assert!(gate.permits(9, 100));
        assert!(gate.permits(0, 100));
        assert!(!gate.permits(0, 0));
    }

    #[test]
    fn deactivation_targets_active_agents_without_eligible_accounts() {
        let dir = directory(&[
            ("ana@x.com", "user", "Member", true),
            ("omar@x.com", "user", "Member", false),
            ("shared@x.com", "shared", "Member", true),
        ]);
        let agents = Table::from_rows(
            vec!["user_id".into(), "name".into(), "email_id".into(), "status".into()],
            vec![
                vec![Cell::Int(11), Cell::text("Ana"), Cell::text("ana@x.com"), Cell::text("Active")],
                vec![Cell::Int(12), Cell::text("Omar"), Cell::text("omar@x.com"), Cell::text("Active")],
                vec![Cell::Int(13), Cell::text("Desk"), Cell::text("shared@x.com"), Cell::text("Active")],
                vec![Cell::Int(14), Cell::text("Gone"), Cell::text("gone@x.com"), Cell::text("Inactive")],
            ],
        )
        .expect("agents");

        let plan = plan_deactivations(&agents, &dir).expect("plan");
        assert_eq!(plan.population, 3);
        let ids: Vec<&str> = plan.agents.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(ids, ["12", "13"]);
        assert_eq!(plan.agents[0].email.as_deref(), Some("omar@x.com"));
    }

    #[test]
    fn provisioning_skips_known_and_ineligible_users() {
        let dir = directory(&[
            ("ana@x.com", "user", "Member", true),
            ("Lina@X.com", "user", "Member", true),
            ("guest@y.com", "user", "Guest", true),
            ("room@x.com", "room", "Member", true),
        ]);
        let helpdesk = people("email_id", &["ANA@x.com"]);

        let planned = plan_provisioning(&helpdesk, &dir).expect("plan");
        assert_eq!(planned, vec![NewAgent::verified("Lina", "lina@x.com")]);
    }
}
