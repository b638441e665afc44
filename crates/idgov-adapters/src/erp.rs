//! ERP client over a SuiteQL RESTlet: roles and permissions, employees and partners,
//! approval routing, login audits and script inventory.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use idgov_core::{aggregate_max_level, join, Cell, JoinKind, JoinSpec, PermissionLevel, SourceSystem, Table};
use idgov_storage::{ApiSession, Method, PageProtocol};
use serde_json::json;
use tracing::info;

use crate::cache::EntityCache;
use crate::normalize::{
    coerce_temporal, collapse_spaces, fold_identity, records_to_table, require_columns,
    NormalizeError, Temporal,
};
use crate::{SourceClient, SourceError};

pub const DEFAULT_SCRIPT: &str = "1740";
pub const DEFAULT_DEPLOY: &str = "1";
pub const DEFAULT_PAGE_SIZE: usize = 10_000;
pub const RESTLET_PATH: &str = "restlet.nl";
/// Window of the login audit and login failure datasets.
pub const LOGIN_WINDOW_DAYS: u32 = 60;
/// Window of system notes considered for role record usage.
pub const USAGE_WINDOW_DAYS: u32 = 180;

/// RESTlet host root for an account id, e.g. `1234567_SB1` -> `1234567-sb1`.
pub fn restlet_base_url(account_id: &str) -> String {
    format!(
        "https://{}.restlets.api.netsuite.com/app/site/hosting",
        account_id.trim().to_ascii_lowercase().replace('_', "-")
    )
}

const SUBSIDIARIES_SQL: &str = "SELECT Subsidiary.id, Subsidiary.name, Subsidiary.parent, \
Subsidiary.tranprefix, Subsidiary.traninternalprefix, Subsidiary.lastmodifieddate, \
Subsidiary.isinactive, BUILTIN.DF(Subsidiary.country) AS country, \
BUILTIN.DF(Subsidiary.currency) AS currency FROM Subsidiary WHERE Subsidiary.isinactive = 'F'";

const ROLES_SQL: &str = "SELECT id, name, scriptid, isinactive, issalesrole, iswebserviceonlyrole, \
employeerestriction, subsidiaryviewingallowed, subsidiaryoption, effectivesubsidiaries, \
coreadminpermission, employeeselectionunrestricted, centertype FROM role WHERE role.isinactive = 'F'";

const EMPLOYEE_ROLE_LINKS_SQL: &str = "SELECT EmployeeRolesForSearch.role AS role_id, \
Employee.id AS entity_id FROM Employee LEFT JOIN EmployeeRolesForSearch \
ON EmployeeRolesForSearch.entity = Employee.id WHERE Employee.giveaccess = 'T'";

const PARTNER_ROLE_LOGINS_SQL: &str = "SELECT Partner.id AS partner_id, LoginAudit.role AS role_id, \
TO_CHAR(LoginAudit.date, 'YYYY-MM-DD HH24:MI:SS') AS login_at FROM Partner \
JOIN LoginAudit ON Partner.id = LoginAudit.user \
WHERE Partner.giveaccess = 'T' AND LoginAudit.role IS NOT NULL";

const ROLE_RESTRICTIONS_SQL: &str = "SELECT roleRestrictions.viewingAllowed AS viewing_allowed, \
roleRestrictions.itemsRestricted AS items_restricted, roleRestrictions.restriction, \
roleRestrictions.role, roleRestrictions.segment FROM roleRestrictions";

const ROLE_PERMISSIONS_SQL: &str = "SELECT RolePermissions.role, RolePermissions.permkey AS perm_key, \
RolePermissions.name AS perm_name, RolePermissions.permlevel AS perm_level, \
RolePermissions.restriction AS perm_restriction FROM RolePermissions";

const CUSTOM_RECORDS_SQL: &str =
    "SELECT CustomRecordType.internalId AS internalid, CustomRecordType.name FROM CustomRecordType";
const CUSTOM_LISTS_SQL: &str =
    "SELECT CustomList.internalId AS internalid, CustomList.name FROM CustomList";

const EMPLOYEE_SELECT: &str = "SELECT Employee.id, \
Employee.custentity_global_employee_id AS global_empid, Employee.email, Employee.entityid, \
Employee.giveaccess, Employee.firstname, Employee.middlename, Employee.lastname, Employee.title, \
Employee.issalesrep, Employee.issupportrep, Employee.isjobresource, Employee.isjobmanager, \
Employee.isinactive, Employee.datecreated, Employee.lastmodifieddate, \
BUILTIN.DF(Employee.class) AS regco_name, Subsidiary.name AS subsidiary_name, \
BUILTIN.DF(Subsidiary.country) AS subsidiary_country, Supervisor.email AS supervisor_email, \
Department.fullname AS department FROM Employee \
LEFT OUTER JOIN Department ON Employee.department = Department.id \
LEFT OUTER JOIN Subsidiary ON Employee.subsidiary = Subsidiary.id \
LEFT OUTER JOIN Employee AS Supervisor ON Supervisor.id = Employee.supervisor";

const PARTNER_SELECT: &str = "SELECT Partner.id, Partner.email, Partner.partnercode, Partner.entityid, \
Partner.giveaccess AS partner_license, Partner.firstname, Partner.middlename, Partner.lastname, \
Partner.title, Partner.isperson, Partner.isinactive, Partner.subpartnerlogin, Partner.companyname, \
Partner.datecreated, Partner.lastmodifieddate, Subsidiary.name AS subsidiary_name, \
BUILTIN.DF(Subsidiary.country) AS subsidiary_country, Supervisor.email AS supervisor_email, \
BUILTIN.DF(Partner.department) AS department FROM Partner \
LEFT OUTER JOIN PartnerSubsidiaryRelationship ON PartnerSubsidiaryRelationship.entity = Partner.id \
LEFT OUTER JOIN Subsidiary ON PartnerSubsidiaryRelationship.subsidiary = Subsidiary.id \
LEFT OUTER JOIN Partner AS Supervisor ON Supervisor.id = Partner.parent";

const APPROVAL_MATRIX_SQL: &str = "SELECT RecordList.id AS list_id, RecordList.name AS list_name, \
Matrix.recordid AS record_id, Matrix.name AS record_name, Matrix.custrecord_approval_desc AS description, \
Matrix.custrecord_approver_l1 AS approver_l1, Matrix.custrecord_approver_l1_email AS approver_l1_email, \
Matrix.custrecord_approver_l2 AS approver_l2, Matrix.custrecord_approver_l2_email AS approver_l2_email, \
Matrix.custrecord_approver_l3 AS approver_l3, Matrix.custrecord_approver_l3_email AS approver_l3_email \
FROM customlist_approval_record_list RecordList \
LEFT JOIN customrecord_approval_matrix Matrix ON RecordList.recordid = Matrix.custrecord_approval_record \
WHERE Matrix.isinactive = 'F'";

const CLIENT_SCRIPT_DEPLOYMENTS_SQL: &str = "SELECT clientScriptDeployment.id, \
clientScriptDeployment.script, clientScriptDeployment.scriptid AS deploy_name, \
clientScriptDeployment.recordtype, clientScriptDeployment.allemployees, \
clientScriptDeployment.alllocalizationcontexts, clientScriptDeployment.allpartners, \
clientScriptDeployment.allroles, clientScriptDeployment.audience, clientScriptDeployment.hascodeaccess, \
clientScriptDeployment.isdeployed, clientScriptDeployment.deploymentid, clientScriptDeployment.eventtype, \
clientScriptDeployment.loglevel, clientScriptDeployment.primarykey, clientScriptDeployment.status, \
clientScriptDeployment.istask, clientScriptDeployment.version FROM clientScriptDeployment";

const CLIENT_SCRIPTS_SQL: &str = "SELECT clientScript.id, clientScript.scriptid, clientScript.apiversion, \
clientScript.isinactive, clientScript.scripttype, clientScript.description, clientScript.name, \
clientScript.owner, clientScript.fieldchangedfunction, clientScript.lineinitfunction, \
clientScript.notifyadmins, clientScript.notifyuser, clientScript.notifyemails, clientScript.notifygroup, \
clientScript.notifyowner, clientScript.pageinitfunction, clientScript.postsourcingfunction, \
clientScript.recalcfunction, clientScript.saverecordfunction, clientScript.scriptfile, \
clientScript.validatedeletefunction, clientScript.validatefieldfunction, \
clientScript.validateinsertfunction, clientScript.validatelinefunction FROM clientScript";

const SCRIPTS_SQL: &str = "SELECT script.id, script.scriptid, script.scripttype, script.isinactive, \
script.name, script.owner, script.deploymentmodel, script.description, script.apiversion, \
script.afterinstallfunction, script.aftersubmitfunction, script.afterupdatefunction, \
script.beforeinstallfunction, script.beforeloadfunction, script.beforesubmitfunction, \
script.beforeuninstallfunction, script.beforeupdatefunction, script.class, script.complexfunction, \
script.deletefunction, script.fieldchangedfunction, script.defaultfunction, script.getfunction, \
script.getinputdatafunction, script.lineinitfunction, script.returnrecordtype, script.mapfunction, \
script.notifyadmins, script.notifyuser, script.notifyemails, script.notifygroup, script.notifyowner, \
script.pageinitfunction, script.portlettype, script.postfunction, script.postsourcingfunction, \
script.putfunction, script.recalcfunction, script.reducefunction, script.returntype, \
script.saverecordfunction, script.scriptfile, script.summarizefunction, script.validatedeletefunction, \
script.validatefieldfunction, script.validateinsertfunction, script.validatelinefunction FROM script";

const SCRIPT_LOGS_SQL: &str = "SELECT ScriptNote.internalId AS internal_id, ScriptNote.date, \
ScriptNote.type AS log_type, ScriptNote.scriptType AS script_id, script.scripttype AS script_type, \
script.name AS script_name, ScriptNote.title, ScriptNote.detail FROM ScriptNote \
LEFT OUTER JOIN script ON ScriptNote.scriptType = script.id \
WHERE ScriptNote.type IN ('ERROR', 'SYSTEM') ORDER BY ScriptNote.date ASC";

fn login_audits_sql(days: u32) -> String {
    format!(
        "SELECT user_id, date, COUNT(date) AS login_count FROM (SELECT LoginAudit.user AS user_id, \
TRUNC(LoginAudit.date) AS date FROM LoginAudit WHERE LoginAudit.date >= SYSDATE - {days} \
AND LoginAudit.status = 'Success') GROUP BY user_id, date"
    )
}

fn login_failures_sql(days: u32) -> String {
    format!(
        "SELECT TO_CHAR(LoginAudit.date, 'YYYY-MM-DD HH24:MI:SS') AS datetime, \
TO_CHAR(LoginAudit.date, 'YYYY-MM-DD') AS date, LoginAudit.user AS user_id, \
BUILTIN.DF(LoginAudit.user) AS entity_name, LoginAudit.detail, LoginAudit.ipAddress AS ip_address, \
LoginAudit.requestUri AS request_uri, LoginAudit.userAgent AS user_agent FROM LoginAudit \
WHERE LoginAudit.date >= SYSDATE - {days} AND LoginAudit.status = 'Failure' \
ORDER BY LoginAudit.date DESC"
    )
}

fn record_usage_sql(days: u32) -> String {
    format!(
        "SELECT SystemNote.role AS role_id, SystemNote.recordTypeId AS recordtypeid, \
MAX(SystemNote.type) AS perm_level FROM SystemNote WHERE SystemNote.date >= SYSDATE - {days} \
AND SystemNote.field NOT LIKE '%MEDIA%' AND SystemNote.role IS NOT NULL \
GROUP BY SystemNote.role, SystemNote.recordTypeId"
    )
}

const EMPLOYEE_COLUMNS: [&str; 21] = [
    "id",
    "global_empid",
    "email",
    "entityid",
    "giveaccess",
    "firstname",
    "middlename",
    "lastname",
    "title",
    "issalesrep",
    "issupportrep",
    "isjobresource",
    "isjobmanager",
    "isinactive",
    "datecreated",
    "lastmodifieddate",
    "regco_name",
    "subsidiary_name",
    "subsidiary_country",
    "supervisor_email",
    "department",
];

const PARTNER_COLUMNS: [&str; 19] = [
    "id",
    "email",
    "partnercode",
    "entityid",
    "partner_license",
    "firstname",
    "middlename",
    "lastname",
    "title",
    "isperson",
    "isinactive",
    "subpartnerlogin",
    "companyname",
    "datecreated",
    "lastmodifieddate",
    "subsidiary_name",
    "subsidiary_country",
    "supervisor_email",
    "department",
];

pub const EMPLOYEE_LICENSE_COLUMNS: [&str; 21] = [
    "id",
    "email",
    "entityid",
    "giveaccess",
    "firstname",
    "middlename",
    "lastname",
    "title",
    "issalesrep",
    "issupportrep",
    "isjobresource",
    "isjobmanager",
    "datecreated",
    "lastmodifieddate",
    "isinactive",
    "regco_name",
    "subsidiary_name",
    "subsidiary_country",
    "supervisor_email",
    "department",
    "license_type",
];

pub const LICENSED_UNION_COLUMNS: [&str; 7] = [
    "id",
    "email",
    "entityid",
    "subsidiary_name",
    "subsidiary_country",
    "department",
    "license_type",
];

pub const APPROVAL_MATRIX_COLUMNS: [&str; 11] = [
    "list_id",
    "list_name",
    "record_id",
    "record_name",
    "description",
    "approver_l1_names",
    "approver_l1_email_names",
    "approver_l2_names",
    "approver_l2_email_names",
    "approver_l3_names",
    "approver_l3_email_names",
];

const APPROVER_FIELDS: [&str; 6] = [
    "approver_l1",
    "approver_l1_email",
    "approver_l2",
    "approver_l2_email",
    "approver_l3",
    "approver_l3_email",
];

const ROLE_USAGE_COLUMNS: [&str; 6] = [
    "role_id",
    "role_name",
    "recordtypeid",
    "perm_level_max",
    "recordtype_name",
    "recordtype_type",
];

const SCRIPT_OWNER_COLUMNS: [&str; 7] =
    ["id", "entityid", "email", "firstname", "lastname", "isinactive", "title"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErpDataset {
    Subsidiaries,
    /// Active roles with a user-assignment flag and their restriction segments pivoted.
    Roles,
    /// One row per role and permission key at its highest granted level.
    RolePermissions,
    RoleRecordUsage,
    RoleSubsidiaries,
    Employees,
    EmployeesAll,
    EmployeesLicensed,
    PartnersActive,
    PartnersLicensed,
    EmployeeRoles,
    /// Licensed partners with the role of their latest login.
    PartnerRoles,
    EmployeeLicenses,
    LicensedUnion,
    ApprovalMatrix,
    LoginAudits,
    LoginFailures,
    Scripts,
    ClientScripts,
    ClientScriptDeployments,
    ScriptLogs,
}

/// Cache keys: the public datasets plus intermediate query results they share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Entry {
    Dataset(ErpDataset),
    EmployeeRoleLinks,
    PartnerRoleLogins,
    RoleRestrictions,
    RecordDefinitions,
}

/// Restriction segment ids the account uses for classification.
pub fn segment_name(segment: &Cell) -> String {
    match segment.as_i64() {
        Some(-101) => "class".to_string(),
        Some(-102) => "department".to_string(),
        Some(-103) => "location".to_string(),
        _ => segment.to_string(),
    }
}

/// `Own (view=T, items=T)`; flags that are off are left out.
pub fn restriction_label(restriction: &str, viewing_allowed: bool, items_restricted: bool) -> String {
    let mut flags = Vec::new();
    if viewing_allowed {
        flags.push("view=T");
    }
    if items_restricted {
        flags.push("items=T");
    }
    if flags.is_empty() {
        restriction.to_string()
    } else {
        format!("{restriction} ({})", flags.join(", "))
    }
}

/// Resolves a comma-separated approver id list to entity names. Ids without an employee
/// render as `Invalid(<id>)`.
pub fn resolve_approvers(ids: &Cell, names: &HashMap<String, String>) -> Cell {
    let raw = match ids {
        Cell::Null => return Cell::Null,
        other => other.to_string(),
    };
    let resolved: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            names
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("Invalid({id})"))
        })
        .collect();
    if resolved.is_empty() {
        Cell::Null
    } else {
        Cell::text(resolved.join(", "))
    }
}

#[derive(Debug)]
pub struct ErpClient {
    session: ApiSession,
    script: String,
    deploy: String,
    page_size: usize,
    cache: EntityCache<Entry>,
}

impl ErpClient {
    /// `session` points at the account's RESTlet host root and signs with OAuth1.
    pub fn new(session: ApiSession) -> Self {
        use ErpDataset::*;
        let d = Entry::Dataset;

        let mut cache = EntityCache::new();
        cache.depends_on(
            d(Roles),
            &[Entry::EmployeeRoleLinks, Entry::PartnerRoleLogins, Entry::RoleRestrictions],
        );
        cache.depends_on(d(RoleRecordUsage), &[d(Roles), Entry::RecordDefinitions]);
        cache.depends_on(d(RolePermissions), &[d(Roles), d(RoleRecordUsage)]);
        cache.depends_on(d(RoleSubsidiaries), &[d(Roles), d(Subsidiaries)]);
        cache.depends_on(
            d(EmployeeRoles),
            &[d(EmployeesLicensed), Entry::EmployeeRoleLinks, d(Roles)],
        );
        cache.depends_on(
            d(PartnerRoles),
            &[d(PartnersLicensed), Entry::PartnerRoleLogins, d(Roles)],
        );
        cache.depends_on(d(EmployeeLicenses), &[d(EmployeeRoles)]);
        cache.depends_on(d(LicensedUnion), &[d(EmployeeLicenses), d(PartnersLicensed)]);
        cache.depends_on(d(ApprovalMatrix), &[d(EmployeesAll)]);
        cache.depends_on(d(Scripts), &[d(EmployeesAll)]);
        cache.depends_on(d(ClientScripts), &[d(EmployeesAll), d(ClientScriptDeployments)]);
        Self {
            session,
            script: DEFAULT_SCRIPT.to_string(),
            deploy: DEFAULT_DEPLOY.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            cache,
        }
    }

    pub fn with_deployment(mut self, script: impl Into<String>, deploy: impl Into<String>) -> Self {
        self.script = script.into();
        self.deploy = deploy.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Runs one SuiteQL query through the RESTlet, every page. An empty result still
    /// carries the `required` columns so downstream joins see a schema.
    async fn query(
        &self,
        entity: &'static str,
        sql: &str,
        required: &[&str],
    ) -> Result<Table, SourceError> {
        let request = self
            .session
            .request(Method::Post, RESTLET_PATH)
            .query(&[("script", self.script.as_str()), ("deploy", self.deploy.as_str())])
            .header("Prefer", "transient")
            .json(json!({
                "action": "queryRun",
                "query": sql,
                "id": null,
                "pageSize": self.page_size,
            }));
        let raw = self.session.fetch_all(request, &PageProtocol::restlet()).await?;
        let table = records_to_table(entity, &raw, &[])?;
        if table.width() == 0 {
            return Ok(Table::with_columns(required));
        }
        require_columns(&table, entity, required)?;
        Ok(table)
    }

    fn cached(&self, entry: Entry, refresh: bool) -> Option<Table> {
        self.cache.get(entry, refresh)
    }

    fn store(&mut self, dataset: ErpDataset, table: Table) -> Table {
        info!(source = "erp", entity = ?dataset, rows = table.len(), "normalized");
        self.cache.store(Entry::Dataset(dataset), table.clone());
        table
    }

    pub async fn subsidiaries(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::Subsidiaries), refresh) {
            return Ok(table);
        }
        let mut table = self
            .query("erp subsidiaries", SUBSIDIARIES_SQL, &["id", "name", "lastmodifieddate"])
            .await?;
        coerce_temporal(&mut table, "erp subsidiaries", &["lastmodifieddate"], Temporal::DayMonthYear)?;
        Ok(self.store(ErpDataset::Subsidiaries, table))
    }

    async fn employee_role_links(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::EmployeeRoleLinks, refresh) {
            return Ok(table);
        }
        let table = self
            .query("erp employee roles", EMPLOYEE_ROLE_LINKS_SQL, &["role_id", "entity_id"])
            .await?;
        self.cache.store(Entry::EmployeeRoleLinks, table.clone());
        Ok(table)
    }

    /// Latest login role per licensed partner.
    async fn partner_role_logins(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::PartnerRoleLogins, refresh) {
            return Ok(table);
        }
        let mut logins = self
            .query(
                "erp partner logins",
                PARTNER_ROLE_LOGINS_SQL,
                &["partner_id", "role_id", "login_at"],
            )
            .await?;
        coerce_temporal(&mut logins, "erp partner logins", &["login_at"], Temporal::Timestamp)?;
        let table = logins
            .latest_by("partner_id", "login_at")?
            .select(&["partner_id", "role_id"])?;
        self.cache.store(Entry::PartnerRoleLogins, table.clone());
        Ok(table)
    }

    /// One row per restricted role: `id`, a `restrict_<segment>` column per segment seen
    /// and `with_restriction`.
    async fn role_restrictions(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::RoleRestrictions, refresh) {
            return Ok(table);
        }
        let raw = self
            .query(
                "erp role restrictions",
                ROLE_RESTRICTIONS_SQL,
                &["viewing_allowed", "items_restricted", "restriction", "role", "segment"],
            )
            .await?;

        let mut segments: Vec<String> = Vec::new();
        let mut roles: Vec<String> = Vec::new();
        let mut labels: HashMap<(String, String), String> = HashMap::new();
        for row in raw.iter() {
            let Some(role) = row.cell("role").join_key() else {
                continue;
            };
            let segment = segment_name(row.cell("segment"));
            if !segments.contains(&segment) {
                segments.push(segment.clone());
            }
            if !roles.contains(&role) {
                roles.push(role.clone());
            }
            let label = restriction_label(
                &row.cell("restriction").to_string(),
                row.cell("viewing_allowed").as_bool() == Some(true),
                row.cell("items_restricted").as_bool() == Some(true),
            );
            labels.insert((role, segment), label);
        }

        let mut columns = vec!["id".to_string()];
        columns.extend(segments.iter().map(|s| format!("restrict_{s}")));
        columns.push("with_restriction".to_string());
        let rows = roles
            .iter()
            .map(|role| {
                let mut row = vec![Cell::text(role.clone())];
                row.extend(segments.iter().map(|segment| {
                    labels
                        .get(&(role.clone(), segment.clone()))
                        .map(|label| Cell::text(label.clone()))
                        .unwrap_or(Cell::Null)
                }));
                row.push(Cell::Bool(true));
                row
            })
            .collect();
        let table = Table::from_rows(columns, rows)?;
        self.cache.store(Entry::RoleRestrictions, table.clone());
        Ok(table)
    }

    pub async fn roles(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::Roles), refresh) {
            return Ok(table);
        }
        let mut roles = self
            .query("erp roles", ROLES_SQL, &["id", "name", "effectivesubsidiaries", "centertype"])
            .await?;

        let mut assigned: HashSet<String> = HashSet::new();
        for table in [
            self.employee_role_links(refresh).await?,
            self.partner_role_logins(refresh).await?,
        ] {
            assigned.extend(table.iter().filter_map(|row| row.cell("role_id").join_key()));
        }
        roles.add_column("with_user_assigned", |row| {
            Cell::Bool(
                row.cell("id")
                    .join_key()
                    .is_some_and(|id| assigned.contains(&id)),
            )
        })?;

        let restrictions = self.role_restrictions(refresh).await?;
        let mut table = join(&roles, &restrictions, &JoinSpec::on(JoinKind::Left, &["id"]))?;
        table.map_column("with_restriction", |cell| Cell::Bool(cell.as_bool() == Some(true)))?;
        Ok(self.store(ErpDataset::Roles, table))
    }

    /// Custom record types and custom lists by internal id.
    async fn record_definitions(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::RecordDefinitions, refresh) {
            return Ok(table);
        }
        let mut records = self
            .query("erp custom records", CUSTOM_RECORDS_SQL, &["internalid", "name"])
            .await?;
        records.set_column("recordtype_type", |_| Cell::text("Custom Record"));
        let mut lists = self
            .query("erp custom lists", CUSTOM_LISTS_SQL, &["internalid", "name"])
            .await?;
        lists.set_column("recordtype_type", |_| Cell::text("Custom List"));
        let mut table = Table::concat(&[records, lists]).select(&["internalid", "name", "recordtype_type"])?;
        table.rename("name", "recordtype_name")?;
        self.cache.store(Entry::RecordDefinitions, table.clone());
        Ok(table)
    }

    /// Highest change level each role applied per record type over the usage window.
    pub async fn role_record_usage(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::RoleRecordUsage), refresh) {
            return Ok(table);
        }
        let mut usage = self
            .query(
                "erp role record usage",
                &record_usage_sql(USAGE_WINDOW_DAYS),
                &["role_id", "recordtypeid", "perm_level"],
            )
            .await?;
        usage.add_column("perm_level_max", |row| {
            PermissionLevel::from_cell(row.cell("perm_level"))
                .map(|level| Cell::text(level.as_str()))
                .unwrap_or(Cell::Null)
        })?;
        let usage = usage.drop_columns(&["perm_level"]);

        let definitions = self.record_definitions(refresh).await?;
        let usage = join(
            &usage,
            &definitions,
            &JoinSpec::new(JoinKind::Left, "recordtypeid", "internalid"),
        )?
        .drop_columns(&["internalid"]);

        let mut roles = self.roles(false).await?.select(&["id", "name"])?;
        roles.rename("id", "role_id")?;
        roles.rename("name", "role_name")?;
        let table = join(&usage, &roles, &JoinSpec::on(JoinKind::Left, &["role_id"]))?
            .select(&ROLE_USAGE_COLUMNS)?;
        Ok(self.store(ErpDataset::RoleRecordUsage, table))
    }

    /// Every active role (prefixed `role_`) with its permissions, each collapsed to the
    /// highest level granted, and the highest level the role actually used on it.
    pub async fn role_permissions(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::RolePermissions), refresh) {
            return Ok(table);
        }
        let mut permissions = self
            .query(
                "erp role permissions",
                ROLE_PERMISSIONS_SQL,
                &["role", "perm_key", "perm_name", "perm_level"],
            )
            .await?;
        permissions = aggregate_max_level(&permissions, &["role", "perm_key"], "perm_level")?;
        permissions.add_column("perm_level_name", |row| {
            PermissionLevel::from_cell(row.cell("perm_level"))
                .map(|level| Cell::text(level.as_str()))
                .unwrap_or(Cell::Null)
        })?;

        let roles = self.roles(false).await?.prefixed("role_");
        let granted = join(&roles, &permissions, &JoinSpec::new(JoinKind::Left, "role_id", "role"))?
            .drop_columns(&["role"]);

        let mut usage = self
            .role_record_usage(false)
            .await?
            .select(&["role_id", "recordtype_name", "perm_level_max"])?;
        usage.rename("recordtype_name", "perm_name")?;
        let table = join(&granted, &usage, &JoinSpec::on(JoinKind::Left, &["role_id", "perm_name"]))?;
        Ok(self.store(ErpDataset::RolePermissions, table))
    }

    /// Roles fanned out over their effective subsidiaries.
    pub async fn role_subsidiaries(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::RoleSubsidiaries), refresh) {
            return Ok(table);
        }
        let roles = self.roles(false).await?.prefixed("role_");
        let subsidiaries = self.subsidiaries(false).await?.prefixed("subsi_");

        let mut pairs = Table::with_columns(&["role_id", "subsi_id"]);
        for row in roles.iter() {
            let Some(list) = row.str("role_effectivesubsidiaries") else {
                continue;
            };
            for id in list.split(',').map(str::trim).filter(|id| !id.is_empty()) {
                let parsed: i64 = id.parse().map_err(|_| NormalizeError::InvalidValue {
                    entity: "erp role subsidiaries",
                    field: "effectivesubsidiaries".to_string(),
                    value: list.to_string(),
                    expected: "comma-separated subsidiary ids",
                })?;
                pairs.push_row(vec![row.cell("role_id").clone(), Cell::Int(parsed)])?;
            }
        }

        let with_roles = join(&pairs, &roles, &JoinSpec::on(JoinKind::Left, &["role_id"]))?;
        let table = join(&with_roles, &subsidiaries, &JoinSpec::on(JoinKind::Left, &["subsi_id"]))?;
        Ok(self.store(ErpDataset::RoleSubsidiaries, table))
    }

    async fn employees_where(
        &mut self,
        dataset: ErpDataset,
        filter: &str,
        refresh: bool,
    ) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(dataset), refresh) {
            return Ok(table);
        }
        let sql = format!("{EMPLOYEE_SELECT} {filter}");
        let mut table = self.query("erp employees", &sql, &EMPLOYEE_COLUMNS).await?;
        coerce_temporal(
            &mut table,
            "erp employees",
            &["datecreated", "lastmodifieddate"],
            Temporal::DayMonthYear,
        )?;
        collapse_spaces(&mut table, "entityid");
        fold_identity(&mut table, "erp employees", "email")?;
        Ok(self.store(dataset, table))
    }

    /// Active employees.
    pub async fn employees(&mut self, refresh: bool) -> Result<Table, SourceError> {
        self.employees_where(ErpDataset::Employees, "WHERE Employee.isinactive = 'F'", refresh)
            .await
    }

    /// Active and inactive employees.
    pub async fn employees_all(&mut self, refresh: bool) -> Result<Table, SourceError> {
        self.employees_where(
            ErpDataset::EmployeesAll,
            "WHERE Employee.isinactive IN ('T', 'F')",
            refresh,
        )
        .await
    }

    /// Employees given access, whether active or not.
    pub async fn employees_licensed(&mut self, refresh: bool) -> Result<Table, SourceError> {
        self.employees_where(
            ErpDataset::EmployeesLicensed,
            "WHERE Employee.giveaccess = 'T'",
            refresh,
        )
        .await
    }

    async fn partners_where(
        &mut self,
        dataset: ErpDataset,
        filter: &str,
        refresh: bool,
    ) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(dataset), refresh) {
            return Ok(table);
        }
        let sql = format!("{PARTNER_SELECT} {filter}");
        let mut table = self.query("erp partners", &sql, &PARTNER_COLUMNS).await?;
        coerce_temporal(
            &mut table,
            "erp partners",
            &["datecreated", "lastmodifieddate"],
            Temporal::DayMonthYear,
        )?;
        fold_identity(&mut table, "erp partners", "email")?;
        Ok(self.store(dataset, table))
    }

    pub async fn partners_active(&mut self, refresh: bool) -> Result<Table, SourceError> {
        self.partners_where(ErpDataset::PartnersActive, "WHERE Partner.isinactive = 'F'", refresh)
            .await
    }

    pub async fn partners_licensed(&mut self, refresh: bool) -> Result<Table, SourceError> {
        self.partners_where(ErpDataset::PartnersLicensed, "WHERE Partner.giveaccess = 'T'", refresh)
            .await
    }

    /// Licensed employees with each assigned role's columns (prefixed `role_`).
    pub async fn employee_roles(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::EmployeeRoles), refresh) {
            return Ok(table);
        }
        let employees = self.employees_licensed(false).await?;
        let links = self.employee_role_links(refresh).await?;
        let roles = self.roles(false).await?.prefixed("role_");

        let assigned = join(&employees, &links, &JoinSpec::new(JoinKind::Inner, "id", "entity_id"))?
            .drop_columns(&["entity_id"]);
        let table = join(&assigned, &roles, &JoinSpec::on(JoinKind::Inner, &["role_id"]))?;
        Ok(self.store(ErpDataset::EmployeeRoles, table))
    }

    pub async fn partner_roles(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::PartnerRoles), refresh) {
            return Ok(table);
        }
        let partners = self.partners_licensed(false).await?;
        let logins = self.partner_role_logins(refresh).await?;
        let roles = self.roles(false).await?.prefixed("role_");

        let assigned = join(&partners, &logins, &JoinSpec::new(JoinKind::Inner, "id", "partner_id"))?
            .drop_columns(&["partner_id"]);
        let table = join(&assigned, &roles, &JoinSpec::on(JoinKind::Inner, &["role_id"]))?;
        Ok(self.store(ErpDataset::PartnerRoles, table))
    }

    /// License type per licensed employee and role center: `Employee` for the employee
    /// center, `Full` otherwise.
    pub async fn employee_licenses(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::EmployeeLicenses), refresh) {
            return Ok(table);
        }
        let mut roles = self.employee_roles(false).await?;
        roles.add_column("license_type", |row| match row.str("role_centertype") {
            Some("EMPLOYEE") => Cell::text("Employee"),
            _ => Cell::text("Full"),
        })?;
        let table = roles.select(&EMPLOYEE_LICENSE_COLUMNS)?.distinct();
        Ok(self.store(ErpDataset::EmployeeLicenses, table))
    }

    pub async fn licensed_union(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::LicensedUnion), refresh) {
            return Ok(table);
        }
        let employees = self.employee_licenses(false).await?;
        let mut partners = self.partners_licensed(false).await?;
        partners.set_column("license_type", |_| Cell::text("Partner"));
        let table = Table::concat(&[
            employees.project(&LICENSED_UNION_COLUMNS),
            partners.project(&LICENSED_UNION_COLUMNS),
        ]);
        Ok(self.store(ErpDataset::LicensedUnion, table))
    }

    /// Approval routing with approver ids resolved against all employees.
    pub async fn approval_matrix(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::ApprovalMatrix), refresh) {
            return Ok(table);
        }
        let mut required = vec!["list_id", "list_name", "record_id", "record_name", "description"];
        required.extend(APPROVER_FIELDS);
        let mut matrix = self
            .query("erp approval matrix", APPROVAL_MATRIX_SQL, &required)
            .await?;

        let employees = self.employees_all(false).await?;
        let names: HashMap<String, String> = employees
            .iter()
            .filter_map(|row| Some((row.cell("id").join_key()?, row.cell("entityid").to_string())))
            .collect();
        for field in APPROVER_FIELDS {
            let target = format!("{field}_names");
            matrix.add_column(&target, |row| resolve_approvers(row.cell(field), &names))?;
        }
        let table = matrix.select(&APPROVAL_MATRIX_COLUMNS)?;
        Ok(self.store(ErpDataset::ApprovalMatrix, table))
    }

    /// Successful logins per user and day.
    pub async fn login_audits(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::LoginAudits), refresh) {
            return Ok(table);
        }
        let mut table = self
            .query(
                "erp login audits",
                &login_audits_sql(LOGIN_WINDOW_DAYS),
                &["user_id", "date", "login_count"],
            )
            .await?;
        coerce_temporal(&mut table, "erp login audits", &["date"], Temporal::DayMonthYear)?;
        Ok(self.store(ErpDataset::LoginAudits, table))
    }

    pub async fn login_failures(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::LoginFailures), refresh) {
            return Ok(table);
        }
        let mut table = self
            .query(
                "erp login failures",
                &login_failures_sql(LOGIN_WINDOW_DAYS),
                &["datetime", "date", "user_id", "entity_name"],
            )
            .await?;
        coerce_temporal(&mut table, "erp login failures", &["date"], Temporal::IsoDate)?;
        coerce_temporal(&mut table, "erp login failures", &["datetime"], Temporal::Timestamp)?;
        Ok(self.store(ErpDataset::LoginFailures, table))
    }

    /// Server scripts with their owner's identity (prefixed `owner_`).
    pub async fn scripts(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::Scripts), refresh) {
            return Ok(table);
        }
        let scripts = self.query("erp scripts", SCRIPTS_SQL, &["id", "owner"]).await?;
        let owners = self
            .employees_all(false)
            .await?
            .select(&SCRIPT_OWNER_COLUMNS)?
            .prefixed("owner_");
        let table = join(&scripts, &owners, &JoinSpec::new(JoinKind::Left, "owner", "owner_id"))?
            .drop_columns(&["owner_id"]);
        Ok(self.store(ErpDataset::Scripts, table))
    }

    pub async fn client_script_deployments(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) =
            self.cached(Entry::Dataset(ErpDataset::ClientScriptDeployments), refresh)
        {
            return Ok(table);
        }
        let table = self
            .query(
                "erp client script deployments",
                CLIENT_SCRIPT_DEPLOYMENTS_SQL,
                &["id", "script", "deploy_name"],
            )
            .await?;
        Ok(self.store(ErpDataset::ClientScriptDeployments, table))
    }

    /// Client scripts with owner columns and their number of deployments.
    pub async fn client_scripts(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::ClientScripts), refresh) {
            return Ok(table);
        }
        let scripts = self
            .query("erp client scripts", CLIENT_SCRIPTS_SQL, &["id", "owner"])
            .await?;
        let owners = self.employees_all(false).await?.prefixed("owner_");
        let with_owner = join(&scripts, &owners, &JoinSpec::new(JoinKind::Left, "owner", "owner_id"))?
            .drop_columns(&["owner"]);

        let deployments = self.client_script_deployments(false).await?;
        let mut counts: Vec<(String, i64)> = Vec::new();
        for script in deployments.iter().filter_map(|row| row.cell("script").join_key()) {
            match counts.iter_mut().find(|(id, _)| *id == script) {
                Some((_, n)) => *n += 1,
                None => counts.push((script, 1)),
            }
        }
        let counts = Table::from_rows(
            vec!["id".to_string(), "deploy_count".to_string()],
            counts
                .into_iter()
                .map(|(id, n)| vec![Cell::Text(id), Cell::Int(n)])
                .collect(),
        )?;
        let table = join(&with_owner, &counts, &JoinSpec::on(JoinKind::Left, &["id"]))?;
        Ok(self.store(ErpDataset::ClientScripts, table))
    }

    /// Error and system log lines of every script, oldest first.
    pub async fn script_logs(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cached(Entry::Dataset(ErpDataset::ScriptLogs), refresh) {
            return Ok(table);
        }
        let mut table = self
            .query("erp script logs", SCRIPT_LOGS_SQL, &["internal_id", "date", "log_type"])
            .await?;
        coerce_temporal(&mut table, "erp script logs", &["date"], Temporal::DayMonthYear)?;
        Ok(self.store(ErpDataset::ScriptLogs, table))
    }
}

#[async_trait]
impl SourceClient for ErpClient {
    type Dataset = ErpDataset;

    fn system(&self) -> SourceSystem {
        SourceSystem::Erp
    }

    async fn dataset(&mut self, dataset: ErpDataset, refresh: bool) -> Result<Table, SourceError> {
        use ErpDataset::*;
        match dataset {
            Subsidiaries => self.subsidiaries(refresh).await,
            Roles => self.roles(refresh).await,
            RolePermissions => self.role_permissions(refresh).await,
            RoleRecordUsage => self.role_record_usage(refresh).await,
            RoleSubsidiaries => self.role_subsidiaries(refresh).await,
            Employees => self.employees(refresh).await,
            EmployeesAll => self.employees_all(refresh).await,
            EmployeesLicensed => self.employees_licensed(refresh).await,
            PartnersActive => self.partners_active(refresh).await,
            PartnersLicensed => self.partners_licensed(refresh).await,
            EmployeeRoles => self.employee_roles(refresh).await,
            PartnerRoles => self.partner_roles(refresh).await,
            EmployeeLicenses => self.employee_licenses(refresh).await,
            LicensedUnion => self.licensed_union(refresh).await,
            ApprovalMatrix => self.approval_matrix(refresh).await,
            LoginAudits => self.login_audits(refresh).await,
            LoginFailures => self.login_failures(refresh).await,
            Scripts => self.scripts(refresh).await,
            ClientScripts => self.client_scripts(refresh).await,
            ClientScriptDeployments => self.client_script_deployments(refresh).await,
            ScriptLogs => self.script_logs(refresh).await,
        }
    }
}
