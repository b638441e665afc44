//! Directory service client: users, groups and their memberships, devices, service
//! principals and usage reports.

use async_trait::async_trait;
use idgov_core::{join, Cell, JoinKind, JoinSpec, SourceSystem, Table};
use idgov_storage::{ApiSession, Method, PageProtocol};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::cache::EntityCache;
use crate::normalize::{
    canonical_column, coerce_temporal, flatten_record, fold_identity, join_list, normalize_null,
    records_to_table, require_columns, set_field, trim_text, NormalizeError, Temporal,
};
use crate::{SourceClient, SourceError};

pub const DEFAULT_BETA_BASE: &str = "https://graph.microsoft.com/beta";

const USER_SELECT: &str = "id,createdDateTime,userType,accountEnabled,assignedLicenses,assignedPlans,\
passwordProfile,userPrincipalName,mailNickName,displayName,department,companyName,employeeType,\
employeeId,jobTitle,mobilePhone,city,officeLocation,country,manager,signInSessionsValidFromDateTime";
const MANAGER_EXPAND: &str = "manager($select=id,displayName,employeeId,userPrincipalName)";
const GROUP_SELECT: &str = "id,createdDateTime,description,displayName,groupTypes,mail,mailEnabled,\
securityEnabled,mailNickname,visibility,securityIdentifier";
const GROUP_MAIL_FIELDS: [&str; 3] = ["allowExternalSenders", "hideFromAddressLists", "hideFromOutlookClients"];
const DEVICE_SELECT: &str = "deviceId,accountEnabled,approximateLastSignInDateTime,createdDateTime,\
displayName,isCompliant,operatingSystem,operatingSystemVersion,profileType,registrationDateTime,trustType";
const SERVICE_PRINCIPAL_SELECT: &str = "id,appId,createdDateTime,accountEnabled,displayName,homepage,\
notes,preferredSingleSignOnMode,signInAudience,servicePrincipalType,appRoleAssignmentRequired,\
oauth2PermissionScopes,keyCredentials,passwordCredentials";

pub const USER_COLUMNS: [&str; 22] = [
    "id",
    "created_date_time",
    "user_principal_name",
    "account_enabled",
    "user_type",
    "user_purpose",
    "display_name",
    "department",
    "company_name",
    "employee_type",
    "employee_id",
    "job_title",
    "mobile_phone",
    "office_location",
    "city",
    "country",
    "manager_id",
    "manager_display_name",
    "manager_employee_id",
    "manager_user_principal_name",
    "password_profile_force_change_password_next_sign_in",
    "password_profile_force_change_password_next_sign_in_with_mfa",
];
const LICENSE_COLUMNS: [&str; 2] = ["assigned_licenses", "assigned_plans"];

const GROUP_COLUMNS: [&str; 15] = [
    "id",
    "created_date_time",
    "display_name",
    "description",
    "group_type",
    "group_types",
    "mail",
    "mail_enabled",
    "mail_nickname",
    "security_enabled",
    "security_identifier",
    "visibility",
    "allow_external_senders",
    "hide_from_address_lists",
    "hide_from_outlook_clients",
];

const DEVICE_COLUMNS: [&str; 11] = [
    "device_id",
    "account_enabled",
    "approximate_last_sign_in_date_time",
    "created_date_time",
    "display_name",
    "is_compliant",
    "operating_system",
    "operating_system_version",
    "profile_type",
    "registration_date_time",
    "trust_type",
];

const SERVICE_PRINCIPAL_COLUMNS: [&str; 15] = [
    "id",
    "app_id",
    "created_date_time",
    "account_enabled",
    "display_name",
    "homepage",
    "notes",
    "preferred_single_sign_on_mode",
    "sign_in_audience",
    "service_principal_type",
    "app_role_assignment_required",
    "owners_count",
    "permissions_count",
    "passwords_count",
    "keys_count",
];

const AUTH_METHODS: [&str; 6] = [
    "microsoftAuthenticatorPasswordless",
    "mobilePhone",
    "microsoftAuthenticatorPush",
    "softwareOneTimePasscode",
    "windowsHelloForBusiness",
    "email",
];

/// Report field (canonical form) to warehouse column.
const ONEDRIVE_RENAMES: [(&str, &str); 8] = [
    ("report_refresh_date", "refresh_date"),
    ("owner_display_name", "owner_name"),
    ("is_deleted", "is_deleted"),
    ("last_activity_date", "last_activity"),
    ("file_count", "file_count"),
    ("active_file_count", "active_file_count"),
    ("owner_principal_name", "owner_upn"),
    ("storage_used_in_bytes", "storage_used"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryDataset {
    Users,
    Groups,
    GroupUserMembers,
    GroupGroupMembers,
    GroupOwners,
    Devices,
    ManagedDevices,
    DeviceUsers,
    Targets,
    ServicePrincipals,
    AuthMethods,
    UserLicenses,
    OneDriveUsage,
}

/// Group kind from its type list and mail/security flags. The checks run in order; the
/// first that holds wins.
pub fn group_kind(
    unified: bool,
    mail_enabled: Option<bool>,
    security_enabled: Option<bool>,
) -> Option<&'static str> {
    let mail = mail_enabled.unwrap_or(false);
    let security = security_enabled.unwrap_or(false);
    if unified && mail && security_enabled.is_some() {
        Some("M365 Group")
    } else if !unified && !mail && security {
        Some("Security Group")
    } else if security && mail {
        Some("Mail-enabled Group")
    } else if mail && !security {
        Some("Distribution Group")
    } else {
        None
    }
}

/// One row per (parent, expanded child) pair.
fn expansion_pairs(
    entity: &'static str,
    raw: &[JsonValue],
    parent_key: &str,
    expand: &str,
    parent_column: &str,
    child_column: &str,
) -> Result<Table, SourceError> {
    let mut table = Table::with_columns(&[parent_column, child_column]);
    for value in raw {
        let parent = value.get(parent_key).map(Cell::from_json).unwrap_or(Cell::Null);
        let children = value
            .get(expand)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| NormalizeError::MissingField {
                entity,
                field: expand.to_string(),
            })?;
        for child in children {
            let id = child.get("id").map(Cell::from_json).unwrap_or(Cell::Null);
            table.push_row(vec![parent.clone(), id])?;
        }
    }
    Ok(table)
}

fn json_list_len(value: &JsonValue, field: &str) -> Cell {
    Cell::Int(
        value
            .get(field)
            .and_then(JsonValue::as_array)
            .map(|items| items.len() as i64)
            .unwrap_or(0),
    )
}

#[derive(Debug)]
pub struct DirectoryClient {
    session: ApiSession,
    beta_base: String,
    cache: EntityCache<DirectoryDataset>,
}

impl DirectoryClient {
    /// `session` points at the `v1.0` root and carries a bearer token.
    pub fn new(session: ApiSession) -> Self {
        use DirectoryDataset::*;

        let mut cache = EntityCache::new();
        cache.depends_on(GroupUserMembers, &[Users, Groups]);
        cache.depends_on(GroupGroupMembers, &[Groups]);
        cache.depends_on(GroupOwners, &[Groups, Users]);
        cache.depends_on(DeviceUsers, &[Devices, Users]);
        cache.depends_on(Targets, &[Users, DeviceUsers]);
        cache.depends_on(UserLicenses, &[Users]);
        Self {
            session,
            beta_base: DEFAULT_BETA_BASE.to_string(),
            cache,
        }
    }

    pub fn with_beta_base(mut self, base: impl Into<String>) -> Self {
        self.beta_base = base.into();
        self
    }

    fn beta(&self, path: &str) -> String {
        format!("{}/{}", self.beta_base.trim_end_matches('/'), path)
    }

    async fn list(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<JsonValue>, SourceError> {
        let request = self.session.request(Method::Get, path).query(query);
        Ok(self.session.fetch_all(request, &PageProtocol::next_link()).await?)
    }

    /// Mailbox purpose of one user; a lookup the API refuses counts as unknown.
    async fn user_purpose(&self, upn: &str) -> Result<Cell, SourceError> {
        let path = format!("users/{}/mailboxSettings", upn.replace('#', "%23"));
        let response = self
            .session
            .send_allow_status(self.session.request(Method::Get, &path))
            .await?;
        if !response.status.is_success() {
            debug!(upn, status = response.status.as_u16(), "mailbox settings unavailable");
            return Ok(Cell::Null);
        }
        Ok(response
            .json()?
            .get("userPurpose")
            .map(|v| normalize_null(Cell::from_json(v)))
            .unwrap_or(Cell::Null))
    }

    /// Users including their license and plan lists.
    pub async fn users_with_licenses(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory users";
        if let Some(table) = self.cache.get(DirectoryDataset::Users, refresh) {
            return Ok(table);
        }
        let raw = self
            .list("users", &[("$select", USER_SELECT), ("$expand", MANAGER_EXPAND)])
            .await?;

        let mut records = Vec::with_capacity(raw.len());
        for value in &raw {
            let mut record = flatten_record(ENTITY, value, &[])?;
            let purpose = match value.get("userPrincipalName").and_then(JsonValue::as_str) {
                Some(upn) => self.user_purpose(upn).await?,
                None => Cell::Null,
            };
            set_field(&mut record, "user_purpose", purpose);
            records.push(record);
        }
        let table = Table::from_records(records);
        require_columns(&table, ENTITY, &["id", "user_principal_name"])?;

        let columns: Vec<&str> = USER_COLUMNS.iter().chain(&LICENSE_COLUMNS).copied().collect();
        let mut table = table.project(&columns);
        fold_identity(&mut table, ENTITY, "user_principal_name")?;
        trim_text(&mut table, &["city", "country", "job_title", "mobile_phone"]);
        coerce_temporal(&mut table, ENTITY, &["created_date_time"], Temporal::Timestamp)?;

        info!(source = "directory", entity = "users", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::Users, table.clone());
        Ok(table)
    }

    pub async fn users(&mut self, refresh: bool) -> Result<Table, SourceError> {
        Ok(self
            .users_with_licenses(refresh)
            .await?
            .drop_columns(&LICENSE_COLUMNS))
    }

    pub async fn groups(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory groups";
        if let Some(table) = self.cache.get(DirectoryDataset::Groups, refresh) {
            return Ok(table);
        }
        let raw = self.list("groups", &[("$select", GROUP_SELECT)]).await?;

        let mut records = Vec::with_capacity(raw.len());
        for value in &raw {
            let mut record = flatten_record(ENTITY, value, &[])?;
            let unified = value
                .get("groupTypes")
                .and_then(JsonValue::as_array)
                .is_some_and(|types| types.iter().any(|t| t.as_str() == Some("Unified")));
            let mail_enabled = value.get("mailEnabled").and_then(JsonValue::as_bool);
            let security_enabled = value.get("securityEnabled").and_then(JsonValue::as_bool);

            set_field(
                &mut record,
                "group_types",
                if unified { Cell::text("Unified") } else { Cell::Null },
            );
            set_field(
                &mut record,
                "group_type",
                Cell::from(group_kind(unified, mail_enabled, security_enabled)),
            );

            if security_enabled == Some(false) {
                let id = value
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| NormalizeError::MissingField {
                        entity: ENTITY,
                        field: "id".into(),
                    })?;
                let select = format!("id,{}", GROUP_MAIL_FIELDS.join(","));
                let settings = self
                    .session
                    .get(&format!("groups/{id}"), &[("$select", select.as_str())])
                    .await?;
                for field in GROUP_MAIL_FIELDS {
                    let cell = settings.get(field).map(Cell::from_json).unwrap_or(Cell::Null);
                    set_field(&mut record, &canonical_column(field), normalize_null(cell));
                }
            }
            records.push(record);
        }
        let table = Table::from_records(records);
        require_columns(&table, ENTITY, &["id", "display_name"])?;
        let mut table = table.project(&GROUP_COLUMNS);
        coerce_temporal(&mut table, ENTITY, &["created_date_time"], Temporal::Timestamp)?;

        info!(source = "directory", entity = "groups", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::Groups, table.clone());
        Ok(table)
    }

    /// Users' direct group memberships, with both sides' attributes.
    pub async fn group_user_members(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(DirectoryDataset::GroupUserMembers, refresh) {
            return Ok(table);
        }
        let groups = self.groups(refresh).await?.prefixed("group_");
        let users = self.users(refresh).await?.prefixed("member_");
        let raw = self
            .list("users", &[("$select", "id"), ("$expand", "memberOf($select=id)")])
            .await?;
        let pairs = expansion_pairs(
            "directory group members",
            &raw,
            "id",
            "memberOf",
            "member_id",
            "group_id",
        )?
        .select(&["group_id", "member_id"])?;

        let with_groups = join(&pairs, &groups, &JoinSpec::on(JoinKind::Inner, &["group_id"]))?;
        let table = join(&with_groups, &users, &JoinSpec::on(JoinKind::Inner, &["member_id"]))?;
        info!(source = "directory", entity = "group_user_members", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::GroupUserMembers, table.clone());
        Ok(table)
    }

    /// Groups nested inside groups.
    pub async fn group_group_members(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(DirectoryDataset::GroupGroupMembers, refresh) {
            return Ok(table);
        }
        let groups = self.groups(refresh).await?;
        let raw = self
            .list("groups", &[("$select", "id"), ("$expand", "members($select=id)")])
            .await?;
        let pairs = expansion_pairs(
            "directory nested groups",
            &raw,
            "id",
            "members",
            "group_id",
            "member_id",
        )?;

        let with_parent = join(
            &pairs,
            &groups.prefixed("group_"),
            &JoinSpec::on(JoinKind::Inner, &["group_id"]),
        )?;
        let table = join(
            &with_parent,
            &groups.prefixed("member_"),
            &JoinSpec::on(JoinKind::Inner, &["member_id"]),
        )?;
        info!(source = "directory", entity = "group_group_members", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::GroupGroupMembers, table.clone());
        Ok(table)
    }

    pub async fn group_owners(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(DirectoryDataset::GroupOwners, refresh) {
            return Ok(table);
        }
        let groups = self.groups(refresh).await?.prefixed("group_");
        let users = self.users(refresh).await?.prefixed("owner_");
        let raw = self
            .list("groups", &[("$select", "id"), ("$expand", "owners($select=id)")])
            .await?;
        let pairs = expansion_pairs("directory group owners", &raw, "id", "owners", "group_id", "owner_id")?;

        let with_groups = join(&pairs, &groups, &JoinSpec::on(JoinKind::Inner, &["group_id"]))?;
        let table = join(&with_groups, &users, &JoinSpec::on(JoinKind::Inner, &["owner_id"]))?;
        info!(source = "directory", entity = "group_owners", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::GroupOwners, table.clone());
        Ok(table)
    }

    pub async fn devices(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory devices";
        if let Some(table) = self.cache.get(DirectoryDataset::Devices, refresh) {
            return Ok(table);
        }
        let raw = self.list("devices", &[("$select", DEVICE_SELECT)]).await?;
        let table = records_to_table(ENTITY, &raw, &[])?;
        require_columns(&table, ENTITY, &["device_id"])?;
        let mut table = table.project(&DEVICE_COLUMNS);
        coerce_temporal(
            &mut table,
            ENTITY,
            &["approximate_last_sign_in_date_time", "created_date_time", "registration_date_time"],
            Temporal::Timestamp,
        )?;
        info!(source = "directory", entity = "devices", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::Devices, table.clone());
        Ok(table)
    }

    pub async fn managed_devices(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory managed devices";
        if let Some(table) = self.cache.get(DirectoryDataset::ManagedDevices, refresh) {
            return Ok(table);
        }
        let raw = self.list("deviceManagement/managedDevices", &[]).await?;
        let mut table = records_to_table(ENTITY, &raw, &[])?;
        coerce_temporal(
            &mut table,
            ENTITY,
            &["enrolled_date_time", "last_sync_date_time"],
            Temporal::Timestamp,
        )?;
        fold_identity(&mut table, ENTITY, "user_principal_name")?;
        info!(source = "directory", entity = "managed_devices", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::ManagedDevices, table.clone());
        Ok(table)
    }

    /// Devices with their registered users; a device without users is absent.
    pub async fn device_users(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(DirectoryDataset::DeviceUsers, refresh) {
            return Ok(table);
        }
        let mut devices = self.devices(refresh).await?.prefixed("device_");
        devices.rename("device_device_id", "device_id")?;
        let users = self.users(refresh).await?.prefixed("user_");
        let raw = self
            .list("devices", &[("$select", "deviceId"), ("$expand", "registeredUsers($select=id)")])
            .await?;
        let pairs = expansion_pairs(
            "directory device users",
            &raw,
            "deviceId",
            "registeredUsers",
            "device_id",
            "user_id",
        )?;

        let with_devices = join(&pairs, &devices, &JoinSpec::on(JoinKind::Left, &["device_id"]))?;
        let table = join(&with_devices, &users, &JoinSpec::on(JoinKind::Left, &["user_id"]))?;
        info!(source = "directory", entity = "device_users", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::DeviceUsers, table.clone());
        Ok(table)
    }

    /// Policy targets: every user plus every registered device.
    pub async fn targets(&mut self, refresh: bool) -> Result<Table, SourceError> {
        if let Some(table) = self.cache.get(DirectoryDataset::Targets, refresh) {
            return Ok(table);
        }
        let device_users = self.device_users(refresh).await?;
        let users = self.users(false).await?;

        let mut user_targets = users.select(&["id", "display_name", "department", "country"])?;
        user_targets.rename("id", "target_id")?;
        user_targets.rename("display_name", "target_display_name")?;
        user_targets.rename("department", "user_department")?;
        user_targets.rename("country", "user_country")?;
        user_targets.set_column("target_type", |_| Cell::text("user"));

        let mut device_targets = device_users.select(&[
            "device_id",
            "device_display_name",
            "user_department",
            "user_country",
        ])?;
        device_targets.rename("device_id", "target_id")?;
        device_targets.rename("device_display_name", "target_display_name")?;
        device_targets.set_column("target_type", |_| Cell::text("device"));

        let table = Table::concat(&[user_targets, device_targets]);
        info!(source = "directory", entity = "targets", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::Targets, table.clone());
        Ok(table)
    }

    pub async fn service_principals(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory service principals";
        if let Some(table) = self.cache.get(DirectoryDataset::ServicePrincipals, refresh) {
            return Ok(table);
        }
        let raw = self
            .list(
                "servicePrincipals",
                &[("$select", SERVICE_PRINCIPAL_SELECT), ("$expand", "owners($select=id)")],
            )
            .await?;

        let mut records = Vec::with_capacity(raw.len());
        for value in &raw {
            let mut record = flatten_record(ENTITY, value, &[])?;
            set_field(&mut record, "owners_count", json_list_len(value, "owners"));
            set_field(
                &mut record,
                "permissions_count",
                json_list_len(value, "oauth2PermissionScopes"),
            );
            set_field(
                &mut record,
                "passwords_count",
                json_list_len(value, "passwordCredentials"),
            );
            set_field(&mut record, "keys_count", json_list_len(value, "keyCredentials"));
            records.push(record);
        }
        let table = Table::from_records(records);
        require_columns(&table, ENTITY, &["id", "app_id"])?;
        let mut table = table.project(&SERVICE_PRINCIPAL_COLUMNS);
        coerce_temporal(&mut table, ENTITY, &["created_date_time"], Temporal::Timestamp)?;
        info!(source = "directory", entity = "service_principals", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::ServicePrincipals, table.clone());
        Ok(table)
    }

    /// Authentication-method registration per user, with one flag per tracked method.
    pub async fn auth_methods(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory auth methods";
        if let Some(table) = self.cache.get(DirectoryDataset::AuthMethods, refresh) {
            return Ok(table);
        }
        let url = self.beta("reports/authenticationMethods/userRegistrationDetails");
        let raw = self.list(&url, &[]).await?;

        let mut records = Vec::with_capacity(raw.len());
        for value in &raw {
            let mut record = flatten_record(ENTITY, value, &[])?;
            let registered = value.get("methodsRegistered");
            let methods: Vec<&str> = registered
                .and_then(JsonValue::as_array)
                .map(|items| items.iter().filter_map(JsonValue::as_str).collect())
                .unwrap_or_default();
            for method in AUTH_METHODS {
                set_field(
                    &mut record,
                    &canonical_column(&format!("method_{method}")),
                    Cell::Bool(methods.contains(&method)),
                );
            }
            set_field(&mut record, "methods_registered", join_list(registered, ""));
            set_field(
                &mut record,
                "system_preferred_authentication_methods",
                join_list(value.get("systemPreferredAuthenticationMethods"), ""),
            );
            records.push(record);
        }
        let mut table = Table::from_records(records);
        fold_identity(&mut table, ENTITY, "user_principal_name")?;
        coerce_temporal(&mut table, ENTITY, &["last_updated_date_time"], Temporal::Timestamp)?;
        info!(source = "directory", entity = "auth_methods", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::AuthMethods, table.clone());
        Ok(table)
    }

    /// One row per (user, assigned SKU) with the user's attributes.
    pub async fn user_licenses(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory user licenses";
        if let Some(table) = self.cache.get(DirectoryDataset::UserLicenses, refresh) {
            return Ok(table);
        }
        let users = self.users_with_licenses(refresh).await?;

        let mut pairs = Table::with_columns(&["user_id", "sku_id"]);
        for row in users.iter() {
            let licenses: JsonValue = match row.cell("assigned_licenses") {
                Cell::Null => continue,
                Cell::Text(text) => serde_json::from_str(text).map_err(|_| {
                    NormalizeError::InvalidValue {
                        entity: ENTITY,
                        field: "assigned_licenses".into(),
                        value: text.clone(),
                        expected: "license list",
                    }
                })?,
                other => {
                    return Err(NormalizeError::InvalidValue {
                        entity: ENTITY,
                        field: "assigned_licenses".into(),
                        value: other.to_string(),
                        expected: "license list",
                    }
                    .into())
                }
            };
            for license in licenses.as_array().into_iter().flatten() {
                let sku = license.get("skuId").map(Cell::from_json).unwrap_or(Cell::Null);
                pairs.push_row(vec![row.cell("id").clone(), sku])?;
            }
        }

        let mut details = users.drop_columns(&LICENSE_COLUMNS);
        details.rename("id", "user_id")?;
        let table = join(&pairs, &details, &JoinSpec::on(JoinKind::Left, &["user_id"]))?;
        info!(source = "directory", entity = "user_licenses", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::UserLicenses, table.clone());
        Ok(table)
    }

    /// Seven-day OneDrive usage per account.
    pub async fn onedrive_usage(&mut self, refresh: bool) -> Result<Table, SourceError> {
        const ENTITY: &str = "directory onedrive usage";
        if let Some(table) = self.cache.get(DirectoryDataset::OneDriveUsage, refresh) {
            return Ok(table);
        }
        let url = self.beta("reports/getOneDriveUsageAccountDetail(period='D7')");
        let raw = self.list(&url, &[("$format", "application/json")]).await?;
        let output: Vec<&str> = ONEDRIVE_RENAMES.iter().map(|(_, to)| *to).collect();

        let table = if raw.is_empty() {
            Table::with_columns(&output)
        } else {
            let mut table = records_to_table(ENTITY, &raw, &[])?;
            let sources: Vec<&str> = ONEDRIVE_RENAMES.iter().map(|(from, _)| *from).collect();
            require_columns(&table, ENTITY, &sources)?;
            for (from, to) in ONEDRIVE_RENAMES {
                if from != to {
                    table.rename(from, to)?;
                }
            }
            let mut table = table.project(&output);
            coerce_temporal(&mut table, ENTITY, &["refresh_date", "last_activity"], Temporal::Timestamp)?;
            fold_identity(&mut table, ENTITY, "owner_upn")?;
            table
        };
        info!(source = "directory", entity = "onedrive_usage", rows = table.len(), "normalized");
        self.cache.store(DirectoryDataset::OneDriveUsage, table.clone());
        Ok(table)
    }
}

#[async_trait]
impl SourceClient for DirectoryClient {
    type Dataset = DirectoryDataset;

    fn system(&self) -> SourceSystem {
        SourceSystem::Directory
    }

    async fn dataset(&mut self, dataset: DirectoryDataset, refresh: bool) -> Result<Table, SourceError> {
        match dataset {
            DirectoryDataset::Users => self.users(refresh).await,
            DirectoryDataset::Groups => self.groups(refresh).await,
            DirectoryDataset::GroupUserMembers => self.group_user_members(refresh).await,
            DirectoryDataset::GroupGroupMembers => self.group_group_members(refresh).await,
            DirectoryDataset::GroupOwners => self.group_owners(refresh).await,
            DirectoryDataset::Devices => self.devices(refresh).await,
            DirectoryDataset::ManagedDevices => self.managed_devices(refresh).await,
            DirectoryDataset::DeviceUsers => self.device_users(refresh).await,
            DirectoryDataset::Targets => self.targets(refresh).await,
            DirectoryDataset::ServicePrincipals => self.service_principals(refresh).await,
            DirectoryDataset::AuthMethods => self.auth_methods(refresh).await,
            DirectoryDataset::UserLicenses => self.user_licenses(refresh).await,
            DirectoryDataset::OneDriveUsage => self.onedrive_usage(refresh).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use idgov_storage::scripted::ScriptedTransport;

    use super::*;
    use crate::test_support::{fixture_transport, session};

    fn client(transport: &Arc<ScriptedTransport>) -> DirectoryClient {
        DirectoryClient::new(session(transport, "directory", "https://graph.test/v1.0"))
            .with_beta_base("https://graph.test/beta")
    }

    fn texts(table: &Table, column: &str) -> Vec<String> {
        table
            .column_values(column)
            .expect("column")
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    #[test]
    fn group_kinds() {
        assert_eq!(group_kind(true, Some(true), Some(false)), Some("M365 Group"));
        assert_eq!(group_kind(false, Some(false), Some(true)), Some("Security Group"));
        assert_eq!(group_kind(false, Some(true), Some(true)), Some("Mail-enabled Group"));
        assert_eq!(group_kind(false, Some(true), Some(false)), Some("Distribution Group"));
        assert_eq!(group_kind(true, Some(false), Some(false)), None);
        assert_eq!(group_kind(false, None, None), None);
    }

    #[tokio::test]
    async fn users_are_flattened_with_mailbox_purpose() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        let users = directory.users(false).await.expect("users");
        assert_eq!(users.columns(), USER_COLUMNS);
        assert_eq!(
            texts(&users, "user_principal_name"),
            ["ana.lopez@example.com", "li.wei@example.com", "svc-backup@example.com"]
        );
        assert_eq!(users.value(0, "manager_display_name"), Some(&Cell::text("Li Wei")));
        assert_eq!(users.value(1, "manager_id"), Some(&Cell::Null));
        assert_eq!(users.value(0, "city"), Some(&Cell::text("Madrid")));
        assert_eq!(users.value(0, "job_title"), Some(&Cell::text("Accountant")));
        assert_eq!(users.value(0, "user_purpose"), Some(&Cell::text("user")));
        assert_eq!(users.value(2, "user_purpose"), Some(&Cell::Null));
        assert_eq!(
            users.value(0, "password_profile_force_change_password_next_sign_in"),
            Some(&Cell::Bool(false))
        );
        let created = NaiveDate::from_ymd_opt(2021, 2, 1)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .expect("date");
        assert_eq!(users.value(0, "created_date_time"), Some(&Cell::Timestamp(created)));
        assert_eq!(transport.count_matching("/mailboxSettings"), 3);

        let before = transport.request_count();
        directory.users(false).await.expect("cached");
        assert_eq!(transport.request_count(), before);
    }

    #[tokio::test]
    async fn groups_get_kinds_and_mail_settings_for_non_security_groups() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        let groups = directory.groups(false).await.expect("groups");
        assert_eq!(groups.columns(), GROUP_COLUMNS);
        assert_eq!(
            texts(&groups, "group_type"),
            ["M365 Group", "Security Group", "Distribution Group", "Mail-enabled Group"]
        );
        assert_eq!(groups.value(0, "group_types"), Some(&Cell::text("Unified")));
        assert_eq!(groups.value(1, "group_types"), Some(&Cell::Null));
        assert_eq!(groups.value(0, "allow_external_senders"), Some(&Cell::Bool(false)));
        assert_eq!(groups.value(2, "hide_from_address_lists"), Some(&Cell::Bool(true)));
        assert_eq!(groups.value(1, "allow_external_senders"), Some(&Cell::Null));
        assert_eq!(transport.count_matching("/groups/g-"), 2);
    }

    #[tokio::test]
    async fn memberships_require_both_sides() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        let members = directory.group_user_members(false).await.expect("members");
        assert_eq!(members.len(), 3);
        assert_eq!(&members.columns()[..2], ["group_id", "member_id"]);
        assert!(members.has_column("group_display_name"));
        assert!(members.has_column("member_user_principal_name"));
        assert!(!texts(&members, "group_id").contains(&"g-99".to_string()));

        let nested = directory.group_group_members(false).await.expect("nested");
        assert_eq!(texts(&nested, "member_id"), ["g-2", "g-1"]);
        assert_eq!(nested.value(0, "member_display_name"), Some(&Cell::text("All Staff Security")));

        let owners = directory.group_owners(false).await.expect("owners");
        assert_eq!(texts(&owners, "owner_id"), ["u-2", "u-1"]);
    }

    #[tokio::test]
    async fn targets_cover_users_and_registered_devices() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        let device_users = directory.device_users(false).await.expect("device users");
        assert_eq!(device_users.len(), 1);
        assert_eq!(device_users.value(0, "device_display_name"), Some(&Cell::text("LAPTOP-ANA")));
        assert_eq!(device_users.value(0, "user_department"), Some(&Cell::text("Finance")));

        let targets = directory.targets(false).await.expect("targets");
        assert_eq!(targets.len(), 4);
        assert_eq!(
            texts(&targets, "target_type"),
            ["user", "user", "user", "device"]
        );
        assert_eq!(targets.value(3, "target_id"), Some(&Cell::text("dev-1")));
    }

    #[tokio::test]
    async fn refreshing_users_drops_derived_tables() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        directory.user_licenses(false).await.expect("licenses");
        let listed = transport.count_matching("/v1.0/users");
        directory.user_licenses(false).await.expect("cached licenses");
        assert_eq!(transport.count_matching("/v1.0/users"), listed);

        directory.users(true).await.expect("refreshed users");
        let after_refresh = transport.count_matching("/v1.0/users");
        directory.user_licenses(false).await.expect("recomputed licenses");
        assert_eq!(transport.count_matching("/v1.0/users"), after_refresh);
    }

    #[tokio::test]
    async fn licenses_principals_and_auth_methods() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        let licenses = directory.user_licenses(false).await.expect("licenses");
        assert_eq!(texts(&licenses, "sku_id"), ["sku-e3", "sku-e3", "sku-visio"]);
        assert_eq!(licenses.value(2, "user_principal_name"), Some(&Cell::text("li.wei@example.com")));
        assert!(!licenses.has_column("assigned_licenses"));

        let principals = directory.service_principals(false).await.expect("principals");
        assert_eq!(principals.columns(), SERVICE_PRINCIPAL_COLUMNS);
        assert_eq!(principals.value(0, "owners_count"), Some(&Cell::Int(1)));
        assert_eq!(principals.value(0, "permissions_count"), Some(&Cell::Int(2)));
        assert_eq!(principals.value(0, "passwords_count"), Some(&Cell::Int(1)));
        assert_eq!(principals.value(0, "keys_count"), Some(&Cell::Int(0)));

        let methods = directory.auth_methods(false).await.expect("auth methods");
        assert_eq!(methods.value(0, "method_microsoft_authenticator_push"), Some(&Cell::Bool(true)));
        assert_eq!(methods.value(0, "method_email"), Some(&Cell::Bool(false)));
        assert_eq!(
            methods.value(0, "methods_registered"),
            Some(&Cell::text("microsoftAuthenticatorPush,mobilePhone"))
        );
        assert_eq!(
            methods.value(0, "system_preferred_authentication_methods"),
            Some(&Cell::text("push"))
        );
    }

    #[tokio::test]
    async fn onedrive_usage_is_renamed_and_typed() {
        let transport = fixture_transport("directory", "routes.json");
        let mut directory = client(&transport);

        let usage = directory.onedrive_usage(false).await.expect("usage");
        assert_eq!(
            usage.columns(),
            ["refresh_date", "owner_name", "is_deleted", "last_activity", "file_count", "active_file_count", "owner_upn", "storage_used"]
        );
        let refreshed = NaiveDate::from_ymd_opt(2024, 6, 2)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("date");
        assert_eq!(usage.value(0, "refresh_date"), Some(&Cell::Timestamp(refreshed)));
        assert_eq!(usage.value(1, "last_activity"), Some(&Cell::Null));
        assert_eq!(usage.value(0, "owner_upn"), Some(&Cell::text("ana.lopez@example.com")));
        let sent = transport.requests();
        let report = sent
            .iter()
            .find(|r| r.url.contains("getOneDriveUsageAccountDetail"))
            .expect("report request");
        assert!(report.url.starts_with("https://graph.test/beta/"));
    }
}
