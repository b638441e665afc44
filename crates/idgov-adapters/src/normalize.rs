//! Shapes raw API records into flat tables with canonical column names and types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use idgov_core::{identity_key, Cell, Record, Table};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("{entity}: expected a JSON object record, got {found}")]
    NotAnObject { entity: &'static str, found: String },
    #[error("{entity}: field `{field}` missing from payload")]
    MissingField { entity: &'static str, field: String },
    #[error("{entity}: cannot read `{value}` in `{field}` as {expected}")]
    InvalidValue {
        entity: &'static str,
        field: String,
        value: String,
        expected: &'static str,
    },
}

/// How a temporal column is written upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    /// ISO-8601, with or without an offset. Offsets are converted to UTC and dropped.
    Timestamp,
    /// `YYYY-MM-DD`.
    IsoDate,
    /// `DD/MM/YYYY`, the ERP account's display format.
    DayMonthYear,
}

const NULL_MARKERS: [&str; 4] = ["", "null", "None", "NaN"];

/// `camelCase`, `PascalCase`, dotted and spaced names to `snake_case`.
pub fn canonical_column(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower);
            if boundary && !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out.trim_matches('_').to_string()
}

pub fn normalize_null(cell: Cell) -> Cell {
    match &cell {
        Cell::Text(s) if NULL_MARKERS.contains(&s.as_str()) => Cell::Null,
        Cell::Float(f) if f.is_nan() => Cell::Null,
        _ => cell,
    }
}

/// Flattens one level of nesting: `{"manager": {"id": 1}}` becomes `manager_id`. Parents
/// listed in `strip_parents` contribute their children without a prefix. Arrays and
/// deeper objects stay as compact JSON text.
pub fn flatten_record(
    entity: &'static str,
    value: &JsonValue,
    strip_parents: &[&str],
) -> Result<Record, NormalizeError> {
    let object = value.as_object().ok_or_else(|| NormalizeError::NotAnObject {
        entity,
        found: kind_of(value).to_string(),
    })?;

    let mut record: Record = Vec::with_capacity(object.len());
    for (key, field) in object {
        match field {
            JsonValue::Object(children) => {
                let stripped = strip_parents.contains(&key.as_str());
                for (child, inner) in children {
                    let name = if stripped {
                        canonical_column(child)
                    } else {
                        canonical_column(&format!("{key}.{child}"))
                    };
                    set_field(&mut record, &name, normalize_null(Cell::from_json(inner)));
                }
            }
            other => {
                set_field(
                    &mut record,
                    &canonical_column(key),
                    normalize_null(Cell::from_json(other)),
                );
            }
        }
    }
    Ok(record)
}

pub fn records_to_table(
    entity: &'static str,
    values: &[JsonValue],
    strip_parents: &[&str],
) -> Result<Table, NormalizeError> {
    let records = values
        .iter()
        .map(|v| flatten_record(entity, v, strip_parents))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Table::from_records(records))
}

/// Replaces a field in place or appends it.
pub fn set_field(record: &mut Record, name: &str, cell: Cell) {
    match record.iter_mut().find(|(k, _)| k == name) {
        Some((_, slot)) => *slot = cell,
        None => record.push((name.to_string(), cell)),
    }
}

/// Joins a list sub-field into one comma-separated value. Lists of objects contribute
/// `field` from each element; an empty or absent list is null.
pub fn join_list(value: Option<&JsonValue>, field: &str) -> Cell {
    let Some(JsonValue::Array(items)) = value else {
        return Cell::Null;
    };
    let parts: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            JsonValue::Object(map) => map.get(field).and_then(scalar_text),
            other => scalar_text(other),
        })
        .collect();
    if parts.is_empty() {
        Cell::Null
    } else {
        Cell::Text(parts.join(","))
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn naive_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

pub fn day_month_year(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%d/%m/%Y").ok()
}

fn coerce_cell(cell: &Cell, kind: Temporal) -> Result<Cell, ()> {
    match (cell, kind) {
        (Cell::Null, _) => Ok(Cell::Null),
        (Cell::Timestamp(_), Temporal::Timestamp) | (Cell::Date(_), Temporal::IsoDate) => {
            Ok(cell.clone())
        }
        (Cell::Date(_), Temporal::DayMonthYear) => Ok(cell.clone()),
        (Cell::Text(s), Temporal::Timestamp) => naive_timestamp(s).map(Cell::Timestamp).ok_or(()),
        (Cell::Text(s), Temporal::IsoDate) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Cell::Date)
            .map_err(|_| ()),
        (Cell::Text(s), Temporal::DayMonthYear) => day_month_year(s).map(Cell::Date).ok_or(()),
        _ => Err(()),
    }
}

/// Converts each named column in place. A named column that is absent, or a value that
/// does not parse, is an error.
pub fn coerce_temporal(
    table: &mut Table,
    entity: &'static str,
    columns: &[&str],
    kind: Temporal,
) -> Result<(), NormalizeError> {
    require_columns(table, entity, columns)?;
    let expected = match kind {
        Temporal::Timestamp => "timestamp",
        Temporal::IsoDate => "date",
        Temporal::DayMonthYear => "dd/mm/yyyy date",
    };
    for column in columns {
        let mut failure: Option<String> = None;
        // Absent only when `table` is the empty zero-width table.
        table.map_present(column, |cell| match coerce_cell(cell, kind) {
            Ok(converted) => converted,
            Err(()) => {
                failure.get_or_insert_with(|| cell.to_string());
                Cell::Null
            }
        });
        if let Some(value) = failure {
            return Err(NormalizeError::InvalidValue {
                entity,
                field: column.to_string(),
                value,
                expected,
            });
        }
    }
    Ok(())
}

/// Trims and case-folds an identity-key column.
pub fn fold_identity(
    table: &mut Table,
    entity: &'static str,
    column: &str,
) -> Result<(), NormalizeError> {
    require_columns(table, entity, &[column])?;
    table.map_present(column, |cell| match cell {
        Cell::Text(s) => normalize_null(Cell::Text(identity_key(s))),
        other => other.clone(),
    });
    Ok(())
}

/// Trims text columns; values that become empty turn null. Absent columns are skipped.
pub fn trim_text(table: &mut Table, columns: &[&str]) {
    for column in columns {
        table.map_present(column, |cell| match cell {
            Cell::Text(s) => normalize_null(Cell::Text(s.trim().to_string())),
            other => other.clone(),
        });
    }
}

/// Collapses runs of whitespace inside text values.
pub fn collapse_spaces(table: &mut Table, column: &str) {
    table.map_present(column, |cell| match cell {
        Cell::Text(s) => Cell::Text(s.split_whitespace().collect::<Vec<_>>().join(" ")),
        other => other.clone(),
    });
}

/// A table with no rows and no columns carries no schema to check.
pub fn require_columns(
    table: &Table,
    entity: &'static str,
    columns: &[&str],
) -> Result<(), NormalizeError> {
    if table.is_empty() && table.width() == 0 {
        return Ok(());
    }
    match columns.iter().find(|c| !table.has_column(c)) {
        Some(missing) => Err(NormalizeError::MissingField {
            entity,
            field: missing.to_string(),
        }),
        None => Ok(()),
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_column("emailId"), "email_id");
        assert_eq!(canonical_column("userPrincipalName"), "user_principal_name");
        assert_eq!(
            canonical_column("passwordProfile.forceChangePasswordNextSignInWithMfa"),
            "password_profile_force_change_password_next_sign_in_with_mfa"
        );
        assert_eq!(canonical_column("oauth2PermissionScopes"), "oauth2_permission_scopes");
        assert_eq!(canonical_column("userID"), "user_id");
        assert_eq!(canonical_column("@odata.type"), "odata_type");
        assert_eq!(canonical_column("Storage Used (Byte)"), "storage_used_byte");
        assert_eq!(canonical_column("cf_last_date_of_service"), "cf_last_date_of_service");
    }

    #[test]
    fn flattening_one_level() {
        let value = json!({
            "id": "u1",
            "manager": {"id": "m1", "displayName": "Boss"},
            "contactCustomFields": {"cf_department": "IT"},
            "assignedLicenses": [{"skuId": "s1"}],
            "city": "None"
        });
        let record = flatten_record("users", &value, &["contactCustomFields"]).expect("record");
        let names: Vec<&str> = record.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            ["id", "manager_id", "manager_display_name", "cf_department", "assigned_licenses", "city"]
        );
        assert_eq!(record[4].1, Cell::text(r#"[{"skuId":"s1"}]"#));
        assert_eq!(record[5].1, Cell::Null);

        let err = flatten_record("users", &json!(["x"]), &[]).unwrap_err();
        assert!(matches!(err, NormalizeError::NotAnObject { .. }));
    }

    #[test]
    fn list_joining() {
        let roles = json!([{"roleId": 7, "roleName": "Agent"}, {"roleId": 9, "roleName": "Admin"}]);
        assert_eq!(join_list(Some(&roles), "roleName"), Cell::text("Agent,Admin"));
        assert_eq!(join_list(Some(&roles), "roleId"), Cell::text("7,9"));
        assert_eq!(join_list(Some(&json!(["email", "push"])), ""), Cell::text("email,push"));
        assert_eq!(join_list(Some(&json!([])), "x"), Cell::Null);
        assert_eq!(join_list(None, "x"), Cell::Null);
    }

    #[test]
    fn timestamps_lose_their_zone_after_conversion_to_utc() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(8, 30, 0))
            .expect("date");
        assert_eq!(naive_timestamp("2024-03-01T10:30:00+02:00"), Some(expected));
        assert_eq!(naive_timestamp("2024-03-01T08:30:00Z"), Some(expected));
        assert_eq!(naive_timestamp("2024-03-01T08:30:00"), Some(expected));
        assert_eq!(naive_timestamp("2024-03-01 08:30:00"), Some(expected));
        assert!(naive_timestamp("yesterday").is_none());
        assert_eq!(day_month_year("05/11/2023"), NaiveDate::from_ymd_opt(2023, 11, 5));
    }

    #[test]
    fn coercion_rejects_garbage_and_missing_columns() {
        let mut table = Table::from_rows(
            vec!["created_on".into(), "closed_on".into()],
            vec![
                vec![Cell::text("2024-01-02T00:00:00Z"), Cell::Null],
                vec![Cell::text("not a date"), Cell::Null],
            ],
        )
        .expect("table");

        let err = coerce_temporal(&mut table, "tickets", &["created_on"], Temporal::Timestamp)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidValue { ref value, .. } if value == "not a date"));

        let err = coerce_temporal(&mut table, "tickets", &["resolution_due"], Temporal::Timestamp)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField { ref field, .. } if field == "resolution_due"));
    }

    #[test]
    fn identity_columns_fold_and_trim() {
        let mut table = Table::from_rows(
            vec!["email".into(), "city".into()],
            vec![vec![Cell::text("  Jane.Doe@Example.COM "), Cell::text("  ")]],
        )
        .expect("table");
        fold_identity(&mut table, "users", "email").expect("fold");
        trim_text(&mut table, &["city", "country"]);
        assert_eq!(table.value(0, "email"), Some(&Cell::text("jane.doe@example.com")));
        assert_eq!(table.value(0, "city"), Some(&Cell::Null));
    }

    #[test]
    fn empty_payload_passes_through_column_steps() {
        let mut table = Table::new(Vec::new());
        coerce_temporal(&mut table, "tickets", &["created_at"], Temporal::Timestamp)
            .expect("empty coerce");
        fold_identity(&mut table, "users", "email").expect("empty fold");
        collapse_spaces(&mut table, "entityid");
        assert_eq!(table.width(), 0);
    }
}
