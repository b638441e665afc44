//! Core tabular model, identity keys and join engine for idgov.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod join;
pub mod table;

pub use join::{aggregate_max_level, join, JoinKind, JoinSpec, KeyNorm};
pub use table::{Cell, Record, RowRef, Table, TableError};

pub const CRATE_NAME: &str = "idgov-core";

/// Upstream platform a table was pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceSystem {
    Directory,
    Helpdesk,
    Erp,
    Training,
}

impl SourceSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::Directory => "directory",
            SourceSystem::Helpdesk => "helpdesk",
            SourceSystem::Erp => "erp",
            SourceSystem::Training => "training",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical cross-source identity key: trimmed and case-folded email/UPN.
pub fn identity_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Permission grant level. Ordering is `View < Create < Edit < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionLevel {
    View,
    Create,
    Edit,
    Full,
}

impl PermissionLevel {
    /// Maps the ERP numeric level (1..=4). Anything above 3 is `Full`.
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=1 => PermissionLevel::View,
            2 => PermissionLevel::Create,
            3 => PermissionLevel::Edit,
            _ => PermissionLevel::Full,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "view" => Some(PermissionLevel::View),
            "create" => Some(PermissionLevel::Create),
            "edit" => Some(PermissionLevel::Edit),
            "full" => Some(PermissionLevel::Full),
            _ => None,
        }
    }

    /// Reads a level from either a numeric or a named cell.
    pub fn from_cell(cell: &Cell) -> Option<Self> {
        if let Some(level) = cell.as_i64() {
            return Some(Self::from_level(level));
        }
        cell.as_str().and_then(Self::from_name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::View => "View",
            PermissionLevel::Create => "Create",
            PermissionLevel::Edit => "Edit",
            PermissionLevel::Full => "Full",
        }
    }

    pub fn as_level(&self) -> i64 {
        match self {
            PermissionLevel::View => 1,
            PermissionLevel::Create => 2,
            PermissionLevel::Edit => 3,
            PermissionLevel::Full => 4,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_trims_and_folds_case() {
        assert_eq!(identity_key("  Jane.Doe@Example.COM "), "jane.doe@example.com");
        assert_eq!(identity_key(""), "");
    }

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::View < PermissionLevel::Create);
        assert!(PermissionLevel::Create < PermissionLevel::Edit);
        assert!(PermissionLevel::Edit < PermissionLevel::Full);
        assert_eq!(PermissionLevel::from_level(4), PermissionLevel::Full);
        assert_eq!(PermissionLevel::from_level(7), PermissionLevel::Full);
        assert_eq!(PermissionLevel::from_name(" edit "), Some(PermissionLevel::Edit));
        assert_eq!(
            PermissionLevel::from_cell(&Cell::Text("2".into())),
            Some(PermissionLevel::Create)
        );
    }
}
