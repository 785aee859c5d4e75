//! Issue resolver: static table mapping issue types to locations and crew size

use crate::error::CoreError;
use anyhow::{bail, Context, Result};
use fleet_shared::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Where an issue type is remediated and how many robots it needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueLocation {
    pub coordinates: Position,
    pub robot_count: usize,
    pub description: String,
    /// QR payload that identifies this issue type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueTableFile {
    issues: BTreeMap<String, IssueLocation>,
}

/// Immutable issue table, fixed at startup
#[derive(Debug, Clone)]
pub struct IssueResolver {
    table: BTreeMap<String, IssueLocation>,
}

impl IssueResolver {
    pub fn new(table: BTreeMap<String, IssueLocation>) -> Result<Self> {
        if table.is_empty() {
            bail!("issue table is empty");
        }
        for (issue_type, location) in &table {
            if issue_type.trim().is_empty() {
                bail!("issue table contains an empty issue type");
            }
            if location.robot_count == 0 {
                bail!("issue type {issue_type:?} needs robot_count >= 1");
            }
        }
        Ok(Self { table })
    }

    /// The table the fleet ships with
    pub fn builtin() -> Self {
        let entry = |x, y, z, robot_count, description: &str, qr: &str| IssueLocation {
            coordinates: Position::new(x, y, z),
            robot_count,
            description: description.into(),
            qr_code: Some(qr.into()),
        };

        let table = BTreeMap::from([
            (
                "rust".to_string(),
                entry(50.0, 75.0, 10.0, 1, "Rust detected at location", "RUST_QR"),
            ),
            (
                "overheated_circuit".to_string(),
                entry(120.0, 150.0, 5.0, 2, "Overheated circuit detected at location", "CIRCUIT_QR"),
            ),
            (
                "tilted_antenna".to_string(),
                entry(200.0, 100.0, 20.0, 1, "Tilted antenna detected at location", "ANTENNA_QR"),
            ),
        ]);

        Self { table }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: IssueTableFile = toml::from_str(contents).context("invalid issue table")?;
        Self::new(file.issues)
    }

    /// Load the table from a TOML file with one `[issues.<type>]` section per entry
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read issue table {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn resolve(&self, issue_type: &str) -> Result<&IssueLocation, CoreError> {
        self.table
            .get(issue_type)
            .ok_or_else(|| CoreError::UnknownIssueType(issue_type.to_string()))
    }

    /// Map a scanned QR payload to its issue type
    pub fn resolve_qr(&self, qr_code: &str) -> Result<&str, CoreError> {
        self.table
            .iter()
            .find(|(_, location)| location.qr_code.as_deref() == Some(qr_code))
            .map(|(issue_type, _)| issue_type.as_str())
            .ok_or_else(|| CoreError::UnknownIssueType(qr_code.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &IssueLocation)> {
        self.table.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let resolver = IssueResolver::builtin();

        let rust = resolver.resolve("rust").expect("rust");
        assert_eq!(rust.coordinates, Position::new(50.0, 75.0, 10.0));
        assert_eq!(rust.robot_count, 1);

        assert_eq!(resolver.resolve("overheated_circuit").unwrap().robot_count, 2);
        assert_eq!(resolver.resolve("tilted_antenna").unwrap().robot_count, 1);
        assert_eq!(resolver.entries().count(), 3);
    }

    #[test]
    fn test_unknown_issue_type() {
        let resolver = IssueResolver::builtin();
        assert_eq!(
            resolver.resolve("rust_and_antenna").unwrap_err(),
            CoreError::UnknownIssueType("rust_and_antenna".into())
        );
    }

    #[test]
    fn test_qr_alias() {
        let resolver = IssueResolver::builtin();
        assert_eq!(resolver.resolve_qr("CIRCUIT_QR").unwrap(), "overheated_circuit");
        assert!(resolver.resolve_qr("NOT_A_QR").is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let resolver = IssueResolver::from_toml_str(
            r#"
            [issues.cracked_panel]
            coordinates = { x = 10, y = 20.5, z = 0 }
            robot_count = 3
            description = "Cracked solar panel"
            "#,
        )
        .expect("valid table");

        let panel = resolver.resolve("cracked_panel").unwrap();
        assert_eq!(panel.robot_count, 3);
        assert_eq!(panel.coordinates, Position::new(10.0, 20.5, 0.0));
        assert!(resolver.resolve("rust").is_err());
    }

    #[test]
    fn test_rejects_zero_robot_count() {
        let result = IssueResolver::from_toml_str(
            r#"
            [issues.nothing]
            coordinates = { x = 0, y = 0, z = 0 }
            robot_count = 0
            description = "needs nobody"
            "#,
        );
        assert!(result.is_err());
        assert!(IssueResolver::new(BTreeMap::new()).is_err());
    }
}
