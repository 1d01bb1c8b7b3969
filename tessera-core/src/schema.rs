//! YAML table schema
//!
//! Tables are declared in a YAML file that the database polls for
//! additions:
//!
//! ```yaml
//! tables:
//!   traffic:
//!     stream: inbound
//!     resolution: 60
//!     retention: 3600
//!     hot_period: 600
//!     group_by: [client]
//!     fields:
//!       - name: requests
//!         expr: { sum: { field: requests } }
//!       - name: error_rate
//!         expr:
//!           binary:
//!             op: div
//!             left: { sum: { field: errors } }
//!             right: { sum: { field: requests } }
//! ```
//!
//! Durations are whole seconds.

use crate::core::Field;
use crate::expr::{Cond, Expr};
use crate::table::TableConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaFile {
    pub tables: BTreeMap<String, TableDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableDef {
    pub stream: String,
    /// Bucket width in seconds
    pub resolution: u64,
    /// Maximum age retained after flush, in seconds
    pub retention: u64,
    /// How far back the memstore retains, in seconds
    pub hot_period: u64,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filter: Option<Cond>,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub expr: Expr,
}

impl TableDef {
    pub fn to_config(&self, name: &str) -> TableConfig {
        TableConfig {
            name: name.to_lowercase(),
            stream: self.stream.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| Field::new(f.name.clone(), f.expr.clone()))
                .collect(),
            resolution: self.resolution as i64 * NANOS_PER_SEC,
            retention: self.retention as i64 * NANOS_PER_SEC,
            hot_period: self.hot_period as i64 * NANOS_PER_SEC,
            is_virtual: self.is_virtual,
            group_by: self.group_by.clone(),
            filter: self.filter.clone(),
        }
    }
}

/// Parse a schema file
pub fn load(path: &Path) -> Result<SchemaFile> {
    let raw = std::fs::read_to_string(path)?;
    parse(&raw)
}

/// Parse schema YAML
pub fn parse(raw: &str) -> Result<SchemaFile> {
    serde_yaml::from_str(raw).map_err(|err| Error::Config(format!("invalid schema: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
tables:
  traffic:
    stream: inbound
    resolution: 60
    retention: 3600
    hot_period: 600
    group_by: [client]
    fields:
      - name: requests
        expr: { sum: { field: requests } }
      - name: avg_latency
        expr: { avg: { field: latency } }
  errors_only:
    stream: inbound
    resolution: 60
    retention: 3600
    hot_period: 600
    virtual: true
    filter: { equals: { dim: status, value: error } }
    fields:
      - name: errors
        expr: { count: { field: status_code } }
"#;

    #[test]
    fn test_parse_schema() {
        let schema = parse(SCHEMA).unwrap();
        assert_eq!(schema.tables.len(), 2);

        let traffic = &schema.tables["traffic"];
        assert_eq!(traffic.stream, "inbound");
        assert_eq!(traffic.group_by, ["client"]);
        assert!(!traffic.is_virtual);
        assert_eq!(traffic.fields.len(), 2);
        assert_eq!(
            traffic.fields[0].expr,
            Expr::sum(Expr::field("requests"))
        );

        let errors = &schema.tables["errors_only"];
        assert!(errors.is_virtual);
        assert!(matches!(errors.filter, Some(Cond::Equals { .. })));
    }

    #[test]
    fn test_to_config_converts_durations() {
        let schema = parse(SCHEMA).unwrap();
        let config = schema.tables["traffic"].to_config("Traffic");
        assert_eq!(config.name, "traffic");
        assert_eq!(config.resolution, 60 * NANOS_PER_SEC);
        assert_eq!(config.retention, 3600 * NANOS_PER_SEC);
        assert_eq!(config.hot_period, 600 * NANOS_PER_SEC);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(matches!(parse("tables: ["), Err(Error::Config(_))));
    }
}
