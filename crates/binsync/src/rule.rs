//! Schema/table sync rules: filtering and rewrite resolution.
//!
//! Rule keys whose string starts with `^` and ends with `$` are compiled as
//! regular expressions; anything else matches as a constant. Lookup tries
//! the constant map first, then scans the regexes in insertion order. An
//! empty rule set passes every schema and table unchanged.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, SyncError};

/// The resolved filter decision for a `(schema, table)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDesc {
    pub schema: String,
    pub table: String,
    pub rewrite_schema: String,
    pub rewrite_table: String,
    pub index_keys: Vec<String>,
}

impl SyncDesc {
    /// A pass-through decision that keeps the names unchanged.
    pub fn identity(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            rewrite_schema: schema.to_string(),
            rewrite_table: table.to_string(),
            index_keys: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.schema.is_empty() {
            return Err(SyncError::rule("sync desc has an empty schema"));
        }
        Ok(())
    }
}

/// Constant-key map plus ordered regex keys.
#[derive(Default)]
struct RuleContainer {
    consts: HashMap<String, SyncDesc>,
    regs: Vec<(Regex, SyncDesc)>,
}

impl RuleContainer {
    fn add(&mut self, key: &str, desc: SyncDesc) -> Result<()> {
        if key.starts_with('^') && key.ends_with('$') {
            let reg = Regex::new(key)
                .map_err(|e| SyncError::rule(format!("invalid rule regex {key}: {e}")))?;
            self.regs.push((reg, desc));
        } else {
            self.consts.insert(key.to_string(), desc);
        }
        Ok(())
    }

    fn find(&self, key: &str) -> Option<&SyncDesc> {
        if let Some(desc) = self.consts.get(key) {
            return Some(desc);
        }
        self.regs
            .iter()
            .find(|(reg, _)| reg.is_match(key))
            .map(|(_, desc)| desc)
    }
}

/// The table rules of a single schema entry.
#[derive(Default)]
struct SchemaRule {
    container: RuleContainer,
    desc: SyncDesc,
    tables: HashMap<String, SyncDesc>,
    /// Set by a rule that names the schema without a table.
    pass_all: bool,
}

impl SchemaRule {
    fn add_rule(&mut self, desc: &SyncDesc) -> Result<()> {
        if self.desc.schema.is_empty() && self.desc.rewrite_schema.is_empty() {
            self.desc.schema = desc.schema.clone();
            self.desc.rewrite_schema = desc.rewrite_schema.clone();
        }
        if self.desc.schema != desc.schema || self.desc.rewrite_schema != desc.rewrite_schema {
            return Err(SyncError::rule(format!(
                "conflicting rewrites for schema {}",
                desc.schema
            )));
        }

        if desc.table.is_empty() {
            self.pass_all = true;
            return Ok(());
        }

        if self.tables.contains_key(&desc.table) {
            return Err(SyncError::rule(format!(
                "duplicate rule for {}.{}",
                desc.schema, desc.table
            )));
        }
        self.tables.insert(desc.table.clone(), desc.clone());
        self.container.add(&desc.table, desc.clone())
    }

    fn can_sync(&self, table: &str) -> Option<SyncDesc> {
        if let Some(desc) = self.container.find(table) {
            return Some(desc.clone());
        }
        if self.pass_all {
            return Some(SyncDesc {
                schema: self.desc.schema.clone(),
                rewrite_schema: self.desc.rewrite_schema.clone(),
                table: table.to_string(),
                rewrite_table: table.to_string(),
                index_keys: Vec::new(),
            });
        }
        None
    }
}

/// The rule engine deciding which tables replicate and under what names.
///
/// An explicit table rule wins over the schema's pass-all bit; conflicting
/// rules are rejected when they are added, before the engine starts.
#[derive(Default)]
pub struct SyncRule {
    container: RuleContainer,
    schemas: HashMap<String, SchemaRule>,
}

impl SyncRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(descs: &[SyncDesc]) -> Result<Self> {
        let mut rule = Self::new();
        for desc in descs {
            rule.add_rule(desc)?;
        }
        Ok(rule)
    }

    /// Insert one rule. Must not be called after the engine starts.
    pub fn add_rule(&mut self, desc: &SyncDesc) -> Result<()> {
        desc.validate()?;

        let schema_rule = self.schemas.entry(desc.schema.clone()).or_default();
        schema_rule.add_rule(desc)?;
        self.container.add(&desc.schema, desc.clone())
    }

    /// Resolve the filter decision for `(schema, table)`. `None` means the
    /// table is excluded from replication.
    pub fn can_sync_table(&self, schema: &str, table: &str) -> Option<SyncDesc> {
        if self.schemas.is_empty() {
            // No rules at all: pass everything unchanged.
            return Some(SyncDesc::identity(schema, table));
        }
        let schema_desc = self.container.find(schema)?;
        let schema_rule = self.schemas.get(&schema_desc.schema)?;
        schema_rule.can_sync(table)
    }
}

/// The `sync-rule` configuration block:
/// `databases{name}.{rewrite, tables{name}.{rewrite, index-keys}}`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub databases: HashMap<String, Option<DatabaseRuleConfig>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseRuleConfig {
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default)]
    pub tables: Option<HashMap<String, Option<TableRuleConfig>>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TableRuleConfig {
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default, rename = "index-keys")]
    pub index_keys: Vec<String>,
}

impl SyncConfig {
    /// Flatten the configuration into rule descriptors. Empty rewrites
    /// default to the original names.
    pub fn to_sync_descs(&self) -> Vec<SyncDesc> {
        let mut descs = Vec::with_capacity(self.databases.len());
        for (db_name, db) in &self.databases {
            let db_rewrite = db
                .as_ref()
                .and_then(|d| d.rewrite.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| db_name.clone());

            let tables = db.as_ref().and_then(|d| d.tables.as_ref());
            match tables {
                None => {
                    descs.push(SyncDesc {
                        schema: db_name.clone(),
                        rewrite_schema: db_rewrite,
                        ..SyncDesc::default()
                    });
                }
                Some(tables) => {
                    for (tbl_name, tbl) in tables {
                        let tbl_rewrite = tbl
                            .as_ref()
                            .and_then(|t| t.rewrite.clone())
                            .filter(|s| !s.is_empty())
                            .unwrap_or_else(|| tbl_name.clone());
                        descs.push(SyncDesc {
                            schema: db_name.clone(),
                            rewrite_schema: db_rewrite.clone(),
                            table: tbl_name.clone(),
                            rewrite_table: tbl_rewrite,
                            index_keys: tbl
                                .as_ref()
                                .map(|t| t.index_keys.clone())
                                .unwrap_or_default(),
                        });
                    }
                }
            }
        }
        descs
    }

    pub fn build(&self) -> Result<SyncRule> {
        SyncRule::with_rules(&self.to_sync_descs())
    }
}
