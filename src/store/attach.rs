// Read-only cross-store queries over attached databases
//
// Additional stores may be attached for analytics after two checks: the
// canonical path must sit under the allowed prefix, and the path must have
// been declared up front. Aliases and any other identifier reaching SQL
// text are validated against a safe character set; user-supplied values are
// bound exclusively through parameter placeholders.

use super::Store;
use anyhow::{bail, Context, Result};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Declares which paths may ever be attached.
#[derive(Debug, Clone, Default)]
pub struct AttachPolicy {
    allowed_prefix: PathBuf,
    declared: HashSet<PathBuf>,
}

impl AttachPolicy {
    pub fn new(allowed_prefix: impl Into<PathBuf>) -> Self {
        AttachPolicy {
            allowed_prefix: allowed_prefix.into(),
            declared: HashSet::new(),
        }
    }

    /// Pre-declare a path as attachable. Declaration does not attach.
    pub fn declare(&mut self, path: impl Into<PathBuf>) {
        self.declared.insert(path.into());
    }

    fn check(&self, path: &Path) -> Result<PathBuf> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("resolving {}", path.display()))?;
        let prefix = self
            .allowed_prefix
            .canonicalize()
            .with_context(|| format!("resolving {}", self.allowed_prefix.display()))?;
        if !canonical.starts_with(&prefix) {
            bail!(
                "{} is outside the allowed prefix {}",
                canonical.display(),
                prefix.display()
            );
        }
        if !self.declared.contains(path) && !self.declared.contains(&canonical) {
            bail!("{} was not declared for attachment", path.display());
        }
        Ok(canonical)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*` — anything else never reaches SQL text.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        bail!("invalid identifier {name:?}");
    }
    Ok(())
}

impl Store {
    /// Attach a declared database under `alias` for read-only queries.
    pub fn attach_store(&self, alias: &str, path: &Path, policy: &AttachPolicy) -> Result<()> {
        validate_identifier(alias)?;
        let canonical = policy.check(path)?;
        self.with_writer(|conn| {
            // Alias is a validated identifier; the path is bound.
            let sql = format!("ATTACH DATABASE ?1 AS {alias}");
            conn.execute(&sql, [canonical.to_string_lossy().as_ref()])
                .with_context(|| format!("attaching {alias}"))?;
            Ok(())
        })
    }

    pub fn detach_store(&self, alias: &str) -> Result<()> {
        validate_identifier(alias)?;
        self.with_writer(|conn| {
            conn.execute(&format!("DETACH DATABASE {alias}"), [])
                .with_context(|| format!("detaching {alias}"))?;
            Ok(())
        })
    }

    /// Read rows from an attached table. Identifiers are validated; filter
    /// values go through placeholders.
    pub fn select_attached(
        &self,
        alias: &str,
        table: &str,
        columns: &[&str],
        filters: &[(&str, Value)],
        limit: u32,
    ) -> Result<Vec<Map<String, Value>>> {
        validate_identifier(alias)?;
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }

        let column_list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };
        let mut sql = format!("SELECT {column_list} FROM {alias}.{table}");
        let mut params: Vec<SqlValue> = Vec::new();
        if !filters.is_empty() {
            let mut clauses = Vec::new();
            for (i, (column, value)) in filters.iter().enumerate() {
                validate_identifier(column)?;
                clauses.push(format!("{column} = ?{}", i + 1));
                params.push(json_to_sql(value)?);
            }
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" LIMIT {limit}"));

        self.with_writer(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), |row| {
                    let mut object = Map::new();
                    for (i, name) in names.iter().enumerate() {
                        object.insert(name.clone(), sql_to_json(row.get_ref(i)?));
                    }
                    Ok(object)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn json_to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                bail!("unsupported numeric filter value {n}")
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => bail!("unsupported filter value {other}"),
    })
}

fn sql_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}
