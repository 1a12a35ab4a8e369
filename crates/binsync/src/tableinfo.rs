//! Table metadata pulled from the primary.
//!
//! Binlog row images carry types and values but no column names, so each
//! replicated table's definition is loaded once via `SHOW COLUMNS` /
//! `SHOW INDEX` over a separate metadata connection and cached by the
//! handler until a rows event disagrees with it.

use mysql_async::prelude::Queryable;
use mysql_async::Row;

use crate::binlog::ColumnValue;
use crate::error::{Result, SyncError};
use crate::rule::SyncDesc;

/// One column of a replicated table.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    pub index: usize,
    pub name: String,
    pub column_type: String,
    pub is_primary: bool,
    pub nullable: bool,
    pub default: Option<String>,
    pub unsigned: bool,
    pub auto_increment: bool,
}

/// A table definition plus the index columns used for primary-key
/// partitioning and WHERE clauses.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// Positions (into `columns`) of the index key.
    pub index_columns: Vec<usize>,
}

impl TableInfo {
    pub fn key(&self) -> String {
        table_key(&self.schema, &self.name)
    }

    pub fn index_column_infos(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.index_columns.iter().map(|&i| &self.columns[i])
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// `schema.table`, the cache and dispatch key form.
pub fn table_key(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

/// A column paired with its decoded value for one row image.
#[derive(Debug, Clone)]
pub struct ColumnWithValue {
    pub column: ColumnInfo,
    pub value: ColumnValue,
}

impl ColumnWithValue {
    /// Stable textual form, honoring the column's signedness.
    pub fn value_text(&self) -> String {
        if self.column.unsigned {
            self.value.clone().into_unsigned().to_text()
        } else {
            self.value.to_text()
        }
    }
}

/// Pair the decoded row values with the table's columns, positionally.
///
/// The row carries `column_count` values from the binlog; the cached table
/// may know more columns than the event (columns added after the event was
/// written are absent).
pub fn fill_columns_with_values(ti: &TableInfo, values: &[ColumnValue]) -> Vec<ColumnWithValue> {
    ti.columns
        .iter()
        .zip(values.iter())
        .map(|(column, value)| ColumnWithValue {
            column: column.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Load a table definition from the primary and resolve its index columns.
///
/// `index-keys` from the sync rule override the discovered primary key.
pub async fn load_table_info(
    conn: &mut mysql_async::Conn,
    schema: &str,
    table: &str,
    desc: &SyncDesc,
) -> Result<TableInfo> {
    let mut ti = TableInfo {
        schema: schema.to_string(),
        name: table.to_string(),
        ..TableInfo::default()
    };

    load_columns(conn, &mut ti).await?;
    load_primary_keys(conn, &mut ti).await?;

    if !desc.index_keys.is_empty() {
        // The rule overrides the discovered key.
        for column in ti.columns.iter_mut() {
            column.is_primary = false;
        }
        for key in &desc.index_keys {
            let column = ti
                .columns
                .iter_mut()
                .find(|c| &c.name == key)
                .ok_or_else(|| {
                    SyncError::schema(format!(
                        "index key {key} not found in {}.{}",
                        schema, table
                    ))
                })?;
            column.is_primary = true;
        }
    }

    ti.index_columns = ti
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_primary)
        .map(|(i, _)| i)
        .collect();

    Ok(ti)
}

/// `SHOW COLUMNS FROM`: Field, Type, Null, Key, Default, Extra.
async fn load_columns(conn: &mut mysql_async::Conn, ti: &mut TableInfo) -> Result<()> {
    let stmt = format!("SHOW COLUMNS FROM `{}`.`{}`", ti.schema, ti.name);
    let rows: Vec<Row> = conn.query(stmt).await?;

    for (index, row) in rows.into_iter().enumerate() {
        let name: String = row.get(0).unwrap_or_default();
        let column_type: String = row.get(1).unwrap_or_default();
        let null: String = row.get(2).unwrap_or_default();
        let default: Option<String> = row.get(4).unwrap_or(None);
        let extra: String = row.get(5).unwrap_or_default();

        ti.columns.push(ColumnInfo {
            index,
            name,
            nullable: !null.eq_ignore_ascii_case("NO"),
            unsigned: column_type.contains("unsigned"),
            auto_increment: extra.contains("auto_increment"),
            column_type,
            default,
            is_primary: false,
        });
    }

    if ti.columns.is_empty() {
        return Err(SyncError::schema(format!(
            "table {}.{} has no columns",
            ti.schema, ti.name
        )));
    }
    Ok(())
}

/// `SHOW INDEX FROM`: mark the columns of the first unique key.
async fn load_primary_keys(conn: &mut mysql_async::Conn, ti: &mut TableInfo) -> Result<()> {
    let stmt = format!("SHOW INDEX FROM `{}`.`{}`", ti.schema, ti.name);
    let rows: Vec<Row> = conn.query(stmt).await?;

    let mut key_name = String::new();
    for row in rows {
        let non_unique: String = row
            .get::<mysql_async::Value, _>(1)
            .map(value_text)
            .unwrap_or_default();
        if non_unique != "0" {
            continue;
        }
        let this_key: String = row.get(2).unwrap_or_default();
        if key_name.is_empty() {
            key_name = this_key.clone();
        } else if key_name != this_key {
            // Only the first unique key participates.
            break;
        }
        let column_name: String = row.get(4).unwrap_or_default();
        if let Some(column) = ti.columns.iter_mut().find(|c| c.name == column_name) {
            column.is_primary = true;
        }
    }
    Ok(())
}

fn value_text(v: mysql_async::Value) -> String {
    match v {
        mysql_async::Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        mysql_async::Value::Int(i) => i.to_string(),
        mysql_async::Value::UInt(u) => u.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_columns(names: &[(&str, bool)]) -> TableInfo {
        let columns: Vec<ColumnInfo> = names
            .iter()
            .enumerate()
            .map(|(index, (name, is_primary))| ColumnInfo {
                index,
                name: name.to_string(),
                is_primary: *is_primary,
                ..ColumnInfo::default()
            })
            .collect();
        let index_columns = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary)
            .map(|(i, _)| i)
            .collect();
        TableInfo {
            schema: "d".into(),
            name: "t".into(),
            columns,
            index_columns,
        }
    }

    #[test]
    fn test_table_key() {
        assert_eq!(table_key("d", "t"), "d.t");
        let ti = table_with_columns(&[("id", true)]);
        assert_eq!(ti.key(), "d.t");
    }

    #[test]
    fn test_index_column_infos() {
        let ti = table_with_columns(&[("id", true), ("name", false), ("ts", true)]);
        let keys: Vec<&str> = ti.index_column_infos().map(|c| c.name.as_str()).collect();
        assert_eq!(keys, vec!["id", "ts"]);
    }

    #[test]
    fn test_fill_columns_with_values() {
        let ti = table_with_columns(&[("id", true), ("name", false)]);
        let values = vec![ColumnValue::Int32(9), ColumnValue::String("x".into())];
        let cwv = fill_columns_with_values(&ti, &values);
        assert_eq!(cwv.len(), 2);
        assert_eq!(cwv[0].column.name, "id");
        assert_eq!(cwv[0].value, ColumnValue::Int32(9));
        assert_eq!(cwv[1].value_text(), "x");
    }

    #[test]
    fn test_fill_truncates_to_event_width() {
        // The table knows a column the event predates.
        let ti = table_with_columns(&[("id", true), ("name", false), ("added_later", false)]);
        let values = vec![ColumnValue::Int32(1), ColumnValue::Null];
        let cwv = fill_columns_with_values(&ti, &values);
        assert_eq!(cwv.len(), 2);
    }

    #[test]
    fn test_unsigned_value_text() {
        let mut ti = table_with_columns(&[("flags", false)]);
        ti.columns[0].unsigned = true;
        let cwv = fill_columns_with_values(&ti, &[ColumnValue::Int8(-1)]);
        assert_eq!(cwv[0].value_text(), "255");
    }
}
