//! User-table discovery: identity, primary key, and column catalog.

use sqlx::mssql::MssqlPool;
use sqlx::Row;

use crate::error::{Result, TriggerError};

const PK_COLUMNS_SQL: &str = r#"
SELECT c.name AS [column_name],
       t.name AS [type_name],
       CAST(c.max_length AS INT) AS [max_length],
       CAST(c.precision AS INT) AS [precision],
       CAST(c.scale AS INT) AS [scale]
FROM sys.indexes i
INNER JOIN sys.index_columns ic
    ON i.object_id = ic.object_id AND i.index_id = ic.index_id
INNER JOIN sys.columns c
    ON ic.object_id = c.object_id AND ic.column_id = c.column_id
INNER JOIN sys.types t
    ON c.user_type_id = t.user_type_id
WHERE i.object_id = @p1 AND i.is_primary_key = 1
ORDER BY ic.key_ordinal
"#;

const ALL_COLUMNS_SQL: &str = r#"
SELECT c.name AS [column_name]
FROM sys.columns c
WHERE c.object_id = @p1
ORDER BY c.column_id
"#;

const TABLE_IDENTITY_SQL: &str = r#"
SELECT s.name AS [schema_name], t.name AS [table_name]
FROM sys.tables t
INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
WHERE t.object_id = @p1
"#;

/// A column of the user table's primary key, with a type rendering precise
/// enough to recreate the column in DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PrimaryKeyColumn {
    pub name: String,
    pub sql_type: String,
}

/// Resolved identity and schema of the monitored table. The column lists are
/// canonical for the whole session; the user table's schema is assumed not
/// to change while a monitor runs.
#[derive(Debug, Clone)]
pub(crate) struct UserTable {
    pub object_id: i32,
    pub schema: String,
    pub name: String,
    /// Primary-key columns in key ordinal order.
    pub pk_columns: Vec<PrimaryKeyColumn>,
    /// Non-key column names in catalog order.
    pub other_columns: Vec<String>,
}

impl UserTable {
    /// Resolve the table named in the trigger configuration.
    pub async fn resolve(pool: &MssqlPool, table_name: &str) -> Result<Self> {
        let object_id: Option<i32> = sqlx::query_scalar("SELECT OBJECT_ID(@p1, 'U')")
            .bind(table_name)
            .fetch_one(pool)
            .await?;
        let object_id = object_id.ok_or_else(|| TriggerError::TableNotFound {
            table: table_name.to_string(),
        })?;

        let identity = sqlx::query(TABLE_IDENTITY_SQL)
            .bind(object_id)
            .fetch_one(pool)
            .await?;
        let schema: String = identity.try_get("schema_name")?;
        let name: String = identity.try_get("table_name")?;

        let pk_rows = sqlx::query(PK_COLUMNS_SQL)
            .bind(object_id)
            .fetch_all(pool)
            .await?;
        if pk_rows.is_empty() {
            return Err(TriggerError::NoPrimaryKey {
                table: table_name.to_string(),
            });
        }
        let mut pk_columns = Vec::with_capacity(pk_rows.len());
        for row in &pk_rows {
            let column_name: String = row.try_get("column_name")?;
            let type_name: String = row.try_get("type_name")?;
            let max_length: i32 = row.try_get("max_length")?;
            let precision: i32 = row.try_get("precision")?;
            let scale: i32 = row.try_get("scale")?;
            pk_columns.push(PrimaryKeyColumn {
                name: column_name,
                sql_type: render_sql_type(&type_name, max_length, precision, scale),
            });
        }

        let all_rows = sqlx::query(ALL_COLUMNS_SQL)
            .bind(object_id)
            .fetch_all(pool)
            .await?;
        let mut other_columns = Vec::with_capacity(all_rows.len() - pk_columns.len());
        for row in &all_rows {
            let column_name: String = row.try_get("column_name")?;
            if !pk_columns.iter().any(|pk| pk.name == column_name) {
                other_columns.push(column_name);
            }
        }

        Ok(Self {
            object_id,
            schema,
            name,
            pk_columns,
            other_columns,
        })
    }

    /// Bracket-quoted `[schema].[table]`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn pk_len(&self) -> usize {
        self.pk_columns.len()
    }

    /// All payload columns: primary key first, then the remaining columns
    /// in catalog order.
    pub fn user_table_columns(&self) -> impl Iterator<Item = &str> {
        self.pk_columns
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.other_columns.iter().map(String::as_str))
    }
}

/// Render a catalog type for DDL. Character and binary types carry their
/// declared length (`(max)` when the catalog reports -1; the n-types report
/// byte lengths, so their character length is half), `numeric`/`decimal`
/// carry `(precision,scale)`, everything else renders bare.
pub(crate) fn render_sql_type(
    type_name: &str,
    max_length: i32,
    precision: i32,
    scale: i32,
) -> String {
    match type_name {
        "varchar" | "char" | "binary" | "varbinary" => {
            if max_length == -1 {
                format!("{}(max)", type_name)
            } else {
                format!("{}({})", type_name, max_length)
            }
        }
        "nvarchar" | "nchar" => {
            if max_length == -1 {
                format!("{}(max)", type_name)
            } else {
                format!("{}({})", type_name, max_length / 2)
            }
        }
        "decimal" | "numeric" => format!("{}({},{})", type_name, precision, scale),
        _ => type_name.to_string(),
    }
}

/// Bracket-quote an identifier coming from the catalog (`]` doubled).
pub(crate) fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_table() -> UserTable {
        UserTable {
            object_id: 901,
            schema: "dbo".to_string(),
            name: "Orders".to_string(),
            pk_columns: vec![PrimaryKeyColumn {
                name: "Id".to_string(),
                sql_type: "int".to_string(),
            }],
            other_columns: vec!["Customer".to_string(), "Total".to_string()],
        }
    }

    #[test]
    fn test_render_sql_type_character_lengths() {
        assert_eq!(render_sql_type("varchar", 50, 0, 0), "varchar(50)");
        assert_eq!(render_sql_type("varchar", -1, 0, 0), "varchar(max)");
        assert_eq!(render_sql_type("char", 10, 0, 0), "char(10)");
        assert_eq!(render_sql_type("varbinary", 16, 0, 0), "varbinary(16)");
        assert_eq!(render_sql_type("varbinary", -1, 0, 0), "varbinary(max)");
    }

    #[test]
    fn test_render_sql_type_halves_n_type_byte_lengths() {
        assert_eq!(render_sql_type("nvarchar", 100, 0, 0), "nvarchar(50)");
        assert_eq!(render_sql_type("nchar", 8, 0, 0), "nchar(4)");
        assert_eq!(render_sql_type("nvarchar", -1, 0, 0), "nvarchar(max)");
    }

    #[test]
    fn test_render_sql_type_numeric_precision() {
        assert_eq!(render_sql_type("decimal", 9, 10, 2), "decimal(10,2)");
        assert_eq!(render_sql_type("numeric", 9, 18, 0), "numeric(18,0)");
    }

    #[test]
    fn test_render_sql_type_bare_types() {
        assert_eq!(render_sql_type("int", 4, 10, 0), "int");
        assert_eq!(render_sql_type("bigint", 8, 19, 0), "bigint");
        assert_eq!(render_sql_type("datetime2", 8, 27, 7), "datetime2");
        assert_eq!(render_sql_type("uniqueidentifier", 16, 0, 0), "uniqueidentifier");
    }

    #[test]
    fn test_quote_ident_escapes_closing_bracket() {
        assert_eq!(quote_ident("Orders"), "[Orders]");
        assert_eq!(quote_ident("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_user_table_columns_pk_first() {
        let table = orders_table();
        let columns: Vec<&str> = table.user_table_columns().collect();
        assert_eq!(columns, vec!["Id", "Customer", "Total"]);
        assert_eq!(table.qualified_name(), "[dbo].[Orders]");
    }
}
