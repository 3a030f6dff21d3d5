//! In-memory batch rows and typed payload decoding.
//!
//! The wire form between the database and handlers is a string-keyed map:
//! every selected column arrives as its catalog string rendering (SQL NULL
//! stays NULL). Typed decode into the user's payload type is target-driven:
//! integer, float, and bool fields parse their cell text, string fields take
//! it verbatim, `Option` fields map NULL to `None`, and nested structures
//! parse the cell as JSON.

use serde::de::value::{BorrowedStrDeserializer, Error as DeError, MapDeserializer};
use serde::de::{self, DeserializeOwned, Deserializer, IntoDeserializer, Visitor};
use serde::forward_to_deserialize_any;
use sqlx::mssql::MssqlRow;
use sqlx::Row;

use crate::change::SqlChangeOperation;
use crate::error::{Result, TriggerError};
use crate::table::UserTable;

/// One row of the current batch: the change-tracking metadata plus ordered
/// column values (primary-key columns first, then the remaining user-table
/// columns in catalog order).
#[derive(Debug, Clone)]
pub(crate) struct ChangeRow {
    pub version: i64,
    /// Raw `SYS_CHANGE_OPERATION` code, carried unvalidated through lease
    /// acquisition. Validation belongs to process-changes, after the
    /// acquire transaction has committed.
    pub operation_code: String,
    /// `(column name, rendered value)`; `None` is SQL NULL.
    pub columns: Vec<(String, Option<String>)>,
}

impl ChangeRow {
    /// Read one candidate row from the acquire-changes select.
    pub fn from_mssql_row(row: &MssqlRow, table: &UserTable) -> Result<Self> {
        let version: i64 = row.try_get("SYS_CHANGE_VERSION")?;
        let operation_code: String = row.try_get("SYS_CHANGE_OPERATION")?;

        let mut columns = Vec::with_capacity(table.pk_len() + table.other_columns.len());
        for name in table.user_table_columns() {
            let value: Option<String> = row.try_get(name)?;
            columns.push((name.to_string(), value));
        }

        Ok(Self {
            version,
            operation_code,
            columns,
        })
    }

    /// Decode the operation code; anything outside I/U/D is a batch-fatal
    /// decode error.
    pub fn operation(&self) -> Result<SqlChangeOperation> {
        SqlChangeOperation::from_code(&self.operation_code)
    }

    /// The primary-key cells; always the first `pk_len` columns.
    pub fn pk_values(&self, pk_len: usize) -> &[(String, Option<String>)] {
        &self.columns[..pk_len]
    }

    /// Decode this row into the handler payload type. Deletes expose only
    /// the primary-key columns.
    pub fn deserialize_item<T: DeserializeOwned>(
        &self,
        pk_len: usize,
        operation: SqlChangeOperation,
    ) -> Result<T> {
        let cells = if operation.is_delete() {
            self.pk_values(pk_len)
        } else {
            &self.columns[..]
        };
        let map = MapDeserializer::new(
            cells
                .iter()
                .map(|(name, value)| (name.as_str(), Cell(value.as_deref()))),
        );
        T::deserialize(map).map_err(|e: DeError| TriggerError::Decode(e.to_string()))
    }
}

/// A single column value in its catalog string rendering.
#[derive(Debug, Clone, Copy)]
struct Cell<'de>(Option<&'de str>);

impl<'de> Cell<'de> {
    fn require(self) -> std::result::Result<&'de str, DeError> {
        self.0
            .ok_or_else(|| de::Error::custom("unexpected SQL NULL for a non-optional field"))
    }

    fn json(self) -> std::result::Result<serde_json::Value, DeError> {
        let text = self.require()?;
        serde_json::from_str(text)
            .map_err(|e| de::Error::custom(format!("invalid JSON in column value: {}", e)))
    }
}

impl<'de> IntoDeserializer<'de, DeError> for Cell<'de> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! parse_primitive {
    ($method:ident => $visit:ident as $ty:ty) => {
        fn $method<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
        where
            V: Visitor<'de>,
        {
            let text = self.require()?;
            let value: $ty = text.trim().parse().map_err(|_| {
                de::Error::custom(format!(
                    "invalid {} value '{}'",
                    stringify!($ty),
                    text
                ))
            })?;
            visitor.$visit(value)
        }
    };
}

impl<'de> Deserializer<'de> for Cell<'de> {
    type Error = DeError;

    fn deserialize_any<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Some(text) => visitor.visit_borrowed_str(text),
            None => visitor.visit_unit(),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Some(_) => visitor.visit_some(self),
            None => visitor.visit_none(),
        }
    }

    fn deserialize_bool<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        // bit columns render as '1'/'0'.
        let value = match self.require()?.trim() {
            "1" => true,
            "0" => false,
            other => match other.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(de::Error::custom(format!("invalid bool value '{}'", other)));
                }
            },
        };
        visitor.visit_bool(value)
    }

    parse_primitive!(deserialize_i8 => visit_i8 as i8);
    parse_primitive!(deserialize_i16 => visit_i16 as i16);
    parse_primitive!(deserialize_i32 => visit_i32 as i32);
    parse_primitive!(deserialize_i64 => visit_i64 as i64);
    parse_primitive!(deserialize_u8 => visit_u8 as u8);
    parse_primitive!(deserialize_u16 => visit_u16 as u16);
    parse_primitive!(deserialize_u32 => visit_u32 as u32);
    parse_primitive!(deserialize_u64 => visit_u64 as u64);
    parse_primitive!(deserialize_f32 => visit_f32 as f32);
    parse_primitive!(deserialize_f64 => visit_f64 as f64);

    fn deserialize_str<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_borrowed_str(self.require()?)
    }

    fn deserialize_string<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        BorrowedStrDeserializer::<DeError>::new(self.require()?)
            .deserialize_enum(name, variants, visitor)
    }

    fn deserialize_seq<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        self.json()?.deserialize_seq(visitor).map_err(de::Error::custom)
    }

    fn deserialize_map<V>(self, visitor: V) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        self.json()?.deserialize_map(visitor).map_err(de::Error::custom)
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, DeError>
    where
        V: Visitor<'de>,
    {
        self.json()?
            .deserialize_struct(name, fields, visitor)
            .map_err(de::Error::custom)
    }

    forward_to_deserialize_any! {
        char bytes byte_buf unit unit_struct tuple tuple_struct identifier
        ignored_any
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    fn row(
        operation: SqlChangeOperation,
        version: i64,
        cells: &[(&str, Option<&str>)],
    ) -> ChangeRow {
        ChangeRow {
            version,
            operation_code: operation.as_code().to_string(),
            columns: cells
                .iter()
                .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
                .collect(),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        #[serde(rename = "Id")]
        id: i64,
        #[serde(rename = "Customer")]
        customer: String,
        #[serde(rename = "Total")]
        total: f64,
        #[serde(rename = "Express")]
        express: bool,
        #[serde(rename = "Note")]
        note: Option<String>,
    }

    #[test]
    fn test_deserialize_full_row() {
        let row = row(
            SqlChangeOperation::Insert,
            1,
            &[
                ("Id", Some("7")),
                ("Customer", Some("acme")),
                ("Total", Some("12.50")),
                ("Express", Some("1")),
                ("Note", None),
            ],
        );
        let order: Order = row.deserialize_item(1, SqlChangeOperation::Insert).unwrap();
        assert_eq!(
            order,
            Order {
                id: 7,
                customer: "acme".to_string(),
                total: 12.5,
                express: true,
                note: None,
            }
        );
    }

    #[test]
    fn test_deserialize_delete_uses_pk_columns_only() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct OrderRef {
            #[serde(rename = "Id")]
            id: i64,
            #[serde(rename = "Customer")]
            customer: Option<String>,
        }

        // The non-key cells are NULL in the select result for deletes, and
        // must not even be offered to the payload type.
        let row = row(
            SqlChangeOperation::Delete,
            4,
            &[("Id", Some("3")), ("Customer", None)],
        );
        let item: OrderRef = row.deserialize_item(1, SqlChangeOperation::Delete).unwrap();
        assert_eq!(
            item,
            OrderRef {
                id: 3,
                customer: None,
            }
        );
    }

    #[test]
    fn test_deserialize_enum_and_json_fields() {
        #[derive(Debug, Deserialize, PartialEq)]
        enum Status {
            Active,
            Closed,
        }

        #[derive(Debug, Deserialize, PartialEq)]
        struct Ticket {
            #[serde(rename = "Id")]
            id: i32,
            #[serde(rename = "Status")]
            status: Status,
            #[serde(rename = "Tags")]
            tags: Vec<i64>,
        }

        let row = row(
            SqlChangeOperation::Update,
            9,
            &[
                ("Id", Some("2")),
                ("Status", Some("Active")),
                ("Tags", Some("[1, 2, 3]")),
            ],
        );
        let ticket: Ticket = row.deserialize_item(1, SqlChangeOperation::Update).unwrap();
        assert_eq!(ticket.status, Status::Active);
        assert_eq!(ticket.tags, vec![1, 2, 3]);
    }

    #[test]
    fn test_deserialize_rejects_bad_integer() {
        #[derive(Debug, Deserialize)]
        struct Narrow {
            #[serde(rename = "Id")]
            #[allow(dead_code)]
            id: i64,
        }

        let row = row(SqlChangeOperation::Insert, 1, &[("Id", Some("seven"))]);
        let err = row
            .deserialize_item::<Narrow>(1, SqlChangeOperation::Insert)
            .unwrap_err();
        assert!(matches!(err, TriggerError::Decode(_)));
    }

    #[test]
    fn test_deserialize_rejects_null_for_required_field() {
        #[derive(Debug, Deserialize)]
        struct Narrow {
            #[serde(rename = "Id")]
            #[allow(dead_code)]
            id: i64,
        }

        let row = row(SqlChangeOperation::Insert, 1, &[("Id", None)]);
        assert!(row
            .deserialize_item::<Narrow>(1, SqlChangeOperation::Insert)
            .is_err());
    }

    #[test]
    fn test_pk_values_are_leading_columns() {
        let row = row(
            SqlChangeOperation::Update,
            2,
            &[
                ("Region", Some("north")),
                ("Id", Some("5")),
                ("Payload", Some("x")),
            ],
        );
        let pk: Vec<&str> = row
            .pk_values(2)
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(pk, vec!["Region", "Id"]);
    }
}
