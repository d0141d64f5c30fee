//! SQL-backed state stores.
//!
//! Everything here runs against the abstract [`SqlClient`] executor; the
//! embedding application supplies the actual driver. Statements use `?`
//! positional placeholders and the client maps them to whatever its driver
//! expects. Connections are the client's concern; the stores acquire nothing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::StateBackendError;

pub use kv::SqlKeyValueStore;
pub use object::SqlObjectStore;
pub use schema::{
    ChildDescriptor, EntityLayout, FieldDescriptor, FieldKind, RowDescriptor, SchemaOptions,
    SqlEntity,
};
pub use sequence::SqlSequenceStore;

mod kv;
mod object;
mod schema;
mod sequence;

/// A value crossing the store/driver boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Decimal(Decimal),
    Text(String),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    /// Millisecond ticks of a duration.
    DurationMs(i64),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Bool(_) => "bool",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::Text(_) => "text",
            SqlValue::DateTime(_) => "datetime",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::DurationMs(_) => "duration",
            SqlValue::Bytes(_) => "bytes",
        }
    }

    fn mismatch(&self, column: &str, expected: &'static str) -> StateBackendError {
        StateBackendError::TypeMismatch {
            column: column.to_string(),
            expected,
            got: self.kind_name(),
        }
    }

    pub fn as_i64(&self, column: &str) -> Result<i64, StateBackendError> {
        match self {
            SqlValue::Int(v) | SqlValue::DurationMs(v) => Ok(*v),
            other => Err(other.mismatch(column, "int")),
        }
    }

    pub fn as_f64(&self, column: &str) -> Result<f64, StateBackendError> {
        match self {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v as f64),
            other => Err(other.mismatch(column, "float")),
        }
    }

    pub fn as_bool(&self, column: &str) -> Result<bool, StateBackendError> {
        match self {
            SqlValue::Bool(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v != 0),
            other => Err(other.mismatch(column, "bool")),
        }
    }

    pub fn as_decimal(&self, column: &str) -> Result<Decimal, StateBackendError> {
        match self {
            SqlValue::Decimal(v) => Ok(*v),
            SqlValue::Int(v) => Ok(Decimal::from(*v)),
            other => Err(other.mismatch(column, "decimal")),
        }
    }

    pub fn as_text(&self, column: &str) -> Result<&str, StateBackendError> {
        match self {
            SqlValue::Text(v) => Ok(v),
            other => Err(other.mismatch(column, "text")),
        }
    }

    pub fn as_datetime(&self, column: &str) -> Result<DateTime<Utc>, StateBackendError> {
        match self {
            SqlValue::DateTime(v) => Ok(*v),
            other => Err(other.mismatch(column, "datetime")),
        }
    }

    pub fn as_uuid(&self, column: &str) -> Result<Uuid, StateBackendError> {
        match self {
            SqlValue::Uuid(v) => Ok(*v),
            SqlValue::Text(v) => Uuid::parse_str(v)
                .map_err(|_| SqlValue::Text(v.clone()).mismatch(column, "uuid")),
            other => Err(other.mismatch(column, "uuid")),
        }
    }
}

/// One row of a query result, with its column names.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|i| &self.values[i])
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

/// The abstract SQL executor the stores run against.
pub trait SqlClient: Send + Sync {
    /// Run a statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StateBackendError>;

    /// Run a query, returning all rows.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, StateBackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    SqlServer,
    Postgres,
}

impl SqlDialect {
    pub fn column_type(&self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (SqlDialect::SqlServer, FieldKind::Int) => "INT",
            (SqlDialect::SqlServer, FieldKind::Long) => "BIGINT",
            (SqlDialect::SqlServer, FieldKind::Bool) => "BIT",
            (SqlDialect::SqlServer, FieldKind::Float) => "REAL",
            (SqlDialect::SqlServer, FieldKind::Double) => "FLOAT",
            (SqlDialect::SqlServer, FieldKind::Decimal) => "DECIMAL(18,2)",
            (SqlDialect::SqlServer, FieldKind::DateTime) => "DATETIME2",
            (SqlDialect::SqlServer, FieldKind::Uuid) => "UNIQUEIDENTIFIER",
            (SqlDialect::SqlServer, FieldKind::Duration) => "BIGINT",
            (SqlDialect::SqlServer, FieldKind::Text) => "NVARCHAR(MAX)",
            (SqlDialect::Postgres, FieldKind::Int) => "INTEGER",
            (SqlDialect::Postgres, FieldKind::Long) => "BIGINT",
            (SqlDialect::Postgres, FieldKind::Bool) => "BOOLEAN",
            (SqlDialect::Postgres, FieldKind::Float) => "REAL",
            (SqlDialect::Postgres, FieldKind::Double) => "DOUBLE PRECISION",
            (SqlDialect::Postgres, FieldKind::Decimal) => "NUMERIC(18,2)",
            (SqlDialect::Postgres, FieldKind::DateTime) => "TIMESTAMP",
            (SqlDialect::Postgres, FieldKind::Uuid) => "UUID",
            (SqlDialect::Postgres, FieldKind::Duration) => "BIGINT",
            (SqlDialect::Postgres, FieldKind::Text) => "TEXT",
        }
    }

    /// The type of key columns; bounded so it can be a primary key.
    pub fn key_type(&self) -> &'static str {
        match self {
            SqlDialect::SqlServer => "NVARCHAR(450)",
            SqlDialect::Postgres => "TEXT",
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            SqlDialect::SqlServer => format!("[{ident}]"),
            SqlDialect::Postgres => format!("\"{ident}\""),
        }
    }

    pub fn qualify(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote(schema), self.quote(table))
    }

    pub(crate) fn create_schema_sql(&self, schema: &str) -> String {
        match self {
            SqlDialect::SqlServer => format!(
                "IF SCHEMA_ID(N'{schema}') IS NULL EXEC(N'CREATE SCHEMA {}')",
                self.quote(schema)
            ),
            SqlDialect::Postgres => {
                format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote(schema))
            }
        }
    }
}
