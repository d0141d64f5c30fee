//! Entity layouts and schema management.
//!
//! Instead of reflecting over a value type at run time, a store is handed an
//! explicit descriptor list: one [`FieldDescriptor`] per scalar field and one
//! [`ChildDescriptor`] per sequence-of-record field. Descriptors carry plain
//! function pointers, so layouts stay `Send + Sync` and cheap to share.

use std::sync::Arc;

use crate::error::StateBackendError;
use crate::store::sql::{SqlClient, SqlDialect, SqlValue};

/// Type tag used to pick the SQL column type for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Long,
    Bool,
    Float,
    Double,
    Decimal,
    DateTime,
    Uuid,
    Duration,
    Text,
}

/// A scalar field of `T`, mapped to one column.
pub struct FieldDescriptor<T> {
    pub name: &'static str,
    pub kind: FieldKind,
    pub get: fn(&T) -> SqlValue,
    pub set: fn(&mut T, &SqlValue) -> Result<(), StateBackendError>,
}

/// Column layout of a record that lives in a child table (or is the sequence
/// item of a [`SqlSequenceStore`](crate::store::sql::SqlSequenceStore)).
pub struct RowDescriptor<C> {
    pub columns: Vec<FieldDescriptor<C>>,
}

impl<C: Default> RowDescriptor<C> {
    pub fn new(columns: Vec<FieldDescriptor<C>>) -> Self {
        Self { columns }
    }

    pub(crate) fn column_defs(&self) -> Vec<(&'static str, FieldKind)> {
        self.columns.iter().map(|c| (c.name, c.kind)).collect()
    }

    pub(crate) fn to_values(&self, item: &C) -> Vec<SqlValue> {
        self.columns.iter().map(|c| (c.get)(item)).collect()
    }

    pub(crate) fn from_values(&self, values: &[SqlValue]) -> Result<C, StateBackendError> {
        let mut item = C::default();
        for (descriptor, value) in self.columns.iter().zip(values) {
            (descriptor.set)(&mut item, value)?;
        }
        Ok(item)
    }
}

/// A sequence-of-record field of `T`, mapped to a child table. The item type
/// is erased behind row-value conversions.
pub struct ChildDescriptor<T> {
    pub name: &'static str,
    pub columns: Vec<(&'static str, FieldKind)>,
    #[allow(clippy::type_complexity)]
    pub get: Box<dyn Fn(&T) -> Vec<Vec<SqlValue>> + Send + Sync>,
    #[allow(clippy::type_complexity)]
    pub set: Box<dyn Fn(&mut T, Vec<Vec<SqlValue>>) -> Result<(), StateBackendError> + Send + Sync>,
}

impl<T: 'static> ChildDescriptor<T> {
    /// Describe a `Vec<C>` field through its row layout and accessors.
    pub fn of_rows<C: Default + 'static>(
        name: &'static str,
        rows: RowDescriptor<C>,
        get: fn(&T) -> &Vec<C>,
        set: fn(&mut T, Vec<C>),
    ) -> Self {
        let columns = rows.column_defs();
        let rows = Arc::new(rows);
        let read_rows = rows.clone();
        Self {
            name,
            columns,
            get: Box::new(move |value| get(value).iter().map(|c| rows.to_values(c)).collect()),
            set: Box::new(move |value, raw| {
                let items = raw
                    .iter()
                    .map(|r| read_rows.from_values(r))
                    .collect::<Result<Vec<_>, _>>()?;
                set(value, items);
                Ok(())
            }),
        }
    }
}

/// The full column layout of a stored value type.
pub struct EntityLayout<T> {
    pub scalars: Vec<FieldDescriptor<T>>,
    pub children: Vec<ChildDescriptor<T>>,
}

/// A value type that knows its own SQL layout.
pub trait SqlEntity: Default + Clone + Send + Sync + 'static {
    fn layout() -> EntityLayout<Self>;
}

#[derive(Debug, Clone)]
pub struct SchemaOptions {
    /// Add missing columns with `ALTER TABLE .. ADD` when a table already
    /// exists. When disabled a missing column is a `SchemaMissing` error.
    pub allow_column_add: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            allow_column_add: true,
        }
    }
}

/// Creates schemas and tables on first use and reconciles missing columns.
pub(crate) struct SchemaManager<'a> {
    pub client: &'a dyn SqlClient,
    pub dialect: SqlDialect,
    pub schema: &'a str,
    pub options: &'a SchemaOptions,
}

impl SchemaManager<'_> {
    pub(crate) fn ensure_schema(&self) -> Result<(), StateBackendError> {
        self.client
            .execute(&self.dialect.create_schema_sql(self.schema), &[])?;
        Ok(())
    }

    /// Create `table` with the given `(name, sql type)` columns, or align an
    /// existing one by adding whatever columns it lacks.
    pub(crate) fn ensure_table(
        &self,
        table: &str,
        columns: &[(String, String)],
        primary_key: &[&str],
    ) -> Result<(), StateBackendError> {
        match self.table_columns(table)? {
            None => {
                let cols = columns
                    .iter()
                    .map(|(name, ty)| format!("{} {}", self.dialect.quote(name), ty))
                    .collect::<Vec<_>>()
                    .join(", ");
                let pk = primary_key
                    .iter()
                    .map(|c| self.dialect.quote(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let qualified = self.dialect.qualify(self.schema, table);
                self.client.execute(
                    &format!("CREATE TABLE {qualified} ({cols}, PRIMARY KEY ({pk}))"),
                    &[],
                )?;
            }
            Some(existing) => {
                for (name, ty) in columns {
                    if existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                        continue;
                    }
                    if !self.options.allow_column_add {
                        return Err(StateBackendError::SchemaMissing {
                            table: table.to_string(),
                            column: name.clone(),
                        });
                    }
                    let qualified = self.dialect.qualify(self.schema, table);
                    tracing::info!("adding missing column {name} to {qualified}");
                    self.client.execute(
                        &format!(
                            "ALTER TABLE {qualified} ADD {} {}",
                            self.dialect.quote(name),
                            ty
                        ),
                        &[],
                    )?;
                }
            }
        }
        Ok(())
    }

    /// `None` when the table does not exist yet.
    fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, StateBackendError> {
        let rows = self.client.query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ?",
            &[
                SqlValue::Text(self.schema.to_string()),
                SqlValue::Text(table.to_string()),
            ],
        )?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let value = row
                .get("column_name")
                .ok_or_else(|| StateBackendError::Io("malformed information_schema row".into()))?;
            columns.push(value.as_text("column_name")?.to_string());
        }
        Ok(Some(columns))
    }
}
