//! SQL store for values that are themselves sequences of records.
//!
//! The main table holds only the keys; the items live in `<table>_Child`
//! with `(key, item_index, ...)` rows, re-inserted in order on every `put`.

use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StateBackendError;
use crate::store::sql::object::{INDEX_COLUMN, KEY_COLUMN};
use crate::store::sql::schema::SchemaManager;
use crate::store::sql::{RowDescriptor, SchemaOptions, SqlClient, SqlDialect, SqlValue};
use crate::store::{StateStore, StoreIter};

const CHILD_SUFFIX: &str = "Child";

pub struct SqlSequenceStore<K, C: Default> {
    name: String,
    schema: String,
    client: Arc<dyn SqlClient>,
    dialect: SqlDialect,
    rows: RowDescriptor<C>,
    _key: PhantomData<fn(K)>,
}

impl<K, C: Default> SqlSequenceStore<K, C> {
    pub fn new(
        client: Arc<dyn SqlClient>,
        dialect: SqlDialect,
        schema: impl Into<String>,
        table: impl Into<String>,
        rows: RowDescriptor<C>,
        options: SchemaOptions,
    ) -> Result<Self, StateBackendError> {
        let store = Self {
            name: table.into(),
            schema: schema.into(),
            client,
            dialect,
            rows,
            _key: PhantomData,
        };
        store.ensure_schema(&options)?;
        Ok(store)
    }

    fn ensure_schema(&self, options: &SchemaOptions) -> Result<(), StateBackendError> {
        let manager = SchemaManager {
            client: &*self.client,
            dialect: self.dialect,
            schema: &self.schema,
            options,
        };
        manager.ensure_schema()?;
        manager.ensure_table(
            &self.name,
            &[(KEY_COLUMN.to_string(), self.dialect.key_type().to_string())],
            &[KEY_COLUMN],
        )?;
        let mut columns = vec![
            (KEY_COLUMN.to_string(), self.dialect.key_type().to_string()),
            (INDEX_COLUMN.to_string(), "INT".to_string()),
        ];
        columns.extend(self.rows.column_defs().into_iter().map(|(name, kind)| {
            (name.to_string(), self.dialect.column_type(kind).to_string())
        }));
        manager.ensure_table(&self.child_table(), &columns, &[KEY_COLUMN, INDEX_COLUMN])
    }

    fn child_table(&self) -> String {
        format!("{}_{}", self.name, CHILD_SUFFIX)
    }

    fn main_table(&self) -> String {
        self.dialect.qualify(&self.schema, &self.name)
    }

    fn qualified_child(&self) -> String {
        self.dialect.qualify(&self.schema, &self.child_table())
    }

    fn row_present(&self, key_text: &str) -> Result<bool, StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        let rows = self.client.query(
            &format!(
                "SELECT {key_col} FROM {} WHERE {key_col} = ?",
                self.main_table()
            ),
            &[SqlValue::Text(key_text.to_string())],
        )?;
        Ok(!rows.is_empty())
    }

    fn fetch(&self, key_text: &str) -> Result<Option<Vec<C>>, StateBackendError> {
        if !self.row_present(key_text)? {
            return Ok(None);
        }
        let key_col = self.dialect.quote(KEY_COLUMN);
        let index_col = self.dialect.quote(INDEX_COLUMN);
        let select_list = self
            .rows
            .columns
            .iter()
            .map(|c| self.dialect.quote(c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self.client.query(
            &format!(
                "SELECT {select_list} FROM {} WHERE {key_col} = ? ORDER BY {index_col}",
                self.qualified_child()
            ),
            &[SqlValue::Text(key_text.to_string())],
        )?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let values: Vec<SqlValue> = self
                .rows
                .columns
                .iter()
                .map(|c| row.get(c.name).cloned().unwrap_or(SqlValue::Null))
                .collect();
            items.push(self.rows.from_values(&values)?);
        }
        Ok(Some(items))
    }

    fn key_texts(&self) -> Result<Vec<String>, StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        let rows = self.client.query(
            &format!("SELECT {key_col} FROM {}", self.main_table()),
            &[],
        )?;
        rows.iter()
            .map(|row| {
                row.get(KEY_COLUMN)
                    .ok_or_else(|| StateBackendError::Io("key column missing in result".into()))?
                    .as_text(KEY_COLUMN)
                    .map(str::to_string)
            })
            .collect()
    }

    fn parse_key(key_text: &str) -> Result<K, StateBackendError>
    where
        K: FromStr,
    {
        K::from_str(key_text).map_err(|_| {
            StateBackendError::Io(format!("stored key {key_text:?} cannot be parsed"))
        })
    }
}

impl<K, C> StateStore<K, Vec<C>> for SqlSequenceStore<K, C>
where
    K: Display + FromStr + Send + Sync,
    C: Default + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Result<Option<Vec<C>>, StateBackendError> {
        self.fetch(&key.to_string())
    }

    fn put(&self, key: K, value: Vec<C>) -> Result<(), StateBackendError> {
        let key_text = key.to_string();
        let key_col = self.dialect.quote(KEY_COLUMN);
        let index_col = self.dialect.quote(INDEX_COLUMN);
        if !self.row_present(&key_text)? {
            self.client.execute(
                &format!("INSERT INTO {} ({key_col}) VALUES (?)", self.main_table()),
                &[SqlValue::Text(key_text.clone())],
            )?;
        }
        self.client.execute(
            &format!(
                "DELETE FROM {} WHERE {key_col} = ?",
                self.qualified_child()
            ),
            &[SqlValue::Text(key_text.clone())],
        )?;
        let columns = std::iter::once(key_col.clone())
            .chain(std::iter::once(index_col.clone()))
            .chain(self.rows.columns.iter().map(|c| self.dialect.quote(c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = std::iter::repeat("?")
            .take(self.rows.columns.len() + 2)
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            self.qualified_child()
        );
        for (index, item) in value.iter().enumerate() {
            let mut params = vec![
                SqlValue::Text(key_text.clone()),
                SqlValue::Int(index as i64),
            ];
            params.extend(self.rows.to_values(item));
            self.client.execute(&insert, &params)?;
        }
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<Option<Vec<C>>, StateBackendError> {
        let key_text = key.to_string();
        let previous = self.fetch(&key_text)?;
        if previous.is_some() {
            let key_col = self.dialect.quote(KEY_COLUMN);
            self.client.execute(
                &format!(
                    "DELETE FROM {} WHERE {key_col} = ?",
                    self.qualified_child()
                ),
                &[SqlValue::Text(key_text.clone())],
            )?;
            self.client.execute(
                &format!("DELETE FROM {} WHERE {key_col} = ?", self.main_table()),
                &[SqlValue::Text(key_text)],
            )?;
        }
        Ok(previous)
    }

    fn contains_key(&self, key: &K) -> Result<bool, StateBackendError> {
        self.row_present(&key.to_string())
    }

    fn iter(&self) -> Result<StoreIter<'_, K, Vec<C>>, StateBackendError> {
        let keys = self.key_texts()?;
        Ok(Box::new(keys.into_iter().filter_map(move |key_text| {
            let key = match Self::parse_key(&key_text) {
                Ok(key) => key,
                Err(e) => return Some(Err(e)),
            };
            match self.fetch(&key_text) {
                Ok(Some(value)) => Some(Ok((key, value))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })))
    }

    fn keys(&self) -> Result<Vec<K>, StateBackendError> {
        self.key_texts()?
            .into_iter()
            .map(|key_text| Self::parse_key(&key_text))
            .collect()
    }
}
