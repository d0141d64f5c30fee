//! JSON-blob key/value store, `(key, value TEXT NULL)`.
//!
//! Values round-trip through `serde_json`; this is the store the CDC
//! checkpoints go into when they must survive restarts.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StateBackendError;
use crate::store::sql::object::KEY_COLUMN;
use crate::store::sql::schema::SchemaManager;
use crate::store::sql::{SchemaOptions, SqlClient, SqlDialect, SqlValue};
use crate::store::{StateStore, StoreIter};

const VALUE_COLUMN: &str = "value";

pub struct SqlKeyValueStore<V> {
    name: String,
    schema: String,
    client: Arc<dyn SqlClient>,
    dialect: SqlDialect,
    _value: PhantomData<fn(V)>,
}

impl<V> SqlKeyValueStore<V> {
    pub fn new(
        client: Arc<dyn SqlClient>,
        dialect: SqlDialect,
        schema: impl Into<String>,
        table: impl Into<String>,
        options: SchemaOptions,
    ) -> Result<Self, StateBackendError> {
        let store = Self {
            name: table.into(),
            schema: schema.into(),
            client,
            dialect,
            _value: PhantomData,
        };
        let manager = SchemaManager {
            client: &*store.client,
            dialect: store.dialect,
            schema: &store.schema,
            options: &options,
        };
        manager.ensure_schema()?;
        let value_type = match store.dialect {
            SqlDialect::SqlServer => "NVARCHAR(MAX) NULL",
            SqlDialect::Postgres => "TEXT NULL",
        };
        manager.ensure_table(
            &store.name,
            &[
                (KEY_COLUMN.to_string(), store.dialect.key_type().to_string()),
                (VALUE_COLUMN.to_string(), value_type.to_string()),
            ],
            &[KEY_COLUMN],
        )?;
        Ok(store)
    }

    fn table(&self) -> String {
        self.dialect.qualify(&self.schema, &self.name)
    }

    fn fetch_raw(&self, key: &str) -> Result<Option<String>, StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        let value_col = self.dialect.quote(VALUE_COLUMN);
        let rows = self.client.query(
            &format!(
                "SELECT {value_col} FROM {} WHERE {key_col} = ?",
                self.table()
            ),
            &[SqlValue::Text(key.to_string())],
        )?;
        match rows.into_iter().next() {
            Some(row) => match row.get(VALUE_COLUMN) {
                Some(SqlValue::Text(text)) => Ok(Some(text.clone())),
                Some(SqlValue::Null) | None => Ok(None),
                Some(other) => Err(StateBackendError::TypeMismatch {
                    column: VALUE_COLUMN.to_string(),
                    expected: "text",
                    got: other.kind_name(),
                }),
            },
            None => Ok(None),
        }
    }
}

impl<V> StateStore<String, V> for SqlKeyValueStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &String) -> Result<Option<V>, StateBackendError> {
        match self.fetch_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: String, value: V) -> Result<(), StateBackendError> {
        let raw = serde_json::to_string(&value)?;
        let key_col = self.dialect.quote(KEY_COLUMN);
        let value_col = self.dialect.quote(VALUE_COLUMN);
        let affected = self.client.execute(
            &format!(
                "UPDATE {} SET {value_col} = ? WHERE {key_col} = ?",
                self.table()
            ),
            &[SqlValue::Text(raw.clone()), SqlValue::Text(key.clone())],
        )?;
        if affected == 0 {
            self.client.execute(
                &format!(
                    "INSERT INTO {} ({key_col}, {value_col}) VALUES (?, ?)",
                    self.table()
                ),
                &[SqlValue::Text(key), SqlValue::Text(raw)],
            )?;
        }
        Ok(())
    }

    fn remove(&self, key: &String) -> Result<Option<V>, StateBackendError> {
        let previous = self.get(key)?;
        if previous.is_some() {
            let key_col = self.dialect.quote(KEY_COLUMN);
            self.client.execute(
                &format!("DELETE FROM {} WHERE {key_col} = ?", self.table()),
                &[SqlValue::Text(key.clone())],
            )?;
        }
        Ok(previous)
    }

    fn contains_key(&self, key: &String) -> Result<bool, StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        let rows = self.client.query(
            &format!(
                "SELECT {key_col} FROM {} WHERE {key_col} = ?",
                self.table()
            ),
            &[SqlValue::Text(key.clone())],
        )?;
        Ok(!rows.is_empty())
    }

    fn iter(&self) -> Result<StoreIter<'_, String, V>, StateBackendError> {
        let keys = self.keys()?;
        Ok(Box::new(keys.into_iter().filter_map(move |key| {
            match self.get(&key) {
                Ok(Some(value)) => Some(Ok((key, value))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })))
    }

    fn keys(&self) -> Result<Vec<String>, StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        let rows = self
            .client
            .query(&format!("SELECT {key_col} FROM {}", self.table()), &[])?;
        rows.iter()
            .map(|row| {
                row.get(KEY_COLUMN)
                    .ok_or_else(|| StateBackendError::Io("key column missing in result".into()))?
                    .as_text(KEY_COLUMN)
                    .map(str::to_string)
            })
            .collect()
    }
}
