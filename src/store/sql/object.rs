//! Descriptor-driven SQL object store.
//!
//! One row per key in the main table, one child table per sequence field
//! named `<table>_<field>` with `(key, item_index, ...)` rows. `put` upserts
//! the main row, then deletes and re-inserts the children in order, so a
//! repeated `put` never duplicates child rows.

use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StateBackendError;
use crate::store::sql::schema::SchemaManager;
use crate::store::sql::{
    EntityLayout, SchemaOptions, SqlClient, SqlDialect, SqlEntity, SqlValue,
};
use crate::store::{StateStore, StoreIter};

pub(crate) const KEY_COLUMN: &str = "key";
pub(crate) const INDEX_COLUMN: &str = "item_index";

pub struct SqlObjectStore<K, V: SqlEntity> {
    name: String,
    schema: String,
    client: Arc<dyn SqlClient>,
    dialect: SqlDialect,
    layout: EntityLayout<V>,
    _key: PhantomData<fn(K)>,
}

impl<K, V: SqlEntity> SqlObjectStore<K, V> {
    /// Build the store and align the schema. The `table` doubles as the
    /// store name.
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
            layout: V::layout(),
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

        let mut columns = vec![(KEY_COLUMN.to_string(), self.dialect.key_type().to_string())];
        columns.extend(self.layout.scalars.iter().map(|f| {
            (
                f.name.to_string(),
                self.dialect.column_type(f.kind).to_string(),
            )
        }));
        manager.ensure_table(&self.name, &columns, &[KEY_COLUMN])?;

        for child in &self.layout.children {
            let mut columns = vec![
                (KEY_COLUMN.to_string(), self.dialect.key_type().to_string()),
                ("item_index".to_string(), "INT".to_string()),
            ];
            columns.extend(child.columns.iter().map(|(name, kind)| {
                (name.to_string(), self.dialect.column_type(*kind).to_string())
            }));
            manager.ensure_table(
                &self.child_table(child.name),
                &columns,
                &[KEY_COLUMN, INDEX_COLUMN],
            )?;
        }
        Ok(())
    }

    fn child_table(&self, field: &str) -> String {
        format!("{}_{}", self.name, field)
    }

    fn main_table(&self) -> String {
        self.dialect.qualify(&self.schema, &self.name)
    }

    fn upsert_main(&self, key_text: &str, value: &V) -> Result<(), StateBackendError> {
        let table = self.main_table();
        let key_col = self.dialect.quote(KEY_COLUMN);
        if self.layout.scalars.is_empty() {
            let present = self.client.query(
                &format!("SELECT {key_col} FROM {table} WHERE {key_col} = ?"),
                &[SqlValue::Text(key_text.to_string())],
            )?;
            if present.is_empty() {
                self.client.execute(
                    &format!("INSERT INTO {table} ({key_col}) VALUES (?)"),
                    &[SqlValue::Text(key_text.to_string())],
                )?;
            }
            return Ok(());
        }

        let assignments = self
            .layout
            .scalars
            .iter()
            .map(|f| format!("{} = ?", self.dialect.quote(f.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params: Vec<SqlValue> =
            self.layout.scalars.iter().map(|f| (f.get)(value)).collect();
        params.push(SqlValue::Text(key_text.to_string()));
        let affected = self.client.execute(
            &format!("UPDATE {table} SET {assignments} WHERE {key_col} = ?"),
            &params,
        )?;
        if affected == 0 {
            let columns = std::iter::once(key_col.clone())
                .chain(self.layout.scalars.iter().map(|f| self.dialect.quote(f.name)))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = std::iter::repeat("?")
                .take(self.layout.scalars.len() + 1)
                .collect::<Vec<_>>()
                .join(", ");
            let mut params = vec![SqlValue::Text(key_text.to_string())];
            params.extend(self.layout.scalars.iter().map(|f| (f.get)(value)));
            self.client.execute(
                &format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})"),
                &params,
            )?;
        }
        Ok(())
    }

    fn replace_children(&self, key_text: &str, value: &V) -> Result<(), StateBackendError> {
        for child in &self.layout.children {
            let table = self.dialect.qualify(&self.schema, &self.child_table(child.name));
            let key_col = self.dialect.quote(KEY_COLUMN);
            let index_col = self.dialect.quote(INDEX_COLUMN);
            self.client.execute(
                &format!("DELETE FROM {table} WHERE {key_col} = ?"),
                &[SqlValue::Text(key_text.to_string())],
            )?;
            let columns = std::iter::once(key_col.clone())
                .chain(std::iter::once(index_col.clone()))
                .chain(child.columns.iter().map(|(name, _)| self.dialect.quote(name)))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = std::iter::repeat("?")
                .take(child.columns.len() + 2)
                .collect::<Vec<_>>()
                .join(", ");
            let insert = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");
            for (index, row) in (child.get)(value).into_iter().enumerate() {
                let mut params = vec![
                    SqlValue::Text(key_text.to_string()),
                    SqlValue::Int(index as i64),
                ];
                params.extend(row);
                self.client.execute(&insert, &params)?;
            }
        }
        Ok(())
    }

    fn fetch(&self, key_text: &str) -> Result<Option<V>, StateBackendError> {
        let table = self.main_table();
        let key_col = self.dialect.quote(KEY_COLUMN);
        let select_list = if self.layout.scalars.is_empty() {
            key_col.clone()
        } else {
            self.layout
                .scalars
                .iter()
                .map(|f| self.dialect.quote(f.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let rows = self.client.query(
            &format!("SELECT {select_list} FROM {table} WHERE {key_col} = ?"),
            &[SqlValue::Text(key_text.to_string())],
        )?;
        let Some(main) = rows.into_iter().next() else {
            return Ok(None);
        };

        let mut value = V::default();
        for field in &self.layout.scalars {
            let column = main
                .get(field.name)
                .cloned()
                .unwrap_or(SqlValue::Null);
            (field.set)(&mut value, &column)?;
        }
        for child in &self.layout.children {
            let table = self.dialect.qualify(&self.schema, &self.child_table(child.name));
            let index_col = self.dialect.quote(INDEX_COLUMN);
            let select_list = child
                .columns
                .iter()
                .map(|(name, _)| self.dialect.quote(name))
                .collect::<Vec<_>>()
                .join(", ");
            let rows = self.client.query(
                &format!(
                    "SELECT {select_list} FROM {table} WHERE {key_col} = ? ORDER BY {index_col}"
                ),
                &[SqlValue::Text(key_text.to_string())],
            )?;
            let raw: Vec<Vec<SqlValue>> = rows
                .into_iter()
                .map(|row| {
                    child
                        .columns
                        .iter()
                        .map(|(name, _)| row.get(name).cloned().unwrap_or(SqlValue::Null))
                        .collect()
                })
                .collect();
            (child.set)(&mut value, raw)?;
        }
        Ok(Some(value))
    }

    fn delete(&self, key_text: &str) -> Result<(), StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        for child in &self.layout.children {
            let table = self.dialect.qualify(&self.schema, &self.child_table(child.name));
            self.client.execute(
                &format!("DELETE FROM {table} WHERE {key_col} = ?"),
                &[SqlValue::Text(key_text.to_string())],
            )?;
        }
        self.client.execute(
            &format!("DELETE FROM {} WHERE {key_col} = ?", self.main_table()),
            &[SqlValue::Text(key_text.to_string())],
        )?;
        Ok(())
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
}

impl<K, V> StateStore<K, V> for SqlObjectStore<K, V>
where
    K: Display + FromStr + Send + Sync,
    V: SqlEntity,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Result<Option<V>, StateBackendError> {
        self.fetch(&key.to_string())
    }

    fn put(&self, key: K, value: V) -> Result<(), StateBackendError> {
        let key_text = key.to_string();
        self.upsert_main(&key_text, &value)?;
        self.replace_children(&key_text, &value)
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StateBackendError> {
        let key_text = key.to_string();
        let previous = self.fetch(&key_text)?;
        if previous.is_some() {
            self.delete(&key_text)?;
        }
        Ok(previous)
    }

    fn contains_key(&self, key: &K) -> Result<bool, StateBackendError> {
        let key_col = self.dialect.quote(KEY_COLUMN);
        let rows = self.client.query(
            &format!(
                "SELECT {key_col} FROM {} WHERE {key_col} = ?",
                self.main_table()
            ),
            &[SqlValue::Text(key.to_string())],
        )?;
        Ok(!rows.is_empty())
    }

    fn iter(&self) -> Result<StoreIter<'_, K, V>, StateBackendError> {
        let keys = self.key_texts()?;
        Ok(Box::new(keys.into_iter().filter_map(move |key_text| {
            let key = match K::from_str(&key_text) {
                Ok(key) => key,
                Err(_) => {
                    return Some(Err(StateBackendError::Io(format!(
                        "stored key {key_text:?} cannot be parsed"
                    ))))
                }
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
            .map(|key_text| {
                K::from_str(&key_text).map_err(|_| {
                    StateBackendError::Io(format!("stored key {key_text:?} cannot be parsed"))
                })
            })
            .collect()
    }
}
