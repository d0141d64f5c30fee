use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use rillflow::error::StateBackendError;
use rillflow::store::sql::{
    ChildDescriptor, EntityLayout, FieldDescriptor, FieldKind, RowDescriptor, SchemaOptions,
    SqlClient, SqlDialect, SqlEntity, SqlKeyValueStore, SqlObjectStore, SqlRow, SqlSequenceStore,
    SqlValue,
};
use rillflow::store::StateStore;

// ---------------------------------------------------------------------------
// A fake SQL executor understanding exactly the statement shapes the stores
// generate (Postgres dialect). Enough of an engine to test round-trips.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<HashMap<String, SqlValue>>,
}

#[derive(Default)]
struct FakeDb {
    tables: Mutex<HashMap<String, Table>>,
}

impl FakeDb {
    fn seed_table(&self, name: &str, columns: &[&str]) {
        self.tables.lock().insert(
            name.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    fn row_count(&self, name: &str) -> usize {
        self.tables
            .lock()
            .get(name)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    fn columns(&self, name: &str) -> Vec<String> {
        self.tables
            .lock()
            .get(name)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }
}

fn bad(sql: &str) -> StateBackendError {
    StateBackendError::Io(format!("fake db cannot run: {sql}"))
}

impl SqlClient for FakeDb {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StateBackendError> {
        let sql = sql.replace('"', "");
        let mut tables = self.tables.lock();

        if sql.starts_with("CREATE SCHEMA") {
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            let (name, tail) = rest.split_once(" (").ok_or_else(|| bad(&sql))?;
            let inner = tail.strip_suffix(')').unwrap_or(tail);
            let cols_part = inner.split(", PRIMARY KEY").next().unwrap_or(inner);
            let columns = cols_part
                .split(", ")
                .filter_map(|c| c.split_whitespace().next())
                .map(str::to_string)
                .collect();
            tables.insert(
                name.to_string(),
                Table {
                    columns,
                    rows: Vec::new(),
                },
            );
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
            let (name, tail) = rest.split_once(" ADD ").ok_or_else(|| bad(&sql))?;
            let column = tail.split_whitespace().next().ok_or_else(|| bad(&sql))?;
            tables
                .get_mut(name)
                .ok_or_else(|| bad(&sql))?
                .columns
                .push(column.to_string());
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("UPDATE ") {
            let (name, tail) = rest.split_once(" SET ").ok_or_else(|| bad(&sql))?;
            let (assignments, where_part) =
                tail.split_once(" WHERE ").ok_or_else(|| bad(&sql))?;
            let columns: Vec<&str> = assignments
                .split(", ")
                .filter_map(|a| a.split(" = ").next())
                .collect();
            let where_col = where_part.split(" = ").next().ok_or_else(|| bad(&sql))?;
            let key = params.last().ok_or_else(|| bad(&sql))?;
            let table = tables.get_mut(name).ok_or_else(|| bad(&sql))?;
            let mut affected = 0;
            for row in table.rows.iter_mut() {
                if row.get(where_col) == Some(key) {
                    for (column, value) in columns.iter().zip(params) {
                        row.insert(column.to_string(), value.clone());
                    }
                    affected += 1;
                }
            }
            return Ok(affected);
        }
        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let (name, tail) = rest.split_once(" (").ok_or_else(|| bad(&sql))?;
            let (cols_part, _) = tail.split_once(')').ok_or_else(|| bad(&sql))?;
            let row: HashMap<String, SqlValue> = cols_part
                .split(", ")
                .zip(params)
                .map(|(c, v)| (c.to_string(), v.clone()))
                .collect();
            tables.get_mut(name).ok_or_else(|| bad(&sql))?.rows.push(row);
            return Ok(1);
        }
        if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let (name, where_part) = rest.split_once(" WHERE ").ok_or_else(|| bad(&sql))?;
            let where_col = where_part.split(" = ").next().ok_or_else(|| bad(&sql))?;
            let key = params.first().ok_or_else(|| bad(&sql))?;
            let table = tables.get_mut(name).ok_or_else(|| bad(&sql))?;
            let before = table.rows.len();
            table.rows.retain(|row| row.get(where_col) != Some(key));
            return Ok((before - table.rows.len()) as u64);
        }
        Err(bad(&sql))
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, StateBackendError> {
        let sql = sql.replace('"', "");
        let tables = self.tables.lock();

        if sql.starts_with("SELECT column_name FROM information_schema.columns") {
            let schema = params[0].as_text("table_schema")?;
            let table = params[1].as_text("table_name")?;
            let name = format!("{schema}.{table}");
            return Ok(tables
                .get(&name)
                .map(|t| {
                    t.columns
                        .iter()
                        .map(|c| {
                            SqlRow::new(
                                vec!["column_name".to_string()],
                                vec![SqlValue::Text(c.clone())],
                            )
                        })
                        .collect()
                })
                .unwrap_or_default());
        }

        let rest = sql.strip_prefix("SELECT ").ok_or_else(|| bad(&sql))?;
        let (select_list, tail) = rest.split_once(" FROM ").ok_or_else(|| bad(&sql))?;
        let (name, clauses) = match tail.split_once(' ') {
            Some((name, clauses)) => (name, clauses),
            None => (tail, ""),
        };
        let table = tables.get(name).ok_or_else(|| bad(&sql))?;

        let mut rows: Vec<HashMap<String, SqlValue>> = table.rows.clone();
        if let Some(where_tail) = clauses.strip_prefix("WHERE ") {
            let (condition, order) = match where_tail.split_once(" ORDER BY ") {
                Some((condition, order)) => (condition, Some(order)),
                None => (where_tail, None),
            };
            let where_col = condition.split(" = ").next().ok_or_else(|| bad(&sql))?;
            let key = params.first().ok_or_else(|| bad(&sql))?;
            rows.retain(|row| row.get(where_col) == Some(key));
            if let Some(order_col) = order {
                rows.sort_by_key(|row| {
                    row.get(order_col)
                        .and_then(|v| v.as_i64(order_col).ok())
                        .unwrap_or(0)
                });
            }
        }

        let columns: Vec<String> = select_list.split(", ").map(str::to_string).collect();
        Ok(rows
            .into_iter()
            .map(|row| {
                let values = columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(SqlValue::Null))
                    .collect();
                SqlRow::new(columns.clone(), values)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Test entities
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq)]
struct Order {
    id: i64,
    customer: String,
    paid: bool,
    lines: Vec<OrderLine>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct OrderLine {
    sku: String,
    qty: i64,
}

fn line_rows() -> RowDescriptor<OrderLine> {
    RowDescriptor::new(vec![
        FieldDescriptor {
            name: "sku",
            kind: FieldKind::Text,
            get: |l| SqlValue::Text(l.sku.clone()),
            set: |l, v| {
                l.sku = v.as_text("sku")?.to_string();
                Ok(())
            },
        },
        FieldDescriptor {
            name: "qty",
            kind: FieldKind::Long,
            get: |l| SqlValue::Int(l.qty),
            set: |l, v| {
                l.qty = v.as_i64("qty")?;
                Ok(())
            },
        },
    ])
}

impl SqlEntity for Order {
    fn layout() -> EntityLayout<Self> {
        EntityLayout {
            scalars: vec![
                FieldDescriptor {
                    name: "id",
                    kind: FieldKind::Long,
                    get: |o| SqlValue::Int(o.id),
                    set: |o, v| {
                        o.id = v.as_i64("id")?;
                        Ok(())
                    },
                },
                FieldDescriptor {
                    name: "customer",
                    kind: FieldKind::Text,
                    get: |o| SqlValue::Text(o.customer.clone()),
                    set: |o, v| {
                        o.customer = v.as_text("customer")?.to_string();
                        Ok(())
                    },
                },
                FieldDescriptor {
                    name: "paid",
                    kind: FieldKind::Bool,
                    get: |o| SqlValue::Bool(o.paid),
                    set: |o, v| {
                        o.paid = v.as_bool("paid")?;
                        Ok(())
                    },
                },
            ],
            children: vec![ChildDescriptor::of_rows(
                "lines",
                line_rows(),
                |o| &o.lines,
                |o, lines| o.lines = lines,
            )],
        }
    }
}

fn sample_order() -> Order {
    Order {
        id: 42,
        customer: "ada".to_string(),
        paid: true,
        lines: vec![
            OrderLine {
                sku: "widget".to_string(),
                qty: 3,
            },
            OrderLine {
                sku: "gadget".to_string(),
                qty: 1,
            },
        ],
    }
}

fn object_store(db: &Arc<FakeDb>) -> SqlObjectStore<String, Order> {
    SqlObjectStore::new(
        db.clone() as Arc<dyn SqlClient>,
        SqlDialect::Postgres,
        "state",
        "orders",
        SchemaOptions::default(),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------

#[test]
fn object_store_round_trips_nested_sequences() {
    let db = Arc::new(FakeDb::default());
    let store = object_store(&db);

    let order = sample_order();
    store.put("o-1".to_string(), order.clone()).unwrap();
    assert_eq!(store.get(&"o-1".to_string()).unwrap(), Some(order));
    assert!(store.contains_key(&"o-1".to_string()).unwrap());
    assert_eq!(store.get(&"missing".to_string()).unwrap(), None);
}

#[test]
fn repeated_put_leaves_no_duplicate_children() {
    let db = Arc::new(FakeDb::default());
    let store = object_store(&db);

    let order = sample_order();
    store.put("o-1".to_string(), order.clone()).unwrap();
    store.put("o-1".to_string(), order.clone()).unwrap();

    assert_eq!(db.row_count("state.orders"), 1);
    assert_eq!(db.row_count("state.orders_lines"), order.lines.len());
    assert_eq!(store.get(&"o-1".to_string()).unwrap(), Some(order));
}

#[test]
fn object_store_remove_clears_main_and_children() {
    let db = Arc::new(FakeDb::default());
    let store = object_store(&db);

    store.put("o-1".to_string(), sample_order()).unwrap();
    let removed = store.remove(&"o-1".to_string()).unwrap();
    assert_eq!(removed, Some(sample_order()));
    assert_eq!(store.get(&"o-1".to_string()).unwrap(), None);
    assert_eq!(db.row_count("state.orders"), 0);
    assert_eq!(db.row_count("state.orders_lines"), 0);
}

#[test]
fn object_store_enumerates_keys_and_entries() {
    let db = Arc::new(FakeDb::default());
    let store = object_store(&db);

    store.put("a".to_string(), sample_order()).unwrap();
    let mut other = sample_order();
    other.id = 7;
    store.put("b".to_string(), other).unwrap();

    let keys: Vec<String> = store.keys().unwrap().into_iter().sorted().collect();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

    let ids: Vec<i64> = store
        .iter()
        .unwrap()
        .map(|entry| entry.unwrap().1.id)
        .sorted()
        .collect();
    assert_eq!(ids, vec![7, 42]);
}

#[test]
fn missing_columns_are_added_when_allowed() {
    let db = Arc::new(FakeDb::default());
    // a previous deployment created the table without the `paid` column
    db.seed_table("state.orders", &["key", "id", "customer"]);
    db.seed_table("state.orders_lines", &["key", "item_index", "sku", "qty"]);

    let _store = object_store(&db);
    assert!(db.columns("state.orders").contains(&"paid".to_string()));
}

#[test]
fn missing_columns_fail_when_column_add_is_disabled() {
    let db = Arc::new(FakeDb::default());
    db.seed_table("state.orders", &["key", "id", "customer"]);

    let result = SqlObjectStore::<String, Order>::new(
        db.clone() as Arc<dyn SqlClient>,
        SqlDialect::Postgres,
        "state",
        "orders",
        SchemaOptions {
            allow_column_add: false,
        },
    );
    assert!(matches!(
        result,
        Err(StateBackendError::SchemaMissing { .. })
    ));
}

#[test]
fn sequence_store_round_trips_item_lists() {
    let db = Arc::new(FakeDb::default());
    let store: SqlSequenceStore<String, OrderLine> = SqlSequenceStore::new(
        db.clone() as Arc<dyn SqlClient>,
        SqlDialect::Postgres,
        "state",
        "carts",
        line_rows(),
        SchemaOptions::default(),
    )
    .unwrap();

    let lines = vec![
        OrderLine {
            sku: "a".to_string(),
            qty: 1,
        },
        OrderLine {
            sku: "b".to_string(),
            qty: 2,
        },
    ];
    store.put("cart".to_string(), lines.clone()).unwrap();
    assert_eq!(store.get(&"cart".to_string()).unwrap(), Some(lines.clone()));

    // rewriting a shorter list truncates the child table
    store
        .put("cart".to_string(), lines[..1].to_vec())
        .unwrap();
    assert_eq!(db.row_count("state.carts_Child"), 1);
    assert_eq!(
        store.get(&"cart".to_string()).unwrap(),
        Some(lines[..1].to_vec())
    );
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cursor {
    position: String,
    committed: bool,
}

#[test]
fn kv_store_round_trips_json_values() {
    let db = Arc::new(FakeDb::default());
    let store: SqlKeyValueStore<Cursor> = SqlKeyValueStore::new(
        db.clone() as Arc<dyn SqlClient>,
        SqlDialect::Postgres,
        "state",
        "checkpoints",
        SchemaOptions::default(),
    )
    .unwrap();

    let cursor = Cursor {
        position: "00A1".to_string(),
        committed: true,
    };
    store.put("src.table.position".to_string(), cursor.clone()).unwrap();
    assert_eq!(
        store.get(&"src.table.position".to_string()).unwrap(),
        Some(cursor.clone())
    );

    // update in place, no duplicate row
    let moved = Cursor {
        position: "00B2".to_string(),
        committed: false,
    };
    store.put("src.table.position".to_string(), moved.clone()).unwrap();
    assert_eq!(db.row_count("state.checkpoints"), 1);
    assert_eq!(
        store.get(&"src.table.position".to_string()).unwrap(),
        Some(moved)
    );

    assert_eq!(
        store.keys().unwrap(),
        vec!["src.table.position".to_string()]
    );
    assert_eq!(store.remove(&"src.table.position".to_string()).unwrap().is_some(), true);
    assert_eq!(store.get(&"src.table.position".to_string()).unwrap(), None);
}
