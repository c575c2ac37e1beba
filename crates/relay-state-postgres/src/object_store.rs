//! Object store over user tables.
//!
//! Every business object maps to a table named after its ID; schemas live in
//! `relay_object_types`. Rows travel as JSON (`to_jsonb`), and condition
//! values are compared in JSON form so one query shape serves every column
//! type.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::Row;
use tracing::{debug, warn};

use relay_core::{
    domain::ports::{Condition, ObjectStore, ObjectType, RecordQuery, TransactionHandle},
    CoreError,
};

use crate::errors::map_sqlx_error;
use crate::PostgresConnection;

/// Quote an SQL identifier
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `SELECT` for a record query; returns the SQL and the JSON parameters in bind order
pub(crate) fn find_sql(query: &RecordQuery) -> (String, Vec<Value>) {
    let mut sql = format!(
        "SELECT to_jsonb(t) AS row FROM {} AS t",
        quote_ident(&query.object)
    );
    let mut params = Vec::with_capacity(query.conditions.len());
    for (i, condition) in query.conditions.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        let n = params.len() + 1;
        match condition {
            Condition::Eq { column, value } => {
                sql.push_str(&format!("to_jsonb(t)->'{}' = ${}::jsonb", escape_key(column), n));
                params.push(value.clone());
            }
            Condition::In { column, values } => {
                sql.push_str(&format!(
                    "to_jsonb(t)->'{}' IN (SELECT jsonb_array_elements(${}::jsonb))",
                    escape_key(column),
                    n
                ));
                params.push(Value::Array(values.clone()));
            }
        }
    }
    (sql, params)
}

/// `UPDATE` of one row by primary key; binds `$1` = new values, `$2` = key
pub(crate) fn update_sql(table: &str, primary_key: &str, columns: &[&String]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| format!("{0} = src.{0}", quote_ident(c)))
        .collect();
    format!(
        "UPDATE {table} AS t SET {sets} \
         FROM jsonb_populate_record(NULL::{table}, $1::jsonb) AS src \
         WHERE to_jsonb(t)->'{pk}' = $2::jsonb \
         RETURNING to_jsonb(t) AS row",
        table = quote_ident(table),
        sets = assignments.join(", "),
        pk = escape_key(primary_key),
    )
}

fn escape_key(key: &str) -> String {
    key.replace('\'', "''")
}

/// Stored procedure result text as JSON; plain text stays a string
fn procedure_result(text: Option<String>) -> Value {
    match text {
        None => Value::Null,
        Some(text) if text.is_empty() => Value::Null,
        Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
    }
}

/// Postgres implementation of the ObjectStore
#[derive(Clone)]
pub struct PostgresObjectStore {
    conn: PostgresConnection,
}

impl PostgresObjectStore {
    /// Create a new Postgres object store
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }

    /// Register or replace an object schema
    pub async fn define(&self, object: &ObjectType) -> Result<(), CoreError> {
        let schema = serde_json::to_value(object)?;
        sqlx::query(
            "INSERT INTO relay_object_types (id, schema) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET schema = $2",
        )
        .bind(&object.id)
        .bind(&schema)
        .execute(self.conn.pool())
        .await
        .map_err(|e| map_sqlx_error("define object", e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for PostgresObjectStore {
    async fn object_type(&self, object_id: &str) -> Result<Option<ObjectType>, CoreError> {
        let row = sqlx::query("SELECT schema FROM relay_object_types WHERE id = $1")
            .bind(object_id)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("find object type", e))?;
        match row {
            Some(row) => {
                let schema: Value = row
                    .try_get("schema")
                    .map_err(|e| map_sqlx_error("read object type", e))?;
                Ok(Some(serde_json::from_value(schema)?))
            }
            None => Ok(None),
        }
    }

    async fn find<'a>(
        &self,
        query: &RecordQuery,
        tx: Option<&'a TransactionHandle>,
    ) -> Result<Vec<Value>, CoreError> {
        let (sql, params) = find_sql(query);
        debug!(object = %query.object, transaction = ?tx, "Finding rows");
        let mut statement = sqlx::query(&sql);
        for param in &params {
            statement = statement.bind(param);
        }
        let rows = statement
            .fetch_all(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("find rows", e))?;
        rows.iter()
            .map(|row| row.try_get::<Value, _>("row").map_err(|e| map_sqlx_error("read row", e)))
            .collect()
    }

    async fn update<'a>(
        &self,
        object_id: &str,
        id: &Value,
        values: &Map<String, Value>,
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError> {
        let object = self.object_type(object_id).await?.ok_or_else(|| {
            CoreError::StateStoreError(format!("No object type {}", object_id))
        })?;
        let columns: Vec<&String> = values.keys().collect();
        if columns.is_empty() {
            warn!(object = object_id, id = %id, "Update with no values");
            let query = RecordQuery::all(&object.id).with(Condition::Eq {
                column: object.primary_key.clone(),
                value: id.clone(),
            });
            return self.find(&query, None).await?.into_iter().next().ok_or_else(|| {
                CoreError::StateStoreError(format!("No {} row with key {}", object_id, id))
            });
        }
        let sql = update_sql(&object.id, &object.primary_key, &columns);
        let row = sqlx::query(&sql)
            .bind(Value::Object(values.clone()))
            .bind(id)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("update row", e))?
            .ok_or_else(|| {
                CoreError::StateStoreError(format!("No {} row with key {}", object_id, id))
            })?;
        row.try_get::<Value, _>("row")
            .map_err(|e| map_sqlx_error("read updated row", e))
    }

    async fn call_procedure<'a>(
        &self,
        name: &str,
        args: &[Value],
        _tx: Option<&'a TransactionHandle>,
    ) -> Result<Value, CoreError> {
        let placeholders: Vec<String> = (1..=args.len()).map(|n| format!("${}::jsonb", n)).collect();
        let sql = format!(
            "SELECT {}({})::text AS result",
            quote_ident(name),
            placeholders.join(", ")
        );
        let mut statement = sqlx::query(&sql);
        for arg in args {
            statement = statement.bind(arg);
        }
        // A duplicate-key violation inside the procedure maps to AlreadyExists.
        let row = statement
            .fetch_one(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error(name, e))?;
        let text: Option<String> = row
            .try_get("result")
            .map_err(|e| map_sqlx_error("read procedure result", e))?;
        Ok(procedure_result(text))
    }
}
