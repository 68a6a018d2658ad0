use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Arguments, Column, Row, TypeInfo};
use tracing::info;

use crate::actions::{Action, ActionContext, TaskContext};
use crate::error::{Error, Result};

/// SQL action against a named data source. The statement is
/// template-expanded; positional parameters bind with their JSON types.
pub struct DbClientAction;

#[async_trait]
impl Action for DbClientAction {
    fn name(&self) -> &str {
        "db_client"
    }

    fn description(&self) -> &str {
        "Run a SQL query or statement against a named data source"
    }

    async fn run(&self, ctx: &ActionContext<'_>, task: &TaskContext<'_>) -> Result<Value> {
        let datasource = task
            .get("datasource")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config("db_client requires 'datasource' parameter".to_string()))?;

        let sql = task
            .get("sql")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config("db_client requires 'sql' parameter".to_string()))?;
        let sql = ctx.expand(sql);

        let operation = task
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("query");

        let params: Vec<Value> = task
            .get("params")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let pool = ctx.datasources.get_sql(datasource).await?;

        info!(datasource, operation, %sql, "Executing SQL");

        match operation {
            "query" => execute_query(&pool, &sql, &params).await,
            "exec" => execute_exec(&pool, &sql, &params).await,
            other => Err(Error::Config(format!(
                "unsupported operation type: {}",
                other
            ))),
        }
    }
}

async fn execute_query(pool: &AnyPool, sql: &str, params: &[Value]) -> Result<Value> {
    let args = bind_params(params)?;
    let rows: Vec<AnyRow> = sqlx::query_with(sql, args).fetch_all(pool).await?;

    let json_rows: Vec<Value> = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
    let count = json_rows.len();

    Ok(json!({
        "rows": json_rows,
        "count": count,
    }))
}

async fn execute_exec(pool: &AnyPool, sql: &str, params: &[Value]) -> Result<Value> {
    let args = bind_params(params)?;
    let result = sqlx::query_with(sql, args).execute(pool).await?;

    let mut output = Map::new();
    output.insert("rows_affected".to_string(), json!(result.rows_affected()));
    // Absent when the dialect cannot report one.
    if let Some(id) = result.last_insert_id() {
        output.insert("last_insert_id".to_string(), json!(id));
    }
    Ok(Value::Object(output))
}

/// Bind typed JSON parameters to an sqlx arguments buffer.
fn bind_params(params: &[Value]) -> Result<sqlx::any::AnyArguments<'_>> {
    let mut args = sqlx::any::AnyArguments::default();
    for (i, param) in params.iter().enumerate() {
        match param {
            Value::String(s) => args
                .add(s.as_str())
                .map_err(|e| Error::Datasource(format!("failed to bind param {}: {}", i, e)))?,
            Value::Number(n) => {
                if let Some(int_val) = n.as_i64() {
                    args.add(int_val)
                        .map_err(|e| Error::Datasource(format!("failed to bind param {}: {}", i, e)))?;
                } else if let Some(float_val) = n.as_f64() {
                    args.add(float_val)
                        .map_err(|e| Error::Datasource(format!("failed to bind param {}: {}", i, e)))?;
                }
            }
            Value::Bool(b) => args
                .add(*b)
                .map_err(|e| Error::Datasource(format!("failed to bind param {}: {}", i, e)))?,
            Value::Null => args
                .add(None::<String>)
                .map_err(|e| Error::Datasource(format!("failed to bind param {}: {}", i, e)))?,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported param type at index {}: arrays/objects cannot be bound as SQL parameters",
                    i
                )));
            }
        }
    }
    Ok(args)
}

/// Convert a row to a JSON object by inspecting column types at runtime.
fn row_to_json(row: &AnyRow) -> Result<Value> {
    let mut map = Map::new();

    for col in row.columns() {
        let name = col.name().to_string();
        let type_name = col.type_info().name();

        let value: Value = match type_name {
            "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" | "SMALLINT" => {
                match row.try_get::<i64, _>(col.ordinal()) {
                    Ok(v) => json!(v),
                    Err(_) => Value::Null,
                }
            }
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "NUMERIC" => {
                match row.try_get::<f64, _>(col.ordinal()) {
                    Ok(v) => json!(v),
                    Err(_) => Value::Null,
                }
            }
            "BOOLEAN" | "BOOL" => match row.try_get::<bool, _>(col.ordinal()) {
                Ok(v) => json!(v),
                Err(_) => Value::Null,
            },
            _ => {
                // Default: try as string (TEXT, VARCHAR, etc.)
                match row.try_get::<String, _>(col.ordinal()) {
                    Ok(v) => Value::String(v),
                    Err(_) => Value::Null,
                }
            }
        };

        map.insert(name, value);
    }

    Ok(Value::Object(map))
}
