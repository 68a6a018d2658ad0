use std::time::Duration;

use async_trait::async_trait;
use mlua::prelude::*;
use serde_json::{Map, Value};
use tracing::info;

use crate::actions::{Action, ActionContext, TaskContext};
use crate::error::{Error, Result};

/// Embedded-script action. Each evaluation gets a fresh sandboxed Lua VM
/// with `nsq_message`, `workflow_vars`, `previous_output`, and a `log()`
/// bridge in scope; no state survives across invocations.
pub struct ScriptAction;

#[async_trait]
impl Action for ScriptAction {
    fn name(&self) -> &str {
        "script"
    }

    fn description(&self) -> &str {
        "Evaluate inline Lua with the message, vars, and previous output in scope"
    }

    async fn run(&self, ctx: &ActionContext<'_>, task: &TaskContext<'_>) -> Result<Value> {
        let code = task
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config("script requires 'code' parameter".to_string()))?
            .to_string();

        let timeout_s = task
            .get("timeout")
            .and_then(|v| v.as_f64())
            .unwrap_or(30.0);

        let message = serde_json::to_value(ctx.message)?;
        let vars = Value::Object(ctx.vars.clone());
        let previous = ctx.previous_output.clone();

        info!("Evaluating script");

        // Evaluation is synchronous; run it off the async workers and bound
        // it with the script's own deadline.
        let eval = tokio::task::spawn_blocking(move || evaluate(&code, &message, &vars, &previous));
        match tokio::time::timeout(Duration::from_secs_f64(timeout_s), eval).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Script(format!("script task failed: {}", join_err))),
            Err(_) => Err(Error::Script(format!(
                "script evaluation exceeded {}s",
                timeout_s
            ))),
        }
    }
}

fn evaluate(code: &str, message: &Value, vars: &Value, previous: &Value) -> Result<Value> {
    let lua = Lua::new();
    let globals = lua.globals();

    // Sandbox: remove dangerous modules
    for name in &["os", "io", "debug", "loadfile", "dofile"] {
        globals.set(*name, LuaValue::Nil)?;
    }

    globals.set("nsq_message", json_to_lua(&lua, message)?)?;
    globals.set("workflow_vars", json_to_lua(&lua, vars)?)?;
    globals.set("previous_output", json_to_lua(&lua, previous)?)?;

    let log_fn = lua.create_function(|_, msg: LuaValue| {
        match msg {
            LuaValue::String(s) => info!(target: "nsa::script", "{}", s.to_string_lossy()),
            other => info!(target: "nsa::script", "{:?}", other),
        }
        Ok(())
    })?;
    globals.set("log", log_fn)?;

    let result: LuaValue = lua
        .load(code)
        .set_name("<script>")
        .eval()
        .map_err(|e| Error::Script(format!("evaluation failed: {}", e)))?;

    lua_result_to_json(&result)
}

/// Structured results keep their native form; scalars come back as text.
fn lua_result_to_json(value: &LuaValue) -> Result<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Table(_) => lua_to_json(value),
        LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        LuaValue::Boolean(b) => Ok(Value::String(b.to_string())),
        LuaValue::Integer(i) => Ok(Value::String(i.to_string())),
        LuaValue::Number(n) => Ok(Value::String(n.to_string())),
        other => Ok(Value::String(format!("{:?}", other))),
    }
}

/// Convert a serde_json::Value into a Lua value.
fn json_to_lua(lua: &Lua, value: &Value) -> Result<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(LuaValue::Number(f))
            } else {
                Ok(LuaValue::Nil)
            }
        }
        Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::Array(arr) => {
            let tbl = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                tbl.set(i + 1, json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
        Value::Object(map) => {
            let tbl = lua.create_table()?;
            for (k, v) in map {
                tbl.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(tbl))
        }
    }
}

/// Convert a Lua value back to serde_json::Value.
fn lua_to_json(value: &LuaValue) -> Result<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
        LuaValue::Integer(n) => Ok(serde_json::json!(*n)),
        LuaValue::Number(n) => Ok(serde_json::json!(*n)),
        LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            // Sequential integer keys from 1 mean an array
            let len = t.len()?;
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let val: LuaValue = t.get(i)?;
                    arr.push(lua_to_json(&val)?);
                }
                Ok(Value::Array(arr))
            } else {
                let mut map = Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (key, val) = pair?;
                    map.insert(key, lua_to_json(&val)?);
                }
                Ok(Value::Object(map))
            }
        }
        _ => Ok(Value::Null),
    }
}
