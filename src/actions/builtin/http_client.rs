use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::info;

use crate::actions::{Action, ActionContext, TaskContext};
use crate::error::{Error, Result};

/// HTTP request action. URL and header values are template-expanded; the
/// body is marshalled as JSON. The output carries the parsed response body
/// plus `status_code` and `headers`.
pub struct HttpClientAction;

#[async_trait]
impl Action for HttpClientAction {
    fn name(&self) -> &str {
        "http_client"
    }

    fn description(&self) -> &str {
        "HTTP request with template-expanded URL and headers"
    }

    async fn run(&self, ctx: &ActionContext<'_>, task: &TaskContext<'_>) -> Result<Value> {
        let url = task
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config("http_client requires 'url' parameter".to_string()))?;
        let url = ctx.expand(url);

        let method = task
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let timeout_s = task
            .get("timeout")
            .and_then(|v| v.as_f64())
            .unwrap_or(30.0);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_s))
            .build()?;

        let mut request = match method.as_str() {
            "GET" => client.get(&url),
            "POST" => client.post(&url),
            "PUT" => client.put(&url),
            "DELETE" => client.delete(&url),
            "PATCH" => client.patch(&url),
            "HEAD" => client.head(&url),
            other => {
                return Err(Error::Config(format!("unsupported HTTP method: {}", other)));
            }
        };

        // Body before headers so a caller-supplied Content-Type overrides
        // the JSON default.
        if let Some(body) = task.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        if let Some(headers) = task.get("headers").and_then(|v| v.as_object()) {
            let mut header_map = HeaderMap::new();
            for (k, v) in headers {
                if let Some(val) = v.as_str() {
                    let val = ctx.expand(val);
                    header_map.insert(
                        HeaderName::from_bytes(k.as_bytes())
                            .map_err(|e| Error::Config(format!("invalid header name '{}': {}", k, e)))?,
                        HeaderValue::from_str(&val)
                            .map_err(|e| Error::Config(format!("invalid value for header '{}': {}", k, e)))?,
                    );
                }
            }
            request = request.headers(header_map);
        }

        info!(%method, %url, "Executing HTTP request");

        let response = request.send().await?;
        let status = response.status().as_u16();

        let resp_headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let body_text = response.text().await?;

        if status >= 400 {
            return Err(Error::Remote(format!(
                "HTTP {} {} returned status {}: {}",
                method, url, status, body_text
            )));
        }

        // Parse the body as a JSON object, fall back to a raw wrapper.
        let mut output = match serde_json::from_str::<Map<String, Value>>(&body_text) {
            Ok(map) => map,
            Err(_) => {
                let mut map = Map::new();
                map.insert("body".to_string(), Value::String(body_text));
                map
            }
        };
        output.insert("status_code".to_string(), Value::Number(status.into()));
        output.insert("headers".to_string(), Value::Object(resp_headers));

        Ok(Value::Object(output))
    }
}
