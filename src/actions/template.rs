use serde_json::Value;

use crate::engine::types::JsonMap;

/// Expand template placeholders by textual replacement:
///
/// - `{{nsq.KEY}}`    -> `message.data[KEY]`
/// - `{{KEY}}`        -> workflow variable `KEY`
/// - `{{output.KEY}}` -> previous-task output `KEY`
///
/// Only text scalars substitute; non-text values and missing keys leave the
/// placeholder in place. All occurrences are replaced.
pub fn expand(
    template: &str,
    message_data: &JsonMap,
    vars: &JsonMap,
    previous_output: &Value,
) -> String {
    let mut result = template.to_string();

    for (key, value) in message_data {
        if let Value::String(s) = value {
            result = result.replace(&format!("{{{{nsq.{}}}}}", key), s);
        }
    }

    for (key, value) in vars {
        if let Value::String(s) = value {
            result = result.replace(&format!("{{{{{}}}}}", key), s);
        }
    }

    if let Value::Object(output) = previous_output {
        for (key, value) in output {
            if let Value::String(s) = value {
                result = result.replace(&format!("{{{{output.{}}}}}", key), s);
            }
        }
    }

    result
}
