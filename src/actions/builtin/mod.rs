pub mod db_client;
pub mod http_client;
pub mod script;

use std::sync::Arc;

use crate::actions::ActionRegistry;

/// Register every built-in action.
pub fn register_all(registry: &mut ActionRegistry) {
    registry.register(Arc::new(http_client::HttpClientAction));
    registry.register(Arc::new(db_client::DbClientAction));
    registry.register(Arc::new(script::ScriptAction));
}
