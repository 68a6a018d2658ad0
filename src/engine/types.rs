use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object used for params, vars, and task results.
pub type JsonMap = Map<String, Value>;

/// A workflow definition as persisted in the catalog. Bound to a single
/// `(topic, channel)` subscription; only enabled workflows participate in
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub topic: String,
    pub channel: String,
    pub enabled: bool,
    pub dag: DagConfig,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowConfig {
    /// The consumer-map key for this workflow's subscription.
    pub fn subscription_key(&self) -> String {
        format!("{}:{}", self.topic, self.channel)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vars: Vec<DagVar>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// A named workflow variable with a default binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagVar {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_value: Value,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub action_name: String,
    #[serde(default)]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub params: JsonMap,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Seconds; 0 means no task-level deadline.
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_times: u32,
    #[serde(default)]
    pub interval_seconds: u64,
}

/// Supported data-source dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    Mysql,
    Postgresql,
    Sqlserver,
    Oracle,
    Mongodb,
    Sqlite,
}

impl DataSourceKind {
    pub fn is_sql(self) -> bool {
        !matches!(self, DataSourceKind::Mongodb)
    }
}

impl std::fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataSourceKind::Mysql => "mysql",
            DataSourceKind::Postgresql => "postgresql",
            DataSourceKind::Sqlserver => "sqlserver",
            DataSourceKind::Oracle => "oracle",
            DataSourceKind::Mongodb => "mongodb",
            DataSourceKind::Sqlite => "sqlite",
        };
        write!(f, "{}", name)
    }
}

/// A named, pooled connection to an external store, as persisted in the
/// catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DataSourceKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub max_idle: u32,
    #[serde(default)]
    pub max_open: u32,
    #[serde(default)]
    pub max_lifetime_seconds: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One delivered bus message, decoded for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub channel: String,
    /// Delivered payload as text (lossy UTF-8).
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: u16,
    pub id: String,
    /// Body decoded as a mapping when it is valid JSON; `{raw: <body>}`
    /// otherwise. Empty bodies leave this empty.
    pub data: JsonMap,
}

impl BusMessage {
    /// Decode a raw delivery. A structurally invalid body never fails the
    /// decode; the text lands under `data["raw"]` instead.
    pub fn decode(
        topic: &str,
        channel: &str,
        id: &str,
        body: &[u8],
        timestamp: DateTime<Utc>,
        attempts: u16,
    ) -> Self {
        let text = String::from_utf8_lossy(body).into_owned();
        let mut data = JsonMap::new();

        if !body.is_empty() {
            match serde_json::from_slice::<JsonMap>(body) {
                Ok(decoded) => data = decoded,
                Err(e) => {
                    tracing::warn!(topic, channel, error = %e, "Message body is not a JSON object, storing raw");
                    data.insert("raw".to_string(), Value::String(text.clone()));
                }
            }
        }

        Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            body: text,
            timestamp,
            attempts,
            id: id.to_string(),
            data,
        }
    }
}

/// Status of a single workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single execution of a workflow, triggered by one message. Persisted
/// with `status=running` before any task runs; the terminal status is
/// written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub vars: JsonMap,
    /// Task id -> output of that task; present iff the task completed
    /// without error.
    pub results: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}
