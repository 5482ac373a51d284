// Channel configs, canonical channel ids, and row-change routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A logical pub/sub channel a client can subscribe to.
///
/// Each variant carries exactly the scoping ids its canonical id needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelConfig {
    ProjectUpdates { project_id: Uuid },
    /// Updates for a single work item, or every work item in the project when
    /// `work_item_id` is `None`.
    WorkItemUpdates { project_id: Uuid, work_item_id: Option<Uuid> },
    /// Updates for a single sprint, or every sprint in the project when
    /// `sprint_id` is `None`.
    SprintUpdates { project_id: Uuid, sprint_id: Option<Uuid> },
    CursorTracking { project_id: Uuid },
    Notifications { project_id: Uuid },
    CollaborativeEditing { work_item_id: Uuid },
    Session { session_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    ProjectUpdates,
    WorkItemUpdates,
    SprintUpdates,
    CursorTracking,
    Notifications,
    CollaborativeEditing,
    Session,
}

impl ChannelKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProjectUpdates => "project_updates",
            Self::WorkItemUpdates => "work_item_updates",
            Self::SprintUpdates => "sprint_updates",
            Self::CursorTracking => "cursor_tracking",
            Self::Notifications => "notifications",
            Self::CollaborativeEditing => "collaborative_editing",
            Self::Session => "session",
        }
    }
}

/// Which streams of a topic a member wants delivered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelBindings {
    #[serde(default)]
    pub row_changes: bool,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub presence: bool,
}

impl ChannelConfig {
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::ProjectUpdates { .. } => ChannelKind::ProjectUpdates,
            Self::WorkItemUpdates { .. } => ChannelKind::WorkItemUpdates,
            Self::SprintUpdates { .. } => ChannelKind::SprintUpdates,
            Self::CursorTracking { .. } => ChannelKind::CursorTracking,
            Self::Notifications { .. } => ChannelKind::Notifications,
            Self::CollaborativeEditing { .. } => ChannelKind::CollaborativeEditing,
            Self::Session { .. } => ChannelKind::Session,
        }
    }

    /// Deterministic channel id: `{type}_{scopeId}`.
    ///
    /// Item-less work-item and sprint channels fall back to `project_{projectId}`.
    pub fn canonical_id(&self) -> String {
        let kind = self.kind().as_str();
        match self {
            Self::ProjectUpdates { project_id }
            | Self::CursorTracking { project_id }
            | Self::Notifications { project_id } => format!("{kind}_{project_id}"),
            Self::WorkItemUpdates { project_id, work_item_id: scoped }
            | Self::SprintUpdates { project_id, sprint_id: scoped } => match scoped {
                Some(id) => format!("{kind}_{id}"),
                None => format!("{kind}_project_{project_id}"),
            },
            Self::CollaborativeEditing { work_item_id } => format!("{kind}_{work_item_id}"),
            Self::Session { session_id } => format!("{kind}_{session_id}"),
        }
    }

    pub const fn bindings(&self) -> ChannelBindings {
        match self {
            Self::ProjectUpdates { .. } => {
                ChannelBindings { row_changes: true, broadcast: true, presence: true }
            }
            Self::WorkItemUpdates { .. } | Self::SprintUpdates { .. } => {
                ChannelBindings { row_changes: true, broadcast: false, presence: false }
            }
            Self::CursorTracking { .. } => {
                ChannelBindings { row_changes: false, broadcast: true, presence: false }
            }
            Self::Notifications { .. } => {
                ChannelBindings { row_changes: true, broadcast: true, presence: false }
            }
            Self::CollaborativeEditing { .. } | Self::Session { .. } => {
                ChannelBindings { row_changes: false, broadcast: true, presence: true }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change to a durable table row, as emitted by the database trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    pub table: String,
    pub event_type: RowChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RowChange {
    /// Canonical ids of every channel this change is delivered to. Both row
    /// images are routed, so an update that moves a row out of a sprint or
    /// project still reaches the channel it left.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .flat_map(|record| channels_for(&self.table, record))
            .map(|config| config.canonical_id())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

fn channels_for(table: &str, record: &Value) -> Vec<ChannelConfig> {
    let id = uuid_field(record, "id");
    if table == "projects" {
        return id.map(|project_id| ChannelConfig::ProjectUpdates { project_id }).into_iter().collect();
    }
    let Some(project_id) = uuid_field(record, "project_id") else {
        return Vec::new();
    };

    match table {
        "work_items" => {
            let mut configs = vec![
                ChannelConfig::ProjectUpdates { project_id },
                ChannelConfig::WorkItemUpdates { project_id, work_item_id: None },
            ];
            if let Some(work_item_id) = id {
                configs.push(ChannelConfig::WorkItemUpdates { project_id, work_item_id: Some(work_item_id) });
            }
            if let Some(sprint_id) = uuid_field(record, "sprint_id") {
                configs.push(ChannelConfig::SprintUpdates { project_id, sprint_id: Some(sprint_id) });
            }
            configs
        }
        "sprints" => {
            let mut configs = vec![
                ChannelConfig::ProjectUpdates { project_id },
                ChannelConfig::SprintUpdates { project_id, sprint_id: None },
            ];
            if let Some(sprint_id) = id {
                configs.push(ChannelConfig::SprintUpdates { project_id, sprint_id: Some(sprint_id) });
            }
            configs
        }
        "retrospectives" => vec![ChannelConfig::ProjectUpdates { project_id }],
        "notifications" => vec![ChannelConfig::Notifications { project_id }],
        _ => Vec::new(),
    }
}

fn uuid_field(record: &Value, field: &str) -> Option<Uuid> {
    record.get(field).and_then(Value::as_str).and_then(|raw| Uuid::parse_str(raw).ok())
}
