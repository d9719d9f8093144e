//! The workflow engine: mode selection, TODO planning, and the per-item
//! plan → execute → verify → replan loop, driven over a dependency DAG with a
//! bounded worker pool.

use serde::{Deserialize, Serialize};

pub mod engine;
pub mod events;
pub mod sessions;
pub mod stages;
pub mod todo;

pub use engine::{ItemReport, SessionOutcome, WorkflowEngine};
pub use events::{EventBus, EventEnvelope, SessionEvent};
pub use sessions::SessionStore;
pub use stages::{PlannedItem, PlannerLlm, ToolExecutorPort};
pub use todo::{ItemStatus, TodoItem, TodoList, Verification};

/// Operating mode chosen per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Chat,
    Task,
    Dev,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Task => "task",
            Mode::Dev => "dev",
        }
    }

    /// Lenient parse; anything unrecognized is chat.
    pub fn parse(text: &str) -> Self {
        let lowered = text.trim().to_lowercase();
        if lowered.contains("task") {
            Mode::Task
        } else if lowered.contains("dev") {
            Mode::Dev
        } else {
            Mode::Chat
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_is_lenient() {
        assert_eq!(Mode::parse("task"), Mode::Task);
        assert_eq!(Mode::parse(" The mode is: TASK."), Mode::Task);
        assert_eq!(Mode::parse("dev"), Mode::Dev);
        assert_eq!(Mode::parse("chat"), Mode::Chat);
        assert_eq!(Mode::parse("no idea"), Mode::Chat);
    }
}
