//! TODO items and the dependency DAG.
//!
//! Items become eligible only when every dependency is done (or skipped,
//! under the configured policy). Cycles are rejected at build time. Status
//! transitions follow the state machine
//! `pending → in_progress → (done | replanning | failed | skipped | blocked)`,
//! `replanning → in_progress`; terminal states are never left.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use maestro_core::{Error, ErrorKind, Result};
use maestro_tools::{ToolCall, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Replanning,
    Done,
    Failed,
    Skipped,
    Blocked,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Done | ItemStatus::Failed | ItemStatus::Skipped | ItemStatus::Blocked
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub action: String,
    pub dependencies: Vec<String>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub planned_tool_calls: Vec<ToolCall>,
    pub results: Vec<ToolResult>,
    pub verification: Option<Verification>,
    /// Short reason attached to failed/blocked/skipped items for the summary.
    pub status_reason: Option<String>,
}

impl TodoItem {
    pub fn new(id: impl Into<String>, action: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            dependencies,
            status: ItemStatus::Pending,
            attempts: 0,
            planned_tool_calls: vec![],
            results: vec![],
            verification: None,
            status_reason: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TodoList {
    items: Vec<TodoItem>,
    by_id: HashMap<String, usize>,
}

impl TodoList {
    /// Build from planned items, rejecting duplicate ids, unknown
    /// dependencies, and cycles.
    pub fn build(items: Vec<TodoItem>) -> Result<Self> {
        let mut by_id = HashMap::new();
        for (index, item) in items.iter().enumerate() {
            if by_id.insert(item.id.clone(), index).is_some() {
                return Err(Error::new(
                    ErrorKind::ValidationFailed,
                    format!("duplicate todo item id {:?}", item.id),
                ));
            }
        }
        for item in &items {
            for dependency in &item.dependencies {
                if !by_id.contains_key(dependency) {
                    return Err(Error::new(
                        ErrorKind::ValidationFailed,
                        format!("item {:?} depends on unknown item {:?}", item.id, dependency),
                    ));
                }
            }
        }

        let list = Self { items, by_id };
        if let Some(cycle) = list.find_cycle() {
            return Err(Error::new(
                ErrorKind::ValidationFailed,
                format!("dependency cycle: {}", cycle.join(" → ")),
            ));
        }
        Ok(list)
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks = vec![0u8; self.items.len()];
        let mut stack = Vec::new();

        fn visit(
            list: &TodoList,
            index: usize,
            marks: &mut [u8],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            if marks[index] == 1 {
                let mut cycle: Vec<String> = stack
                    .iter()
                    .skip_while(|&&entry| entry != index)
                    .map(|&entry| list.items[entry].id.clone())
                    .collect();
                cycle.push(list.items[index].id.clone());
                return Some(cycle);
            }
            if marks[index] == 2 {
                return None;
            }
            marks[index] = 1;
            stack.push(index);
            for dependency in &list.items[index].dependencies {
                let dep_index = list.by_id[dependency];
                if let Some(cycle) = visit(list, dep_index, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks[index] = 2;
            None
        }

        (0..self.items.len()).find_map(|index| visit(self, index, &mut marks, &mut stack))
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&TodoItem> {
        self.by_id.get(id).map(|&index| &self.items[index])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TodoItem> {
        let index = *self.by_id.get(id)?;
        Some(&mut self.items[index])
    }

    /// Pending items whose dependencies are all satisfied.
    pub fn eligible(&self, treat_skipped_as_done: bool) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .filter(|item| {
                item.dependencies.iter().all(|dependency| {
                    match self.get(dependency).map(|dep| dep.status) {
                        Some(ItemStatus::Done) => true,
                        Some(ItemStatus::Skipped) => treat_skipped_as_done,
                        _ => false,
                    }
                })
            })
            .map(|item| item.id.clone())
            .collect()
    }

    /// Validated status transition. Terminal states are never left; an item
    /// never re-enters pending.
    pub fn transition(&mut self, id: &str, next: ItemStatus) -> Result<()> {
        let item = self
            .get_mut(id)
            .ok_or_else(|| Error::new(ErrorKind::ValidationFailed, format!("no item {id:?}")))?;

        let legal = match (item.status, next) {
            (ItemStatus::Pending, ItemStatus::InProgress) => true,
            (ItemStatus::Pending, ItemStatus::Blocked | ItemStatus::Skipped) => true,
            (ItemStatus::InProgress, status) if status.is_terminal() => true,
            (ItemStatus::InProgress, ItemStatus::Replanning) => true,
            (ItemStatus::Replanning, ItemStatus::InProgress) => true,
            (ItemStatus::Replanning, status) if status.is_terminal() => true,
            _ => false,
        };
        if !legal {
            return Err(Error::new(
                ErrorKind::ValidationFailed,
                format!("illegal transition {:?} → {:?} for item {id:?}", item.status, next),
            ));
        }
        item.status = next;
        Ok(())
    }

    /// Block every pending item that (transitively) depends on a failed,
    /// blocked, or (under the default policy) skipped item. Returns the ids
    /// that were blocked.
    pub fn block_unreachable(&mut self, treat_skipped_as_done: bool) -> Vec<String> {
        let mut blocked = Vec::new();
        loop {
            let next: Vec<String> = self
                .items
                .iter()
                .filter(|item| item.status == ItemStatus::Pending)
                .filter(|item| {
                    item.dependencies.iter().any(|dependency| {
                        match self.get(dependency).map(|dep| dep.status) {
                            Some(ItemStatus::Failed) | Some(ItemStatus::Blocked) => true,
                            Some(ItemStatus::Skipped) => !treat_skipped_as_done,
                            _ => false,
                        }
                    })
                })
                .map(|item| item.id.clone())
                .collect();
            if next.is_empty() {
                break;
            }
            for id in next {
                if let Some(item) = self.get_mut(&id) {
                    item.status = ItemStatus::Blocked;
                    item.status_reason = Some("dependency did not complete".to_string());
                }
                blocked.push(id);
            }
        }
        blocked
    }

    pub fn all_terminal(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }

    pub fn counts(&self) -> HashMap<ItemStatus, usize> {
        let mut counts = HashMap::new();
        for item in &self.items {
            *counts.entry(item.status).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, deps: &[&str]) -> TodoItem {
        TodoItem::new(id, format!("do {id}"), deps.iter().map(|d| d.to_string()).collect())
    }

    fn diamond() -> TodoList {
        TodoList::build(vec![
            item("a", &[]),
            item("b", &["a"]),
            item("c", &["a"]),
            item("d", &["b", "c"]),
        ])
        .unwrap()
    }

    #[test]
    fn cycle_is_rejected_at_build_time() {
        let err = TodoList::build(vec![item("a", &["b"]), item("b", &["a"])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(err.message().contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = TodoList::build(vec![item("a", &["ghost"])]).unwrap_err();
        assert!(err.message().contains("unknown"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = TodoList::build(vec![item("a", &[]), item("a", &[])]).unwrap_err();
        assert!(err.message().contains("duplicate"));
    }

    #[test]
    fn eligibility_follows_dependencies() {
        let mut todo = diamond();
        assert_eq!(todo.eligible(false), vec!["a".to_string()]);

        todo.transition("a", ItemStatus::InProgress).unwrap();
        assert!(todo.eligible(false).is_empty());

        todo.transition("a", ItemStatus::Done).unwrap();
        let mut eligible = todo.eligible(false);
        eligible.sort();
        assert_eq!(eligible, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn skipped_dependency_policy_is_configurable() {
        let mut todo = TodoList::build(vec![item("a", &[]), item("b", &["a"])]).unwrap();
        todo.transition("a", ItemStatus::Skipped).unwrap();
        assert!(todo.eligible(false).is_empty());
        assert_eq!(todo.eligible(true), vec!["b".to_string()]);
    }

    #[test]
    fn failed_dependency_blocks_transitively() {
        let mut todo = diamond();
        todo.transition("a", ItemStatus::InProgress).unwrap();
        todo.transition("a", ItemStatus::Failed).unwrap();

        let mut blocked = todo.block_unreachable(false);
        blocked.sort();
        assert_eq!(blocked, vec!["b".to_string(), "c".to_string(), "d".to_string()]);
        assert!(todo.all_terminal());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut todo = diamond();
        todo.transition("a", ItemStatus::InProgress).unwrap();
        todo.transition("a", ItemStatus::Done).unwrap();
        assert!(todo.transition("a", ItemStatus::Pending).is_err());
        assert!(todo.transition("a", ItemStatus::InProgress).is_err());
    }

    #[test]
    fn replanning_roundtrip() {
        let mut todo = diamond();
        todo.transition("a", ItemStatus::InProgress).unwrap();
        todo.transition("a", ItemStatus::Replanning).unwrap();
        todo.transition("a", ItemStatus::InProgress).unwrap();
        todo.transition("a", ItemStatus::Done).unwrap();
    }
}
