//! In-memory accumulator of one iteration's changes.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use agentflow_core::{EventDefinition, StepDefinition, TaskDefinition};

/// Accumulated changes from a single evaluator iteration.
///
/// Changes are collected in memory while handlers run and committed
/// atomically at the iteration boundary. On commit failure the accumulator
/// remains valid and the commit may be retried.
#[derive(Debug, Default)]
pub struct IterationChanges {
    pub created_steps: Vec<StepDefinition>,
    pub updated_steps: Vec<StepDefinition>,
    pub created_events: Vec<EventDefinition>,
    pub updated_events: Vec<EventDefinition>,
    pub created_tasks: Vec<TaskDefinition>,

    created_step_ids: HashSet<Uuid>,
    updated_step_idx: HashMap<Uuid, usize>,
    updated_event_idx: HashMap<Uuid, usize>,
}

impl IterationChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created step (idempotent per id).
    pub fn add_created_step(&mut self, step: StepDefinition) {
        if self.created_step_ids.insert(step.id) {
            self.created_steps.push(step);
        }
    }

    /// Record an updated step. A later update for the same id replaces the
    /// earlier one; an update for a step created this iteration replaces the
    /// created entry instead.
    pub fn add_updated_step(&mut self, step: StepDefinition) {
        if self.created_step_ids.contains(&step.id) {
            if let Some(slot) = self.created_steps.iter_mut().find(|s| s.id == step.id) {
                *slot = step;
            }
            return;
        }
        match self.updated_step_idx.get(&step.id) {
            Some(&idx) => self.updated_steps[idx] = step,
            None => {
                self.updated_step_idx.insert(step.id, self.updated_steps.len());
                self.updated_steps.push(step);
            }
        }
    }

    pub fn add_created_event(&mut self, event: EventDefinition) {
        self.created_events.push(event);
    }

    /// Record an updated event, replacing an earlier update for the same id.
    pub fn add_updated_event(&mut self, event: EventDefinition) {
        match self.updated_event_idx.get(&event.uuid) {
            Some(&idx) => self.updated_events[idx] = event,
            None => {
                self.updated_event_idx
                    .insert(event.uuid, self.updated_events.len());
                self.updated_events.push(event);
            }
        }
    }

    pub fn add_created_task(&mut self, task: TaskDefinition) {
        self.created_tasks.push(task);
    }

    pub fn has_changes(&self) -> bool {
        !self.created_steps.is_empty()
            || !self.updated_steps.is_empty()
            || !self.created_events.is_empty()
            || !self.updated_events.is_empty()
            || !self.created_tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.created_steps.clear();
        self.updated_steps.clear();
        self.created_events.clear();
        self.updated_events.clear();
        self.created_tasks.clear();
        self.created_step_ids.clear();
        self.updated_step_idx.clear();
        self.updated_event_idx.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{generate_id, ObjectType, StepState};

    fn step() -> StepDefinition {
        StepDefinition::create(
            generate_id(),
            ObjectType::VariableAssignment,
            "ns.F",
            Some("s1".to_string()),
            "a",
            None,
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_created_steps_deduplicate() {
        let mut changes = IterationChanges::new();
        let s = step();
        changes.add_created_step(s.clone());
        changes.add_created_step(s);
        assert_eq!(changes.created_steps.len(), 1);
    }

    #[test]
    fn test_updated_step_replaces_previous() {
        let mut changes = IterationChanges::new();
        let mut s = step();
        // Pretend it was persisted in an earlier iteration
        changes.add_updated_step(s.clone());
        s.change_state(StepState::FacetInitBegin);
        changes.add_updated_step(s.clone());

        assert_eq!(changes.updated_steps.len(), 1);
        assert_eq!(changes.updated_steps[0].state, StepState::FacetInitBegin);
    }

    #[test]
    fn test_update_of_created_step_folds_into_created() {
        let mut changes = IterationChanges::new();
        let mut s = step();
        changes.add_created_step(s.clone());
        s.change_state(StepState::FacetInitBegin);
        changes.add_updated_step(s);

        assert_eq!(changes.created_steps.len(), 1);
        assert!(changes.updated_steps.is_empty());
        assert_eq!(changes.created_steps[0].state, StepState::FacetInitBegin);
    }

    #[test]
    fn test_has_changes_and_clear() {
        let mut changes = IterationChanges::new();
        assert!(!changes.has_changes());
        changes.add_created_step(step());
        assert!(changes.has_changes());
        changes.clear();
        assert!(!changes.has_changes());
    }
}
