//! Step graphs: the linear screen order of each wizard.

use crate::error::WizardError;

/// Identifier of a step inside one wizard's graph.
pub type StepId = &'static str;

/// One screen of a wizard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    /// Display percentage, 0..=100.
    pub progress: u8,
    pub previous: Option<StepId>,
    pub next: Option<StepId>,
}

impl Step {
    pub const fn new(
        id: StepId,
        progress: u8,
        previous: Option<StepId>,
        next: Option<StepId>,
    ) -> Self {
        Self {
            id,
            progress,
            previous,
            next,
        }
    }
}

/// Immutable, validated path of steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: &'static [Step],
    first: StepId,
}

impl StepGraph {
    /// Build a graph, checking that it forms a single simple path.
    ///
    /// Every neighbour must exist, `a.next == b` must imply `b.previous == a`,
    /// and walking forward from the only step without a predecessor must visit
    /// every step exactly once.
    pub fn new(steps: &'static [Step]) -> Result<Self, WizardError> {
        let find = |id: StepId| steps.iter().find(|s| s.id == id);

        for step in steps {
            if step.progress > 100 {
                return Err(WizardError::UnknownStep(format!(
                    "{} (progress {} out of range)",
                    step.id, step.progress
                )));
            }
            if let Some(next) = step.next {
                let target = find(next).ok_or_else(|| WizardError::UnknownStep(next.to_string()))?;
                if target.previous != Some(step.id) {
                    return Err(WizardError::UnknownStep(format!(
                        "{} (previous does not point back to {})",
                        next, step.id
                    )));
                }
            }
            if let Some(previous) = step.previous {
                let target =
                    find(previous).ok_or_else(|| WizardError::UnknownStep(previous.to_string()))?;
                if target.next != Some(step.id) {
                    return Err(WizardError::UnknownStep(format!(
                        "{} (next does not point forward to {})",
                        previous, step.id
                    )));
                }
            }
        }

        let mut starts = steps.iter().filter(|s| s.previous.is_none());
        let first = match (starts.next(), starts.next()) {
            (Some(first), None) => first.id,
            _ => {
                return Err(WizardError::UnknownStep(
                    "graph must have exactly one first step".to_string(),
                ));
            }
        };

        let mut visited = 0;
        let mut cursor = find(first);
        while let Some(step) = cursor {
            visited += 1;
            if visited > steps.len() {
                break;
            }
            cursor = step.next.and_then(find);
        }
        if visited != steps.len() {
            return Err(WizardError::UnknownStep(
                "graph is not a single linear path".to_string(),
            ));
        }

        Ok(Self { steps, first })
    }

    pub fn step_of(&self, id: &str) -> Result<&Step, WizardError> {
        self.steps
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| WizardError::UnknownStep(id.to_string()))
    }

    pub fn progress_of(&self, id: &str) -> Result<u8, WizardError> {
        self.step_of(id).map(|s| s.progress)
    }

    pub fn first(&self) -> StepId {
        self.first
    }

    /// Steps in navigation order.
    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        let mut cursor = self.step_of(self.first).ok();
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = current.next.and_then(|n| self.step_of(n).ok());
            Some(current)
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

pub const IMAGE_SELECTIONS: StepId = "selections";
pub const IMAGE_DESCRIPTION: StepId = "description";
pub const IMAGE_REVIEW: StepId = "review";
pub const IMAGE_COMPLETED: StepId = "completed";

pub static IMAGE_STEPS: [Step; 4] = [
    Step::new(IMAGE_SELECTIONS, 25, None, Some(IMAGE_DESCRIPTION)),
    Step::new(IMAGE_DESCRIPTION, 50, Some(IMAGE_SELECTIONS), Some(IMAGE_REVIEW)),
    Step::new(IMAGE_REVIEW, 75, Some(IMAGE_DESCRIPTION), Some(IMAGE_COMPLETED)),
    Step::new(IMAGE_COMPLETED, 100, Some(IMAGE_REVIEW), None),
];

pub const BACKSTORY_NAME: StepId = "name";
pub const BACKSTORY_DETAILS: StepId = "details";
pub const BACKSTORY_COMPLETED: StepId = "completed";

pub static BACKSTORY_STEPS: [Step; 3] = [
    Step::new(BACKSTORY_NAME, 33, None, Some(BACKSTORY_DETAILS)),
    Step::new(
        BACKSTORY_DETAILS,
        66,
        Some(BACKSTORY_NAME),
        Some(BACKSTORY_COMPLETED),
    ),
    Step::new(BACKSTORY_COMPLETED, 100, Some(BACKSTORY_DETAILS), None),
];
