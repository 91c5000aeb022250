use std::time::Duration;

use crate::error::{KeelError, Result};

/// One step of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDef {
    /// Invoke a registered activity. A detached activity starts the next
    /// step right away; its result is picked up later by an `Await`.
    Activity { name: String, detached: bool },
    /// Pause the workflow.
    Sleep { duration: Duration },
    /// Block until a named signal is delivered.
    Signal { name: String },
    /// Block until the step at the given index has succeeded.
    Await { step: usize },
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    name: String,
    steps: Vec<StepDef>,
}

impl WorkflowDefinition {
    /// Start building a definition.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }

    pub fn step(&self, seq: i32) -> Option<&StepDef> {
        usize::try_from(seq).ok().and_then(|i| self.steps.get(i))
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Names of all activities the definition invokes.
    pub fn activity_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match step {
            StepDef::Activity { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(KeelError::Validation("workflow name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(KeelError::Validation(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }
        if i32::try_from(self.steps.len()).is_err() {
            return Err(KeelError::Validation(format!(
                "workflow '{}' has too many steps",
                self.name
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                StepDef::Activity { name, .. } | StepDef::Signal { name } => {
                    if name.trim().is_empty() {
                        return Err(KeelError::Validation(format!(
                            "workflow '{}' step {} has an empty name",
                            self.name, index
                        )));
                    }
                }
                StepDef::Await { step } => {
                    if *step >= index {
                        return Err(KeelError::Validation(format!(
                            "workflow '{}' step {} awaits step {}, which does not precede it",
                            self.name, index, step
                        )));
                    }
                }
                StepDef::Sleep { .. } => {}
            }
        }
        Ok(())
    }
}

/// Builder for [`WorkflowDefinition`].
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepDef>,
}

impl WorkflowBuilder {
    /// Append an activity step.
    pub fn activity(mut self, name: impl Into<String>) -> Self {
        self.steps.push(StepDef::Activity {
            name: name.into(),
            detached: false,
        });
        self
    }

    /// Append an activity that runs while the following steps proceed.
    pub fn detached_activity(mut self, name: impl Into<String>) -> Self {
        self.steps.push(StepDef::Activity {
            name: name.into(),
            detached: true,
        });
        self
    }

    /// Append a sleep step.
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(StepDef::Sleep { duration });
        self
    }

    /// Append a signal wait.
    pub fn signal(mut self, name: impl Into<String>) -> Self {
        self.steps.push(StepDef::Signal { name: name.into() });
        self
    }

    /// Append an await on an earlier step.
    pub fn await_step(mut self, step: usize) -> Self {
        self.steps.push(StepDef::Await { step });
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<WorkflowDefinition> {
        let definition = WorkflowDefinition {
            name: self.name,
            steps: self.steps,
        };
        definition.validate()?;
        Ok(definition)
    }
}
