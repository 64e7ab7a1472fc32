//! Process Definitions
//!
//! A process type is a fixed, code-defined sequence of steps. Definitions
//! are validated when registered with the engine.

use std::collections::HashSet;
use std::sync::Arc;

use super::step::Step;

/// Problems found while validating a process definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    EmptyDefinition(String),
    EmptyStepName(String),
    DuplicateStep { process_type: String, step: String },
}

impl std::fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDefinition(process_type) => {
                write!(f, "Process type '{}' has no steps", process_type)
            }
            Self::EmptyStepName(process_type) => {
                write!(f, "Process type '{}' has a step with an empty name", process_type)
            }
            Self::DuplicateStep { process_type, step } => {
                write!(f, "Process type '{}' declares step '{}' twice", process_type, step)
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Ordered steps of one process type.
#[derive(Clone)]
pub struct ProcessDefinition {
    process_type: String,
    steps: Vec<Arc<dyn Step>>,
}

impl ProcessDefinition {
    pub fn new(process_type: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step. Step names must be unique within the definition,
    /// because completion is tracked by name.
    pub fn add_step(&mut self, step: Arc<dyn Step>) -> Result<(), DefinitionError> {
        if step.name().trim().is_empty() {
            return Err(DefinitionError::EmptyStepName(self.process_type.clone()));
        }
        if self.position(step.name()).is_some() {
            return Err(DefinitionError::DuplicateStep {
                process_type: self.process_type.clone(),
                step: step.name().to_string(),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    /// Builder form of [`add_step`](Self::add_step).
    pub fn with_step(mut self, step: impl Step + 'static) -> Result<Self, DefinitionError> {
        self.add_step(Arc::new(step))?;
        Ok(self)
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Arc<dyn Step>> {
        self.steps.get(index)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name() == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::EmptyDefinition(self.process_type.clone()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name().trim().is_empty() {
                return Err(DefinitionError::EmptyStepName(self.process_type.clone()));
            }
            if !seen.insert(step.name()) {
                return Err(DefinitionError::DuplicateStep {
                    process_type: self.process_type.clone(),
                    step: step.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("ProcessDefinition")
            .field("process_type", &self.process_type)
            .field("steps", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::errors::StepError;
    use crate::execution::phase::StepPhase;

    struct Named(&'static str);

    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
            Ok(StepPhase::Done)
        }
    }

    #[test]
    fn test_steps_keep_declared_order() {
        let definition = ProcessDefinition::new("deploy")
            .with_step(Named("upload-app"))
            .unwrap()
            .with_step(Named("start-app"))
            .unwrap();

        assert_eq!(definition.len(), 2);
        assert_eq!(definition.position("start-app"), Some(1));
        assert_eq!(definition.step(0).unwrap().name(), "upload-app");
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let result = ProcessDefinition::new("deploy")
            .with_step(Named("upload-app"))
            .unwrap()
            .with_step(Named("upload-app"));

        assert_eq!(
            result.unwrap_err(),
            DefinitionError::DuplicateStep {
                process_type: "deploy".to_string(),
                step: "upload-app".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_definition_invalid() {
        let definition = ProcessDefinition::new("undeploy");
        assert!(definition.is_empty());
        assert_eq!(
            definition.validate().unwrap_err().to_string(),
            "Process type 'undeploy' has no steps"
        );
    }

    #[test]
    fn test_empty_step_name_rejected() {
        let result = ProcessDefinition::new("deploy").with_step(Named("  "));
        assert!(matches!(result, Err(DefinitionError::EmptyStepName(_))));
    }
}
