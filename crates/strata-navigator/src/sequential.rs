use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Navigator;
use strata_core::types::{IoNames, Location, NodeKind, Routine, StepInfo, VarMap};

pub const SEQUENTIAL_GRAPH_TYPE: &str = "sequential";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequentialDefinition {
    steps: Vec<SequentialStep>,
}

/// Navigator for flat `{ "steps": [...] }` routines. Every step is a task and
/// runs after the previous one.
#[derive(Debug, Default)]
pub struct SequentialNavigator;

impl SequentialNavigator {
    pub fn new() -> Self {
        Self
    }

    fn steps(routine: &Routine) -> Result<Vec<SequentialStep>> {
        let def: SequentialDefinition = serde_json::from_value(routine.definition.clone())
            .map_err(|e| {
                StrataError::Validation(format!(
                    "routine {} is not a sequential routine: {}",
                    routine.id, e
                ))
            })?;
        Ok(def.steps)
    }

    fn position(steps: &[SequentialStep], location: &Location) -> Result<usize> {
        steps
            .iter()
            .position(|s| s.id == location.node_id())
            .ok_or_else(|| StrataError::not_found("Step", location.node_id()))
    }
}

impl Navigator for SequentialNavigator {
    fn graph_type(&self) -> &str {
        SEQUENTIAL_GRAPH_TYPE
    }

    fn can_navigate(&self, routine: &Routine) -> bool {
        routine.graph_type == SEQUENTIAL_GRAPH_TYPE
            && Self::steps(routine).is_ok_and(|steps| !steps.is_empty())
    }

    fn get_all_start_locations(&self, routine: &Routine) -> Result<Vec<Location>> {
        Ok(Self::steps(routine)?
            .first()
            .map(|s| Location::new(routine.id.clone(), s.id.clone()))
            .into_iter()
            .collect())
    }

    fn get_next_locations(
        &self,
        routine: &Routine,
        location: &Location,
        _variables: &VarMap,
    ) -> Result<Vec<Location>> {
        self.get_successors(routine, location)
    }

    fn get_successors(&self, routine: &Routine, location: &Location) -> Result<Vec<Location>> {
        let steps = Self::steps(routine)?;
        let idx = Self::position(&steps, location)?;
        Ok(steps
            .get(idx + 1)
            .map(|s| Location::new(routine.id.clone(), s.id.clone()))
            .into_iter()
            .collect())
    }

    fn get_io_names_passed_into_node(
        &self,
        routine: &Routine,
        location: &Location,
    ) -> Result<IoNames> {
        let steps = Self::steps(routine)?;
        let step = &steps[Self::position(&steps, location)?];
        Ok(IoNames {
            inputs: step.inputs.clone(),
            outputs: step.outputs.clone(),
        })
    }

    fn get_parallel_branches(
        &self,
        _routine: &Routine,
        _location: &Location,
    ) -> Result<Vec<Vec<Location>>> {
        Ok(Vec::new())
    }

    fn get_step_info(&self, routine: &Routine, location: &Location) -> Result<StepInfo> {
        let steps = Self::steps(routine)?;
        let step = &steps[Self::position(&steps, location)?];
        Ok(StepInfo {
            node_id: step.id.clone(),
            kind: NodeKind::Task,
            name: step.name.clone().unwrap_or_else(|| step.id.clone()),
            strategy: step.strategy.clone(),
            tool: step.tool.clone(),
            inputs: step.inputs.clone(),
            outputs: step.outputs.clone(),
            config: step.config.clone(),
        })
    }

    fn is_end_location(&self, routine: &Routine, location: &Location) -> bool {
        match Self::steps(routine) {
            Ok(steps) => steps.last().map_or(true, |s| s.id == location.node_id()),
            Err(_) => true,
        }
    }
}
