//! A named, ordered deployment workflow.

use crate::core::options::{OptDef, Parsed};
use crate::core::stage::StageExec;
use crate::error::{Error, Result};

/// A named, documented, ordered sequence of stages. The sequence is the
/// execution plan; `-s` selects a sublist by index before binding.
pub struct Method {
    pub name: &'static str,
    pub brief: &'static str,
    pub stages: Vec<StageExec>,
}

impl Method {
    pub fn new(name: &'static str, brief: &'static str, stages: Vec<StageExec>) -> Self {
        Method {
            name,
            brief,
            stages,
        }
    }

    /// Restrict the method to the stages at `indices`, in the given order.
    pub fn select(mut self, indices: &[usize]) -> Result<Self> {
        let total = self.stages.len();
        for &index in indices {
            if index >= total {
                return Err(Error::setup(format!(
                    "method \"{}\" has {total} stages, index {index} is out of range",
                    self.name
                )));
            }
        }
        let mut remaining: Vec<Option<StageExec>> = self.stages.into_iter().map(Some).collect();
        let mut selected = Vec::with_capacity(indices.len());
        for &index in indices {
            match remaining[index].take() {
                Some(stage) => selected.push(stage),
                None => {
                    return Err(Error::setup(format!(
                        "stage index {index} selected more than once"
                    )));
                }
            }
        }
        self.stages = selected;
        Ok(self)
    }

    /// Union of the flags required by the method's (selected) stages.
    pub fn required_options(&self) -> Vec<OptDef> {
        let mut seen = Vec::new();
        let mut result: Vec<OptDef> = Vec::new();
        for stage in &self.stages {
            for def in stage.options() {
                if !seen.contains(&def.flag) {
                    seen.push(def.flag);
                    result.push(def);
                }
            }
        }
        result
    }

    /// Bind parsed arguments into every stage.
    pub fn bind_all(&mut self, args: &Parsed) -> Result<()> {
        for stage in &mut self.stages {
            stage.bind(args)?;
        }
        Ok(())
    }
}
