// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use log::debug;
use thiserror::Error;

use crate::image_funcs::ArrayImage;

/// Why a stage refused its input or could not produce an output. The message
/// is the stage's own diagnostic.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StageError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// A stage failure, attributed to the stage that reported it.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{stage} failed:\n{source}")]
pub struct PipelineError {
    pub stage: String,
    pub source: StageError,
}

/// One image-to-image step of a processing pipeline. Stages follow a
/// validate-then-run contract: [Stage::check_input()] must pass before
/// [Stage::process()] is called.
pub trait Stage {
    /// Human-readable name used in error messages and logs.
    fn name(&self) -> &str;

    fn check_input(&self, input: &ArrayImage) -> Result<(), StageError>;

    fn process(&self, input: &ArrayImage) -> Result<ArrayImage, StageError>;
}

// Lets a pipeline borrow stages that are owned elsewhere.
impl<S: Stage + ?Sized> Stage for &S {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn check_input(&self, input: &ArrayImage) -> Result<(), StageError> {
        (**self).check_input(input)
    }

    fn process(&self, input: &ArrayImage) -> Result<ArrayImage, StageError> {
        (**self).process(input)
    }
}

/// Runs a sequence of stages, each consuming the previous stage's output.
/// The first failing stage stops the run.
#[derive(Default)]
pub struct Pipeline<'a> {
    stages: Vec<Box<dyn Stage + 'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new() -> Pipeline<'a> {
        Pipeline{stages: Vec::new()}
    }

    pub fn push(&mut self, stage: Box<dyn Stage + 'a>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Returns the last stage's output, or `input` unchanged if there are no
    /// stages.
    pub fn run(&self, input: ArrayImage) -> Result<ArrayImage, PipelineError> {
        let mut working = input;
        for stage in &self.stages {
            let stage_start = Instant::now();
            let attribute = |source| PipelineError{stage: stage.name().to_string(),
                                                   source};
            stage.check_input(&working).map_err(attribute)?;
            working = stage.process(&working).map_err(attribute)?;
            debug!("{} produced {:?} in {:?}",
                   stage.name(), working.data().shape(), stage_start.elapsed());
        }
        Ok(working)
    }
}
