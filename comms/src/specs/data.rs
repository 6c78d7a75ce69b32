use serde::{Deserialize, Serialize};

/// A single training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<f32>,
    pub target: f32,
}

/// A group of samples processed in one training step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The full state of a model, replicated to every trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Registry key of the model kind.
    pub kind: String,
    /// Input width expected by the model.
    pub inputs: usize,
    /// Flat parameter vector.
    pub params: Vec<f32>,
}
