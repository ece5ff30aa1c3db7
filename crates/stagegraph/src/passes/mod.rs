//! Model-level compile passes and the pipeline that sequences them.

mod batch;
mod data_order;
mod final_check;
mod layout;
mod pipeline;
mod scale;
mod serialize;
mod strides;
mod validate;

use bytes::Bytes;

use crate::compile::CompileConfig;
use crate::error::CompileResult;
use crate::model::Model;

pub use batch::BatchSupportPass;
pub use data_order::DataOrderPropagationPass;
pub use final_check::FinalCheckPass;
pub use layout::FinalizeLayoutPass;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use scale::ScalePropagationPass;
pub use serialize::SerializePass;
pub use strides::StridesNegotiationPass;
pub use validate::ValidateStructurePass;

/// Result returned by a [`ModelPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the model.
    pub changed: bool,
    /// Fixed-point iterations executed.
    pub iterations: usize,
    /// Tensors whose order, requirement, scale or batch flag was updated.
    pub updated_data: usize,
}

impl PassResult {
    pub fn changed(updated_data: usize) -> Self {
        Self {
            changed: updated_data > 0,
            iterations: 0,
            updated_data,
        }
    }

    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            updated_data: self.updated_data + other.updated_data,
        }
    }
}

/// Mutable state shared by the passes of one compilation.
#[derive(Debug, Default)]
pub struct PassContext {
    pub config: CompileConfig,
    pub blob: Option<Bytes>,
    pub serialized_stages: usize,
}

impl PassContext {
    pub fn new(config: CompileConfig) -> Self {
        Self {
            config,
            blob: None,
            serialized_stages: 0,
        }
    }
}

pub trait ModelPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, model: &mut Model, cx: &mut PassContext) -> CompileResult<PassResult>;
}
