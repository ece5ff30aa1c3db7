//! Stage/Data graph IR for lowering layer graphs onto a fixed-function accelerator.
//!
//! A [`Model`] owns every tensor ([`Data`]) and operation ([`StageNode`]) of one compiled
//! network in arena storage; edges are plain handles. Stages are inserted exclusively through
//! the [`StageBuilder`], and each stage kind implements the [`StageImpl`] contract that the
//! compile passes drive: scale propagation, data-order propagation, strides negotiation, batch
//! analysis, layout finalization, final checks and blob serialization.

pub mod blob;
pub mod builder;
pub mod compile;
mod env;
pub mod error;
pub mod model;
pub mod passes;
pub mod stages;

pub use blob::BlobSerializer;
pub use builder::StageBuilder;
pub use compile::{compile, CompileConfig, CompiledGraph};
pub use error::{CompileError, CompileResult, ContractViolation, NegotiationError};
pub use model::{
    topological_order, validate_structure, BatchSupport, Data, DataDesc, DataId, DataMap,
    DataType, DataUsage, Dim, DimStride, DimValues, DimsOrder, Model, StridesRequirement,
};
pub use passes::{ModelPass, PassContext, PassResult, Pipeline, PipelineBuilder};
pub use stages::{
    CopyMode, CopyParams, CopyStage, DetachedStage, ExpandParams, ExpandStage, LayerOrigin,
    PowerParams, PowerStage, ScalePropagationStep, StageCategory, StageContext, StageId,
    StageImpl, StageKind, StageNode,
};
