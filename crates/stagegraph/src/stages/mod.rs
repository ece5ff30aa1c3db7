//! Stage contract shared by every operation kind.
//!
//! Each operation kind implements [`StageImpl`]. Operations a kind cannot legally perform are
//! refused through [`StageContext::must_never_be_called`] instead of a silent default, so a
//! misrouted query surfaces as a fatal [`ContractViolation`].
//!
//! Implementations never see raw handles: the [`Model`] asserts the declared arity and hands
//! them a [`StageContext`] over the stage's wired inputs and outputs.

mod copy;
mod expand;
mod power;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::blob::BlobSerializer;
use crate::error::{CompileError, CompileResult, ContractViolation};
use crate::model::{BatchSupport, Data, DataId, DataMap, DimsOrder, Model, StridesRequirement};

pub use copy::{CopyMode, CopyParams, CopyStage};
pub use expand::{ExpandParams, ExpandStage};
pub use power::{PowerParams, PowerStage};

/// Handle of a [`StageNode`] inside its owning [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl StageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%s{}", self.0)
    }
}

/// Operation kinds implemented by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Expand,
    Copy,
    Power,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Expand => "expand",
            StageKind::Copy => "copy",
            StageKind::Power => "power",
        }
    }

    /// Wire code written at the head of every serialized stage record.
    pub fn code(self) -> u32 {
        match self {
            StageKind::Copy => 1,
            StageKind::Power => 2,
            StageKind::Expand => 3,
        }
    }

    pub fn category(self) -> StageCategory {
        match self {
            StageKind::Expand => StageCategory::Special,
            StageKind::Copy => StageCategory::Dma,
            StageKind::Power => StageCategory::Shave,
        }
    }

    /// Input/output counts fixed for the kind.
    pub fn arity(self) -> Arity {
        match self {
            StageKind::Expand | StageKind::Copy | StageKind::Power => Arity {
                inputs: 1,
                outputs: 1,
            },
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution unit class of a stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageCategory {
    /// Layout-only stage realised by memory aliasing; never serialized.
    Special,
    /// DMA engine transfer.
    Dma,
    /// Programmable vector core kernel.
    Shave,
}

impl StageCategory {
    pub fn code(self) -> u32 {
        match self {
            StageCategory::Special => 0,
            StageCategory::Dma => 1,
            StageCategory::Shave => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub inputs: usize,
    pub outputs: usize,
}

/// Direction of a scale-factor propagation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalePropagationStep {
    /// Verify the stage runs unscaled; every boundary tensor resolves to `1.0`.
    Check,
    /// The caller requests the given input scales; the stage answers with the scales it
    /// settles on for inputs and outputs.
    ScaleInput,
    /// Input scales are known; the stage derives output scales and may request input
    /// rescaling.
    Propagate,
}

/// Opaque reference to the frontend layer a stage was lowered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerOrigin {
    pub name: String,
    pub layer_type: String,
}

impl LayerOrigin {
    pub fn new(name: impl Into<String>, layer_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            layer_type: layer_type.into(),
        })
    }
}

/// Per-kind behaviour driven by the compile passes.
pub trait StageImpl: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> StageKind;

    /// Deep copy of kind and params, detached from any edges.
    fn clone_stage(&self) -> Box<dyn StageImpl>;

    fn propagate_scale_factors(
        &self,
        cx: &StageContext<'_>,
        scales: &DataMap<f32>,
        step: ScalePropagationStep,
    ) -> CompileResult<DataMap<f32>>;

    /// Output orders derived purely from the input orders.
    fn propagate_data_order(&self, cx: &StageContext<'_>) -> CompileResult<DataMap<DimsOrder>>;

    /// This stage's stride requirements for its inputs and outputs.
    fn data_strides_requirements(
        &self,
        cx: &StageContext<'_>,
    ) -> CompileResult<DataMap<StridesRequirement>>;

    /// Records decisions once strides are resolved.
    fn finalize_data_layout(&mut self, _inputs: &[&Data], _outputs: &[&Data]) -> CompileResult<()> {
        Ok(())
    }

    fn batch_support_info(&self, cx: &StageContext<'_>) -> CompileResult<DataMap<BatchSupport>> {
        Ok(cx
            .inputs()
            .chain(cx.outputs())
            .map(|data| (data.id(), BatchSupport::Split))
            .collect())
    }

    fn final_check(&self, _cx: &StageContext<'_>) -> CompileResult<()> {
        Ok(())
    }

    fn serialize_params(
        &self,
        cx: &StageContext<'_>,
        writer: &mut BlobSerializer,
    ) -> CompileResult<()>;

    fn serialize_data(&self, cx: &StageContext<'_>, writer: &mut BlobSerializer)
        -> CompileResult<()>;

    /// Typed parameter struct fixed at construction.
    fn params(&self) -> &dyn Any;

    fn as_any(&self) -> &dyn Any;
}

/// Stage node stored in the [`Model`] arena.
#[derive(Debug)]
pub struct StageNode {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) origin: Option<Arc<LayerOrigin>>,
    pub(crate) inputs: SmallVec<[DataId; 4]>,
    pub(crate) outputs: SmallVec<[DataId; 2]>,
    pub(crate) imp: Box<dyn StageImpl>,
}

impl StageNode {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.imp.kind()
    }

    pub fn category(&self) -> StageCategory {
        self.kind().category()
    }

    pub fn origin(&self) -> Option<&LayerOrigin> {
        self.origin.as_deref()
    }

    pub fn inputs(&self) -> &[DataId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[DataId] {
        &self.outputs
    }

    pub(crate) fn check_arity(&self) -> CompileResult<()> {
        let kind = self.kind();
        let arity = kind.arity();
        if arity.inputs != self.inputs.len() || arity.outputs != self.outputs.len() {
            return Err(ContractViolation::Arity {
                stage: self.name.clone(),
                kind,
                expected_inputs: arity.inputs,
                expected_outputs: arity.outputs,
                inputs: self.inputs.len(),
                outputs: self.outputs.len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Stage copy detached from the graph, ready to be rewired through the builder.
#[derive(Debug)]
pub struct DetachedStage {
    pub(crate) name: String,
    pub(crate) origin: Option<Arc<LayerOrigin>>,
    pub(crate) imp: Box<dyn StageImpl>,
}

impl DetachedStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.imp.kind()
    }
}

/// Read-only view a stage operation receives over its wired edges.
///
/// Index accessors rely on the arity assertion performed before every dispatch.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    model: &'a Model,
    node: &'a StageNode,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(model: &'a Model, node: &'a StageNode) -> Self {
        Self { model, node }
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn id(&self) -> StageId {
        self.node.id
    }

    pub fn name(&self) -> &'a str {
        let node = self.node;
        &node.name
    }

    pub fn kind(&self) -> StageKind {
        self.node.kind()
    }

    pub fn input(&self, idx: usize) -> &'a Data {
        let node = self.node;
        self.model.data(node.inputs[idx])
    }

    pub fn output(&self, idx: usize) -> &'a Data {
        let node = self.node;
        self.model.data(node.outputs[idx])
    }

    pub fn inputs(&self) -> impl Iterator<Item = &'a Data> + 'a {
        let (model, node) = (self.model, self.node);
        node.inputs.iter().map(move |id| model.data(*id))
    }

    pub fn outputs(&self) -> impl Iterator<Item = &'a Data> + 'a {
        let (model, node) = (self.model, self.node);
        node.outputs.iter().map(move |id| model.data(*id))
    }

    /// Queries another stage's stride requirements (used for consumer-driven negotiation).
    pub fn stage_requirements(
        &self,
        stage: StageId,
    ) -> CompileResult<DataMap<StridesRequirement>> {
        self.model.data_strides_requirements(stage)
    }

    /// Distinguished refusal signal for operations a kind must never receive.
    pub fn must_never_be_called(&self, operation: &'static str) -> CompileError {
        ContractViolation::MustNeverBeCalled {
            stage: self.node.name.clone(),
            kind: self.kind(),
            operation,
        }
        .into()
    }

    pub fn assertion(&self, message: impl Into<String>) -> CompileError {
        ContractViolation::Assertion {
            stage: self.node.name.clone(),
            kind: self.kind(),
            message: message.into(),
        }
        .into()
    }

    pub fn ensure(&self, condition: bool, message: impl FnOnce() -> String) -> CompileResult<()> {
        if condition {
            Ok(())
        } else {
            Err(self.assertion(message()))
        }
    }
}

/// Shared checks for stages whose single output mirrors the input shape.
pub(crate) fn ensure_same_dims(cx: &StageContext<'_>) -> CompileResult<()> {
    let input = cx.input(0);
    let output = cx.output(0);
    cx.ensure(input.desc().dims() == output.desc().dims(), || {
        format!(
            "input `{}` dims {} differ from output `{}` dims {}",
            input.name(),
            input.desc().dims(),
            output.name(),
            output.desc().dims()
        )
    })
}

/// Writes the descriptor of every input then every output.
pub(crate) fn serialize_edges(
    cx: &StageContext<'_>,
    writer: &mut BlobSerializer,
) -> CompileResult<()> {
    for data in cx.inputs().chain(cx.outputs()) {
        writer.append_data(data)?;
    }
    Ok(())
}
