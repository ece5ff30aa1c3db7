//! Arena-owned stage graph.
//!
//! Tensors and stages live in two vectors owned by [`Model`] and refer to each other through
//! [`DataId`] / [`StageId`] handles. Stages are only inserted through
//! [`StageBuilder`](crate::StageBuilder), which validates wiring before it touches the arena.

mod data;
mod dims;
mod strides;
pub(crate) mod topology;

use std::any::{type_name, Any};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::blob::BlobSerializer;
use crate::error::{CompileResult, ContractViolation};
use crate::stages::{
    DetachedStage, LayerOrigin, ScalePropagationStep, StageCategory, StageContext, StageId,
    StageImpl, StageKind, StageNode,
};

pub use data::{BatchSupport, Data, DataDesc, DataId, DataMap, DataType, DataUsage};
pub use dims::{Dim, DimValues, DimsOrder, DimsOrderError, MAX_DIMS};
pub use strides::{DimStride, StrideConflict, StridesRequirement};
pub use topology::{topological_order, validate_structure};

#[derive(Debug, Default)]
pub struct Model {
    name: String,
    data: Vec<Data>,
    stages: Vec<StageNode>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn push_data(&mut self, name: impl Into<String>, desc: DataDesc, usage: DataUsage) -> DataId {
        let id = DataId(self.data.len() as u32);
        self.data.push(Data::new(id, name.into(), desc, usage));
        id
    }

    /// Adds a network input; it can never be produced by a stage.
    pub fn add_input(&mut self, name: impl Into<String>, desc: DataDesc) -> DataId {
        self.push_data(name, desc, DataUsage::Input)
    }

    /// Adds a tensor that a stage will produce.
    pub fn add_data(&mut self, name: impl Into<String>, desc: DataDesc) -> DataId {
        self.push_data(name, desc, DataUsage::Intermediate)
    }

    /// Marks a produced tensor as a graph result.
    pub fn mark_output(&mut self, id: DataId) -> CompileResult<()> {
        let data = self.data_mut(id)?;
        if data.usage == DataUsage::Input {
            return Err(ContractViolation::DataInvariant {
                data: data.name.clone(),
                message: "a network input cannot be marked as a graph result".to_string(),
            }
            .into());
        }
        data.usage = DataUsage::Output;
        Ok(())
    }

    /// Sets the memory order of a network input. Every other order is derived by
    /// data-order propagation.
    pub fn set_input_order(&mut self, id: DataId, order: DimsOrder) -> CompileResult<()> {
        let data = self.data_mut(id)?;
        let message = if data.usage != DataUsage::Input {
            Some("only network inputs carry a frontend-chosen order".to_string())
        } else if !order.covers(data.desc.dims()) {
            Some(format!("order {order} does not cover dims {}", data.desc.dims()))
        } else {
            None
        };
        if let Some(message) = message {
            return Err(ContractViolation::DataInvariant {
                data: data.name.clone(),
                message,
            }
            .into());
        }
        data.order = order;
        Ok(())
    }

    /// Looks up a tensor by handle.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this model. Use [`Model::try_data`] for untrusted
    /// handles.
    pub fn data(&self, id: DataId) -> &Data {
        &self.data[id.index()]
    }

    pub fn try_data(&self, id: DataId) -> CompileResult<&Data> {
        self.data
            .get(id.index())
            .ok_or_else(|| ContractViolation::UnknownData(id).into())
    }

    pub(crate) fn data_mut(&mut self, id: DataId) -> CompileResult<&mut Data> {
        self.data
            .get_mut(id.index())
            .ok_or_else(|| ContractViolation::UnknownData(id).into())
    }

    /// Looks up a stage by handle.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this model.
    pub fn stage(&self, id: StageId) -> &StageNode {
        &self.stages[id.index()]
    }

    pub fn try_stage(&self, id: StageId) -> CompileResult<&StageNode> {
        self.stages
            .get(id.index())
            .ok_or_else(|| ContractViolation::UnknownStage(id).into())
    }

    pub fn datas(&self) -> impl Iterator<Item = &Data> + '_ {
        self.data.iter()
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageNode> + '_ {
        self.stages.iter()
    }

    pub fn num_data(&self) -> usize {
        self.data.len()
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Data> + '_ {
        self.data.iter().filter(|d| d.usage == DataUsage::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Data> + '_ {
        self.data.iter().filter(|d| d.usage == DataUsage::Output)
    }

    /// Reads back the typed params a stage was built with.
    pub fn stage_params<T: Any>(&self, stage: StageId) -> CompileResult<&T> {
        let node = self.try_stage(stage)?;
        node.imp
            .params()
            .downcast_ref::<T>()
            .ok_or_else(|| params_mismatch::<T>(node))
    }

    /// Borrows the concrete implementation of a stage, e.g. to inspect finalized decisions.
    pub fn stage_impl<T: StageImpl>(&self, stage: StageId) -> CompileResult<&T> {
        let node = self.try_stage(stage)?;
        node.imp
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| params_mismatch::<T>(node))
    }

    /// Copies a stage's kind and params without its edges.
    pub fn detach_clone(&self, stage: StageId) -> CompileResult<DetachedStage> {
        let node = self.try_stage(stage)?;
        Ok(DetachedStage {
            name: node.name.clone(),
            origin: node.origin.clone(),
            imp: node.imp.clone_stage(),
        })
    }

    /// Validates and wires a new stage. Nothing is modified when validation fails.
    pub(crate) fn insert_stage(
        &mut self,
        name: String,
        origin: Option<Arc<LayerOrigin>>,
        imp: Box<dyn StageImpl>,
        inputs: &[DataId],
        outputs: &[DataId],
    ) -> CompileResult<StageId> {
        for id in inputs.iter().chain(outputs) {
            self.try_data(*id)?;
        }

        let kind = imp.kind();
        let arity = kind.arity();
        if arity.inputs != inputs.len() || arity.outputs != outputs.len() {
            return Err(ContractViolation::Arity {
                stage: name,
                kind,
                expected_inputs: arity.inputs,
                expected_outputs: arity.outputs,
                inputs: inputs.len(),
                outputs: outputs.len(),
            }
            .into());
        }

        for (idx, &out) in outputs.iter().enumerate() {
            let data = self.data(out);
            if let Some(producer) = data.producer {
                return Err(ContractViolation::MultipleProducers {
                    data: data.name.clone(),
                    producer: self.stage(producer).name.clone(),
                }
                .into());
            }
            if outputs[..idx].contains(&out) {
                return Err(ContractViolation::MultipleProducers {
                    data: data.name.clone(),
                    producer: name,
                }
                .into());
            }
            if data.usage == DataUsage::Input {
                return Err(ContractViolation::ProducedNetworkInput {
                    data: data.name.clone(),
                    stage: name,
                }
                .into());
            }
            if inputs.contains(&out) {
                return Err(ContractViolation::Cycle {
                    stage: name,
                    data: data.name.clone(),
                }
                .into());
            }
        }

        if let Some(data) = self.first_reachable(outputs, inputs) {
            return Err(ContractViolation::Cycle {
                stage: name,
                data: self.data(data).name.clone(),
            }
            .into());
        }

        let id = StageId(self.stages.len() as u32);
        for &input in inputs {
            let consumers = &mut self.data[input.index()].consumers;
            if !consumers.contains(&id) {
                consumers.push(id);
            }
        }
        for &out in outputs {
            self.data[out.index()].producer = Some(id);
        }
        self.stages.push(StageNode {
            id,
            name,
            origin,
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.iter().copied().collect(),
            imp,
        });
        Ok(id)
    }

    /// First of `targets` reachable downstream of `from` through already wired consumers.
    fn first_reachable(&self, from: &[DataId], targets: &[DataId]) -> Option<DataId> {
        let mut seen: HashSet<DataId> = from.iter().copied().collect();
        let mut queue: VecDeque<DataId> = from.iter().copied().collect();
        while let Some(data) = queue.pop_front() {
            if targets.contains(&data) {
                return Some(data);
            }
            for consumer in &self.data[data.index()].consumers {
                for &next in &self.stages[consumer.index()].outputs {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        None
    }

    fn dispatch(&self, stage: StageId) -> CompileResult<(StageContext<'_>, &StageNode)> {
        let node = self.try_stage(stage)?;
        node.check_arity()?;
        Ok((StageContext::new(self, node), node))
    }

    pub fn propagate_scale_factors(
        &self,
        stage: StageId,
        scales: &DataMap<f32>,
        step: ScalePropagationStep,
    ) -> CompileResult<DataMap<f32>> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.propagate_scale_factors(&cx, scales, step)
    }

    pub fn propagate_data_order(&self, stage: StageId) -> CompileResult<DataMap<DimsOrder>> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.propagate_data_order(&cx)
    }

    pub fn data_strides_requirements(
        &self,
        stage: StageId,
    ) -> CompileResult<DataMap<StridesRequirement>> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.data_strides_requirements(&cx)
    }

    pub fn batch_support_info(&self, stage: StageId) -> CompileResult<DataMap<BatchSupport>> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.batch_support_info(&cx)
    }

    pub fn final_check(&self, stage: StageId) -> CompileResult<()> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.final_check(&cx)
    }

    pub fn serialize_params(&self, stage: StageId, writer: &mut BlobSerializer) -> CompileResult<()> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.serialize_params(&cx, writer)
    }

    pub fn serialize_data(&self, stage: StageId, writer: &mut BlobSerializer) -> CompileResult<()> {
        let (cx, node) = self.dispatch(stage)?;
        node.imp.serialize_data(&cx, writer)
    }

    pub(crate) fn finalize_data_layout(&mut self, stage: StageId) -> CompileResult<()> {
        let Model { data, stages, .. } = self;
        let node = stages
            .get_mut(stage.index())
            .ok_or(ContractViolation::UnknownStage(stage))?;
        node.check_arity()?;
        let inputs: Vec<&Data> = node.inputs.iter().map(|id| &data[id.index()]).collect();
        let outputs: Vec<&Data> = node.outputs.iter().map(|id| &data[id.index()]).collect();
        node.imp.finalize_data_layout(&inputs, &outputs)
    }

    /// Pretty JSON snapshot of tensors and stages for debugging dumps.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        let snapshot = ModelSnapshot {
            name: &self.name,
            data: self
                .data
                .iter()
                .map(|d| DataSnapshot {
                    id: d.id,
                    name: &d.name,
                    usage: d.usage,
                    desc: &d.desc,
                    order: d.order.to_string(),
                    required_strides: d.required_strides,
                    strides: d.strides.as_ref(),
                    scale: d.scale,
                    batch: d.batch,
                    producer: d.producer,
                    consumers: &d.consumers,
                })
                .collect(),
            stages: self
                .stages
                .iter()
                .map(|s| StageSnapshot {
                    id: s.id,
                    name: &s.name,
                    kind: s.kind(),
                    category: s.category(),
                    origin: s.origin(),
                    inputs: &s.inputs,
                    outputs: &s.outputs,
                })
                .collect(),
        };
        serde_json::to_string_pretty(&snapshot)
    }
}

fn params_mismatch<T>(node: &StageNode) -> crate::error::CompileError {
    ContractViolation::ParamsMismatch {
        stage: node.name.clone(),
        expected: type_name::<T>(),
    }
    .into()
}

#[derive(Serialize)]
struct ModelSnapshot<'a> {
    name: &'a str,
    data: Vec<DataSnapshot<'a>>,
    stages: Vec<StageSnapshot<'a>>,
}

#[derive(Serialize)]
struct DataSnapshot<'a> {
    id: DataId,
    name: &'a str,
    usage: DataUsage,
    desc: &'a DataDesc,
    order: String,
    required_strides: StridesRequirement,
    strides: Option<&'a DimValues>,
    scale: f32,
    batch: BatchSupport,
    producer: Option<StageId>,
    consumers: &'a [StageId],
}

#[derive(Serialize)]
struct StageSnapshot<'a> {
    id: StageId,
    name: &'a str,
    kind: StageKind,
    category: StageCategory,
    origin: Option<&'a LayerOrigin>,
    inputs: &'a [DataId],
    outputs: &'a [DataId],
}
