use std::sync::Arc;

use tracing::debug;

use crate::error::CompileResult;
use crate::model::{DataId, DimValues, Model};
use crate::stages::{
    CopyParams, CopyStage, DetachedStage, ExpandParams, ExpandStage, LayerOrigin, PowerParams,
    PowerStage, StageId, StageImpl,
};

/// Sole construction path for stages.
///
/// Every factory validates arity, single-producer and acyclicity before wiring; a rejected
/// stage leaves the model untouched.
pub struct StageBuilder;

impl StageBuilder {
    pub fn add_expand_stage(
        model: &mut Model,
        name: impl Into<String>,
        origin: Option<Arc<LayerOrigin>>,
        inputs: &[DataId],
        outputs: &[DataId],
        offset: DimValues,
    ) -> CompileResult<StageId> {
        let stage = ExpandStage::new(ExpandParams { offset });
        Self::add_stage(model, name.into(), origin, Box::new(stage), inputs, outputs)
    }

    pub fn add_copy_stage(
        model: &mut Model,
        name: impl Into<String>,
        origin: Option<Arc<LayerOrigin>>,
        inputs: &[DataId],
        outputs: &[DataId],
        params: CopyParams,
    ) -> CompileResult<StageId> {
        let stage = CopyStage::new(params);
        Self::add_stage(model, name.into(), origin, Box::new(stage), inputs, outputs)
    }

    pub fn add_power_stage(
        model: &mut Model,
        name: impl Into<String>,
        origin: Option<Arc<LayerOrigin>>,
        inputs: &[DataId],
        outputs: &[DataId],
        params: PowerParams,
    ) -> CompileResult<StageId> {
        let stage = PowerStage::new(params);
        Self::add_stage(model, name.into(), origin, Box::new(stage), inputs, outputs)
    }

    /// Re-inserts a stage obtained from [`Model::detach_clone`] with new edges.
    pub fn add_cloned_stage(
        model: &mut Model,
        name: impl Into<String>,
        stage: DetachedStage,
        inputs: &[DataId],
        outputs: &[DataId],
    ) -> CompileResult<StageId> {
        let DetachedStage { origin, imp, .. } = stage;
        Self::add_stage(model, name.into(), origin, imp, inputs, outputs)
    }

    fn add_stage(
        model: &mut Model,
        name: String,
        origin: Option<Arc<LayerOrigin>>,
        imp: Box<dyn StageImpl>,
        inputs: &[DataId],
        outputs: &[DataId],
    ) -> CompileResult<StageId> {
        let kind = imp.kind();
        let id = model.insert_stage(name, origin, imp, inputs, outputs)?;
        debug!(stage = %id, %kind, name = model.stage(id).name(), "stage added");
        Ok(id)
    }
}
