use tracing::trace;

use super::{ModelPass, PassContext, PassResult};
use crate::error::{CompileResult, NegotiationError};
use crate::model::{topological_order, DataId, DataMap, DataUsage, Model};
use crate::stages::{ScalePropagationStep, StageCategory, StageId};

/// Forward propagation of fixed-point scale factors.
///
/// Network inputs start from the configured scales. A stage reading a configured input is
/// asked with [`ScalePropagationStep::ScaleInput`], a stage reading only unscaled tensors with
/// [`ScalePropagationStep::Check`], anything else with [`ScalePropagationStep::Propagate`].
/// Special stages alias their input, so the scale passes through them without a query.
#[derive(Default)]
pub struct ScalePropagationPass;

impl ScalePropagationPass {
    const NAME: &'static str = "propagate-scale-factors";
}

impl ModelPass for ScalePropagationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, cx: &mut PassContext) -> CompileResult<PassResult> {
        let mut updated = 0usize;
        let input_ids: Vec<_> = model.inputs().map(|data| data.id()).collect();
        for id in input_ids {
            let scale = cx.config.input_scales.get(&id).copied().unwrap_or(1.0);
            updated += set_scale(model, id, scale)? as usize;
        }

        for stage in topological_order(model)? {
            let node = model.stage(stage);
            if node.category() == StageCategory::Special {
                let scale = node
                    .inputs()
                    .first()
                    .map(|id| model.data(*id).scale())
                    .unwrap_or(1.0);
                for id in node.outputs().to_vec() {
                    updated += set_scale(model, id, scale)? as usize;
                }
                continue;
            }

            let current: DataMap<f32> = node
                .inputs()
                .iter()
                .map(|id| (*id, model.data(*id).scale()))
                .collect();
            let step = select_step(model, &current, cx);
            let answer = model.propagate_scale_factors(stage, &current, step)?;
            trace!(stage = model.stage(stage).name(), ?step, ?answer, "scales answered");

            for (id, scale) in answer {
                if let Some(&before) = current.get(&id) {
                    if before != scale {
                        adopt_input_scale(model, stage, id, before, scale)?;
                        updated += 1;
                    }
                } else {
                    updated += set_scale(model, id, scale)? as usize;
                }
            }
        }
        Ok(PassResult::changed(updated))
    }
}

fn select_step(model: &Model, current: &DataMap<f32>, cx: &PassContext) -> ScalePropagationStep {
    let reads_configured_input = current.keys().any(|id| {
        model.data(*id).usage() == DataUsage::Input && cx.config.input_scales.contains_key(id)
    });
    if reads_configured_input {
        ScalePropagationStep::ScaleInput
    } else if current.values().all(|scale| *scale == 1.0) {
        ScalePropagationStep::Check
    } else {
        ScalePropagationStep::Propagate
    }
}

fn set_scale(model: &mut Model, id: DataId, scale: f32) -> CompileResult<bool> {
    let data = model.data_mut(id)?;
    if data.scale == scale {
        return Ok(false);
    }
    data.scale = scale;
    Ok(true)
}

/// A stage asked for an input at a different scale. Only a network input read by that stage
/// alone can be rescaled in place; anything else would need a rescaling stage.
fn adopt_input_scale(
    model: &mut Model,
    stage: StageId,
    id: DataId,
    current: f32,
    requested: f32,
) -> CompileResult<()> {
    let data = model.data(id);
    let sole_reader = data.consumers() == [stage];
    if data.usage() == DataUsage::Input && sole_reader {
        set_scale(model, id, requested)?;
        return Ok(());
    }
    Err(NegotiationError::ScaleMismatch {
        data: data.name().to_string(),
        stage: model.stage(stage).name().to_string(),
        current,
        requested,
    }
    .into())
}
