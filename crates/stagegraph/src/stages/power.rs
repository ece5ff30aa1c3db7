use std::any::Any;

use super::{
    ensure_same_dims, serialize_edges, ScalePropagationStep, StageContext, StageImpl, StageKind,
};
use crate::blob::BlobSerializer;
use crate::error::CompileResult;
use crate::model::{DataMap, DimStride, DimsOrder, StridesRequirement};

/// `y = (shift + scale * x) ^ power`, applied elementwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerParams {
    pub scale: f32,
    pub shift: f32,
    pub power: f32,
}

impl Default for PowerParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            shift: 0.0,
            power: 1.0,
        }
    }
}

impl PowerParams {
    /// Linear kernels absorb an input scale by rescaling `shift`.
    pub fn commutes_with_scale(&self) -> bool {
        self.power == 1.0
    }
}

#[derive(Debug, Clone)]
pub struct PowerStage {
    params: PowerParams,
}

impl PowerStage {
    pub fn new(params: PowerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PowerParams {
        &self.params
    }
}

impl StageImpl for PowerStage {
    fn kind(&self) -> StageKind {
        StageKind::Power
    }

    fn clone_stage(&self) -> Box<dyn StageImpl> {
        Box::new(self.clone())
    }

    fn propagate_scale_factors(
        &self,
        cx: &StageContext<'_>,
        scales: &DataMap<f32>,
        step: ScalePropagationStep,
    ) -> CompileResult<DataMap<f32>> {
        let input = cx.input(0).id();
        let output = cx.output(0).id();
        let requested = scales.get(&input).copied().unwrap_or(1.0);

        let scale = match step {
            ScalePropagationStep::Check => 1.0,
            _ if self.params.commutes_with_scale() => requested,
            // Non-linear kernels only run on unscaled values; ask for the input to be restored.
            _ => 1.0,
        };

        let mut out = DataMap::new();
        if step != ScalePropagationStep::Propagate || scale != requested {
            out.insert(input, scale);
        }
        out.insert(output, scale);
        Ok(out)
    }

    fn propagate_data_order(&self, cx: &StageContext<'_>) -> CompileResult<DataMap<DimsOrder>> {
        let mut out = DataMap::new();
        out.insert(cx.output(0).id(), cx.input(0).order().clone());
        Ok(out)
    }

    fn data_strides_requirements(
        &self,
        cx: &StageContext<'_>,
    ) -> CompileResult<DataMap<StridesRequirement>> {
        // Vector kernels walk the innermost position densely.
        let dense_inner = StridesRequirement::empty().add(0, DimStride::Compact);

        let mut out = DataMap::new();
        out.insert(cx.input(0).id(), dense_inner);
        out.insert(cx.output(0).id(), dense_inner);
        Ok(out)
    }

    fn final_check(&self, cx: &StageContext<'_>) -> CompileResult<()> {
        ensure_same_dims(cx)?;
        let PowerParams {
            scale,
            shift,
            power,
        } = self.params;
        cx.ensure(
            scale.is_finite() && shift.is_finite() && power.is_finite(),
            || format!("non-finite params scale={scale} shift={shift} power={power}"),
        )
    }

    fn serialize_params(
        &self,
        cx: &StageContext<'_>,
        writer: &mut BlobSerializer,
    ) -> CompileResult<()> {
        // A scaled output `s * y` needs `s * shift` when the input carries the same scale.
        let shift = self.params.shift * cx.output(0).scale();
        writer.append_f32(self.params.scale);
        writer.append_f32(shift);
        writer.append_f32(self.params.power);
        Ok(())
    }

    fn serialize_data(
        &self,
        cx: &StageContext<'_>,
        writer: &mut BlobSerializer,
    ) -> CompileResult<()> {
        serialize_edges(cx, writer)
    }

    fn params(&self) -> &dyn Any {
        &self.params
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
