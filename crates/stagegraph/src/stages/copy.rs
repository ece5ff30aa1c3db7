use std::any::Any;

use super::{
    ensure_same_dims, serialize_edges, ScalePropagationStep, StageContext, StageImpl, StageKind,
};
use crate::blob::BlobSerializer;
use crate::error::CompileResult;
use crate::model::{Data, DataMap, DimsOrder, StridesRequirement};

/// DMA descriptor constraints for each side of the transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyParams {
    pub input_strides: StridesRequirement,
    pub output_strides: StridesRequirement,
}

/// Transfer shape chosen once strides are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Both sides are dense; one linear burst moves the whole tensor.
    Linear,
    /// At least one side is padded; the DMA walks every position.
    Strided,
}

impl CopyMode {
    pub fn code(self) -> u32 {
        match self {
            CopyMode::Linear => 0,
            CopyMode::Strided => 1,
        }
    }
}

/// DMA transfer between two buffers of equal shape.
///
/// Unlike Special stages the copy is executed, and moving bytes leaves their scale intact, so
/// scale factors pass through it instead of being refused.
#[derive(Debug, Clone)]
pub struct CopyStage {
    params: CopyParams,
    mode: Option<CopyMode>,
}

impl CopyStage {
    pub fn new(params: CopyParams) -> Self {
        Self { params, mode: None }
    }

    pub fn params(&self) -> &CopyParams {
        &self.params
    }

    /// Transfer mode recorded by layout finalization.
    pub fn mode(&self) -> Option<CopyMode> {
        self.mode
    }
}

fn is_dense(data: &Data) -> bool {
    data.strides() == Some(&data.compact_strides())
}

impl StageImpl for CopyStage {
    fn kind(&self) -> StageKind {
        StageKind::Copy
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
        let scale = match step {
            ScalePropagationStep::Check => 1.0,
            ScalePropagationStep::ScaleInput | ScalePropagationStep::Propagate => {
                scales.get(&input).copied().unwrap_or(1.0)
            }
        };

        let mut out = DataMap::new();
        if step != ScalePropagationStep::Propagate {
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
        let mut out = DataMap::new();
        out.insert(cx.input(0).id(), self.params.input_strides);
        out.insert(cx.output(0).id(), self.params.output_strides);
        Ok(out)
    }

    fn finalize_data_layout(&mut self, inputs: &[&Data], outputs: &[&Data]) -> CompileResult<()> {
        let dense = inputs.iter().chain(outputs).all(|data| is_dense(data));
        self.mode = Some(if dense {
            CopyMode::Linear
        } else {
            CopyMode::Strided
        });
        Ok(())
    }

    fn final_check(&self, cx: &StageContext<'_>) -> CompileResult<()> {
        ensure_same_dims(cx)?;
        cx.ensure(self.mode.is_some(), || {
            "transfer mode was never finalized".to_string()
        })
    }

    fn serialize_params(
        &self,
        cx: &StageContext<'_>,
        writer: &mut BlobSerializer,
    ) -> CompileResult<()> {
        let mode = self
            .mode
            .ok_or_else(|| cx.assertion("serialized before layout finalization"))?;
        let input = cx.input(0);
        let bytes = input.desc().total_elements() * input.desc().dtype().size_in_bytes();
        writer.append_u32(mode.code());
        writer.append_len("copy byte count", bytes)?;
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
