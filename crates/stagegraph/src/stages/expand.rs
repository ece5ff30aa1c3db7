//! Layout-widening stage.
//!
//! The output is larger than the input along one or more axes and the input is placed inside
//! it at `offset`. The stage is realised by allocating the input as a view into the output, so
//! both tensors share memory up to the outermost position whose extent still matches.

use std::any::Any;

use tracing::trace;

use super::{ScalePropagationStep, StageContext, StageImpl, StageKind};
use crate::blob::BlobSerializer;
use crate::error::{CompileResult, NegotiationError};
use crate::model::{Data, DataMap, DimValues, DimsOrder, StridesRequirement, MAX_DIMS};

/// Placement of the input inside the widened output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandParams {
    pub offset: DimValues,
}

#[derive(Debug, Clone)]
pub struct ExpandStage {
    params: ExpandParams,
}

impl ExpandStage {
    pub fn new(params: ExpandParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ExpandParams {
        &self.params
    }
}

/// Smallest output-order position whose extent differs between input and output.
pub(crate) fn min_expand_position(input: &Data, output: &Data) -> Option<usize> {
    let order = output.order();
    output
        .desc()
        .dims()
        .iter()
        .filter(|(dim, extent)| input.desc().dim(*dim) != Some(*extent))
        .filter_map(|(dim, _)| order.dim_ind(dim))
        .min()
}

impl StageImpl for ExpandStage {
    fn kind(&self) -> StageKind {
        StageKind::Expand
    }

    fn clone_stage(&self) -> Box<dyn StageImpl> {
        Box::new(self.clone())
    }

    fn propagate_scale_factors(
        &self,
        cx: &StageContext<'_>,
        _scales: &DataMap<f32>,
        _step: ScalePropagationStep,
    ) -> CompileResult<DataMap<f32>> {
        Err(cx.must_never_be_called("propagate_scale_factors"))
    }

    fn propagate_data_order(&self, cx: &StageContext<'_>) -> CompileResult<DataMap<DimsOrder>> {
        let input = cx.input(0);
        let output = cx.output(0);

        let mut out = DataMap::new();
        out.insert(output.id(), input.order().clone());
        Ok(out)
    }

    fn data_strides_requirements(
        &self,
        cx: &StageContext<'_>,
    ) -> CompileResult<DataMap<StridesRequirement>> {
        let input = cx.input(0);
        let output = cx.output(0);
        let order = output.order();

        let d_min = min_expand_position(input, output).ok_or_else(|| {
            cx.assertion(format!(
                "output `{}` {} is not wider than input `{}` {}",
                output.name(),
                output.desc().dims(),
                input.name(),
                input.desc().dims()
            ))
        })?;

        // Past `d_min` the input is no longer a view of the output.
        let mut output_reqs = *output.required_strides();
        let mut input_reqs = output_reqs;
        input_reqs.clear_above(d_min);

        let mut demanded_by: [Option<&str>; MAX_DIMS] = [None; MAX_DIMS];
        for &consumer in output.consumers() {
            let consumer_reqs = cx.stage_requirements(consumer)?;
            let Some(reqs) = consumer_reqs.get(&output.id()) else {
                continue;
            };
            let consumer_name = cx.model().stage(consumer).name();

            for (pos, &dim) in order.dims().iter().enumerate().take(d_min + 1) {
                let demanded = reqs.get(pos);
                match output_reqs.tighten(pos, demanded) {
                    Ok(true) => {
                        input_reqs.set(pos, demanded);
                        demanded_by[pos] = Some(consumer_name);
                        trace!(
                            stage = cx.name(),
                            data = output.name(),
                            %dim,
                            %demanded,
                            consumer = consumer_name,
                            "expand adopted consumer stride"
                        );
                    }
                    Ok(false) => {}
                    Err(conflict) => {
                        let existing_source = match demanded_by[pos] {
                            Some(name) => format!("stage `{name}`"),
                            None => "current requirement".to_string(),
                        };
                        return Err(NegotiationError::Conflict {
                            data: output.name().to_string(),
                            dim,
                            existing: conflict.existing,
                            demanded: conflict.demanded,
                            existing_source,
                            demanded_by: consumer_name.to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        let mut out = DataMap::new();
        out.insert(input.id(), input_reqs);
        out.insert(output.id(), output_reqs);
        Ok(out)
    }

    fn final_check(&self, cx: &StageContext<'_>) -> CompileResult<()> {
        let input = cx.input(0);
        let output = cx.output(0);

        cx.ensure(
            input.desc().dims().len() == output.desc().dims().len(),
            || "input and output must name the same axes".to_string(),
        )?;
        for (dim, out_extent) in output.desc().dims().iter() {
            let in_extent = input
                .desc()
                .dim(dim)
                .ok_or_else(|| cx.assertion(format!("input lacks axis {dim}")))?;
            let offset = self.params.offset.get(dim).unwrap_or(0);
            cx.ensure(offset + in_extent <= out_extent, || {
                format!(
                    "axis {dim}: offset {offset} + input extent {in_extent} exceeds output \
                     extent {out_extent}"
                )
            })?;
        }
        for dim in self.params.offset.dims() {
            cx.ensure(output.desc().dims().has(dim), || {
                format!("offset names axis {dim} absent from output")
            })?;
        }
        cx.ensure(min_expand_position(input, output).is_some(), || {
            "no axis is widened".to_string()
        })
    }

    fn serialize_params(
        &self,
        cx: &StageContext<'_>,
        _writer: &mut BlobSerializer,
    ) -> CompileResult<()> {
        Err(cx.must_never_be_called("serialize_params"))
    }

    fn serialize_data(
        &self,
        cx: &StageContext<'_>,
        _writer: &mut BlobSerializer,
    ) -> CompileResult<()> {
        Err(cx.must_never_be_called("serialize_data"))
    }

    fn params(&self) -> &dyn Any {
        &self.params
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
