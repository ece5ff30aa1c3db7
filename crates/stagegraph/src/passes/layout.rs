use tracing::trace;

use super::{ModelPass, PassContext, PassResult};
use crate::error::{CompileResult, NegotiationError};
use crate::model::{topological_order, DataId, Model};

/// Resolves byte strides from the negotiated requirements, then lets stages record decisions
/// that depend on them.
#[derive(Default)]
pub struct FinalizeLayoutPass;

impl FinalizeLayoutPass {
    const NAME: &'static str = "finalize-layout";
}

impl ModelPass for FinalizeLayoutPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, _cx: &mut PassContext) -> CompileResult<PassResult> {
        let ids: Vec<DataId> = model.datas().map(|data| data.id()).collect();
        let mut updated = 0usize;
        for id in ids {
            let data = model.data_mut(id)?;
            let strides = data
                .resolve_strides()
                .map_err(|(dim, demanded, minimum)| NegotiationError::InfeasibleStride {
                    data: data.name().to_string(),
                    dim,
                    demanded,
                    minimum,
                })?;
            trace!(data = data.name(), %strides, "strides resolved");
            if data.strides.as_ref() != Some(&strides) {
                data.strides = Some(strides);
                updated += 1;
            }
        }

        for stage in topological_order(model)? {
            model.finalize_data_layout(stage)?;
        }
        Ok(PassResult::changed(updated))
    }
}
