use tracing::trace;

use super::{ModelPass, PassContext, PassResult};
use crate::error::{CompileResult, ContractViolation};
use crate::model::{topological_order, Model};

/// Derives every produced tensor's memory order from its producer's inputs.
#[derive(Default)]
pub struct DataOrderPropagationPass;

impl DataOrderPropagationPass {
    const NAME: &'static str = "propagate-data-order";
}

impl ModelPass for DataOrderPropagationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, _cx: &mut PassContext) -> CompileResult<PassResult> {
        let mut updated = 0usize;
        for stage in topological_order(model)? {
            let orders = model.propagate_data_order(stage)?;
            for (id, order) in orders {
                let data = model.data_mut(id)?;
                if !order.covers(data.desc().dims()) {
                    return Err(ContractViolation::DataInvariant {
                        data: data.name().to_string(),
                        message: format!(
                            "order {order} does not cover dims {}",
                            data.desc().dims()
                        ),
                    }
                    .into());
                }
                if data.order != order {
                    trace!(data = data.name(), from = %data.order, to = %order, "order updated");
                    data.order = order;
                    updated += 1;
                }
            }
        }
        Ok(PassResult::changed(updated))
    }
}
