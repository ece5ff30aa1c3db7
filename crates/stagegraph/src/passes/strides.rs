use std::collections::HashMap;

use tracing::trace;

use super::{ModelPass, PassContext, PassResult};
use crate::error::{CompileResult, ContractViolation, NegotiationError};
use crate::model::{topological_order, DataId, Model};

/// One backward round of stride negotiation.
///
/// Stages are visited in reverse topological order so consumer demands reach producers within
/// a round; each stage's answer is merged into its tensors with the tightening rule. A demand
/// is committed whole or not at all. Run it inside a fixed point: expand stages read their
/// consumers' demands, which may only settle in a later round.
#[derive(Default)]
pub struct StridesNegotiationPass;

impl StridesNegotiationPass {
    const NAME: &'static str = "negotiate-strides";
}

impl ModelPass for StridesNegotiationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, _cx: &mut PassContext) -> CompileResult<PassResult> {
        let mut updated = 0usize;
        // Stage that tightened each (data, position) during this round.
        let mut set_by: HashMap<(DataId, usize), String> = HashMap::new();

        for stage in topological_order(model)?.into_iter().rev() {
            let requirements = model.data_strides_requirements(stage)?;
            let stage_name = model.stage(stage).name().to_string();

            for (id, demand) in requirements {
                let data = model.data_mut(id)?;
                if let Some((pos, _)) = demand
                    .concrete()
                    .find(|(pos, _)| *pos >= data.order.num_dims())
                {
                    return Err(ContractViolation::DataInvariant {
                        data: data.name().to_string(),
                        message: format!(
                            "stage `{stage_name}` constrains position {pos} of a {}-axis order",
                            data.order.num_dims()
                        ),
                    }
                    .into());
                }

                let before = data.required_strides;
                let mut merged = before;
                match merged.merge(&demand) {
                    Ok(false) => {}
                    Ok(true) => {
                        for (pos, _) in demand.concrete() {
                            if !before.get(pos).is_concrete() {
                                set_by.insert((id, pos), stage_name.clone());
                            }
                        }
                        data.required_strides = merged;
                        trace!(
                            data = data.name(),
                            stage = stage_name.as_str(),
                            requirement = %data.required_strides,
                            "requirement tightened"
                        );
                        updated += 1;
                    }
                    Err(conflict) => {
                        let dim = data.order.dim_at(conflict.pos).ok_or_else(|| {
                            ContractViolation::DataInvariant {
                                data: data.name().to_string(),
                                message: format!("no axis at position {}", conflict.pos),
                            }
                        })?;
                        let existing_source = match set_by.get(&(id, conflict.pos)) {
                            Some(name) => format!("stage `{name}`"),
                            None => "current requirement".to_string(),
                        };
                        return Err(NegotiationError::Conflict {
                            data: data.name().to_string(),
                            dim,
                            existing: conflict.existing,
                            demanded: conflict.demanded,
                            existing_source,
                            demanded_by: stage_name,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(PassResult::changed(updated))
    }
}
