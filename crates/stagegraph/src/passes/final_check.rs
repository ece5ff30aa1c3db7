use super::{ModelPass, PassContext, PassResult};
use crate::error::{CompileResult, ContractViolation};
use crate::model::{topological_order, Model};

#[derive(Default)]
pub struct FinalCheckPass;

impl FinalCheckPass {
    const NAME: &'static str = "final-check";
}

impl ModelPass for FinalCheckPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, _cx: &mut PassContext) -> CompileResult<PassResult> {
        for stage in topological_order(model)? {
            model.final_check(stage)?;
        }
        for data in model.datas() {
            if let Some(message) = data.layout_violation() {
                return Err(ContractViolation::DataInvariant {
                    data: data.name().to_string(),
                    message,
                }
                .into());
            }
        }
        Ok(PassResult::default())
    }
}
