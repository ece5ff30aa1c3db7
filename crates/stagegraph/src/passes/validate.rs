use super::{ModelPass, PassContext, PassResult};
use crate::error::CompileResult;
use crate::model::{validate_structure, Model};

/// Re-validates the graph the frontend built before any pass mutates it.
#[derive(Default)]
pub struct ValidateStructurePass;

impl ValidateStructurePass {
    const NAME: &'static str = "validate-structure";
}

impl ModelPass for ValidateStructurePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, _cx: &mut PassContext) -> CompileResult<PassResult> {
        validate_structure(model)?;
        Ok(PassResult::default())
    }
}
