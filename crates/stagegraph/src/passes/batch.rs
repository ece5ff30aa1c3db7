use super::{ModelPass, PassContext, PassResult};
use crate::error::CompileResult;
use crate::model::{BatchSupport, DataMap, Model};

/// A tensor stays splittable only if every stage touching it agrees.
#[derive(Default)]
pub struct BatchSupportPass;

impl BatchSupportPass {
    const NAME: &'static str = "batch-support";
}

impl ModelPass for BatchSupportPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, _cx: &mut PassContext) -> CompileResult<PassResult> {
        let mut support: DataMap<BatchSupport> = model
            .datas()
            .map(|data| (data.id(), BatchSupport::Split))
            .collect();
        let stage_ids: Vec<_> = model.stages().map(|stage| stage.id()).collect();
        for stage in stage_ids {
            for (id, info) in model.batch_support_info(stage)? {
                if info == BatchSupport::Whole {
                    support.insert(id, BatchSupport::Whole);
                }
            }
        }

        let mut updated = 0usize;
        for (id, batch) in support {
            let data = model.data_mut(id)?;
            if data.batch != batch {
                data.batch = batch;
                updated += 1;
            }
        }
        Ok(PassResult::changed(updated))
    }
}
