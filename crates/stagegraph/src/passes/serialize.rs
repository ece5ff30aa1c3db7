use tracing::{debug, trace};

use super::{ModelPass, PassContext, PassResult};
use crate::blob::BlobSerializer;
use crate::error::CompileResult;
use crate::model::{topological_order, Model};
use crate::stages::StageCategory;

/// Writes one blob record per executable stage in topological order.
///
/// Special stages are realised by memory aliasing and have no record.
#[derive(Default)]
pub struct SerializePass;

impl SerializePass {
    const NAME: &'static str = "serialize";
}

impl ModelPass for SerializePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, model: &mut Model, cx: &mut PassContext) -> CompileResult<PassResult> {
        let model: &Model = model;
        let mut writer = BlobSerializer::with_header();
        let mut count = 0usize;

        for stage in topological_order(model)? {
            let node = model.stage(stage);
            if node.category() == StageCategory::Special {
                trace!(stage = node.name(), kind = %node.kind(), "special stage skipped");
                continue;
            }
            writer.record(|w| -> CompileResult<()> {
                w.append_u32(node.kind().code());
                w.append_u32(node.category().code());
                w.append_len("input count", node.inputs().len())?;
                w.append_len("output count", node.outputs().len())?;
                model.serialize_params(stage, w)?;
                model.serialize_data(stage, w)
            })?;
            count += 1;
        }

        let blob = writer.finish(count)?;
        debug!(stages = count, bytes = blob.len(), "blob written");
        cx.blob = Some(blob);
        cx.serialized_stages = count;
        Ok(PassResult::default())
    }
}
