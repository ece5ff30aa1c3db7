use bytes::Bytes;
use tracing::debug;

use crate::env;
use crate::error::CompileResult;
use crate::model::{DataMap, Model};
use crate::passes::{PassContext, PassResult, Pipeline};

/// Default cap on strides-negotiation rounds.
pub const DEFAULT_NEGOTIATION_MAX_ITERS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct CompileConfig {
    pub negotiation_max_iters: usize,
    /// Runs scale-factor propagation before layout passes.
    pub propagate_scales: bool,
    /// Scales applied to network inputs when propagation is enabled.
    pub input_scales: DataMap<f32>,
    pub log_pass_stats: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            negotiation_max_iters: DEFAULT_NEGOTIATION_MAX_ITERS,
            propagate_scales: false,
            input_scales: DataMap::new(),
            log_pass_stats: false,
        }
    }
}

impl CompileConfig {
    /// Defaults overridden by `STAGEGRAPH_NEGOTIATION_MAX_ITERS` and `STAGEGRAPH_PASS_STATS`.
    pub fn from_env() -> Self {
        Self {
            negotiation_max_iters: env::negotiation_max_iters()
                .unwrap_or(DEFAULT_NEGOTIATION_MAX_ITERS),
            log_pass_stats: env::pass_stats_enabled(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub blob: Bytes,
    pub stats: PassResult,
    pub serialized_stages: usize,
}

/// Runs the standard pipeline over `model` and returns the serialized blob.
///
/// The model keeps the negotiated orders, requirements and resolved strides, so it can be
/// inspected (or dumped with [`Model::to_json_string`]) after compilation.
pub fn compile(model: &mut Model, config: CompileConfig) -> CompileResult<CompiledGraph> {
    let pipeline = Pipeline::standard(&config);
    let mut cx = PassContext::new(config);
    let stats = pipeline.run(model, &mut cx)?;
    debug!(
        model = model.name(),
        iterations = stats.iterations,
        updated_data = stats.updated_data,
        serialized_stages = cx.serialized_stages,
        "model compiled"
    );
    Ok(CompiledGraph {
        blob: cx.blob.take().unwrap_or_default(),
        stats,
        serialized_stages: cx.serialized_stages,
    })
}
