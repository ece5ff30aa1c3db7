use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    BatchSupportPass, DataOrderPropagationPass, FinalCheckPass, FinalizeLayoutPass, ModelPass,
    PassContext, PassResult, ScalePropagationPass, SerializePass, StridesNegotiationPass,
    ValidateStructurePass,
};
use crate::compile::CompileConfig;
use crate::error::{CompileResult, NegotiationError};
use crate::model::Model;

pub(crate) enum Step {
    Pass(Arc<dyn ModelPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

impl Step {
    fn describe(&self, names: &mut Vec<&'static str>) {
        match self {
            Step::Pass(pass) => names.push(pass.name()),
            Step::FixedPoint { steps, .. } => steps.iter().for_each(|s| s.describe(names)),
        }
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn ModelPass>) {
        self.steps.push(Step::Pass(pass));
    }

    /// Repeats the steps built by `build` until none of them changes the model. Still changing
    /// after `max_iters` rounds is a [`NegotiationError::NotConverged`].
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}

pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// The standard lowering pipeline, from structural validation to blob serialization.
    pub fn standard(config: &CompileConfig) -> Self {
        let mut builder = PipelineBuilder::new();
        builder.pass(Arc::new(ValidateStructurePass));
        if config.propagate_scales {
            builder.pass(Arc::new(ScalePropagationPass));
        }
        builder.pass(Arc::new(DataOrderPropagationPass));
        builder.fixed_point(config.negotiation_max_iters, |p| {
            p.pass(Arc::new(StridesNegotiationPass));
        });
        builder.pass(Arc::new(BatchSupportPass));
        builder.pass(Arc::new(FinalizeLayoutPass));
        builder.pass(Arc::new(FinalCheckPass));
        builder.pass(Arc::new(SerializePass));
        builder.finish()
    }

    pub fn run(&self, model: &mut Model, cx: &mut PassContext) -> CompileResult<PassResult> {
        let mut totals = PassResult::default();
        let log_stats = cx.config.log_pass_stats;
        run_steps(&self.steps, model, cx, &mut totals, log_stats)?;
        Ok(totals)
    }
}

fn run_steps(
    steps: &[Step],
    model: &mut Model,
    cx: &mut PassContext,
    totals: &mut PassResult,
    log_stats: bool,
) -> CompileResult<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(model, cx)?;
                debug!(
                    pass = pass.name(),
                    changed = stats.changed,
                    updated_data = stats.updated_data,
                    "pass finished"
                );
                if log_stats {
                    info!(
                        model = model.name(),
                        pass = pass.name(),
                        changed = stats.changed,
                        updated_data = stats.updated_data,
                        stages = model.num_stages(),
                        "pass stats"
                    );
                }
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, model, cx, &mut local, log_stats)?;
                    local.iterations += 1;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        debug!(iterations = iter, "fixed point converged");
                        break;
                    }
                    if iter >= *max_iters {
                        let mut names = Vec::new();
                        step.describe(&mut names);
                        let passes = names.join(", ");
                        warn!(%passes, iterations = iter, "fixed point hit its iteration cap");
                        return Err(NegotiationError::NotConverged {
                            passes,
                            iterations: iter,
                        }
                        .into());
                    }
                }
            }
        }
    }
    Ok(changed_any)
}
