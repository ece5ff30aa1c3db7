use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::{DataUsage, Model};
use crate::error::{CompileResult, ContractViolation};
use crate::stages::StageId;

/// Stages in dependency order. Ready stages are released lowest id first, so the order is
/// deterministic for a given construction sequence.
pub fn topological_order(model: &Model) -> CompileResult<Vec<StageId>> {
    let mut pending: Vec<usize> = model
        .stages()
        .map(|stage| {
            stage
                .inputs()
                .iter()
                .filter(|input| model.data(**input).producer().is_some())
                .count()
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<StageId>> = model
        .stages()
        .filter(|stage| pending[stage.id().index()] == 0)
        .map(|stage| Reverse(stage.id()))
        .collect();

    let mut order = Vec::with_capacity(model.num_stages());
    while let Some(Reverse(stage)) = ready.pop() {
        order.push(stage);
        for &output in model.stage(stage).outputs() {
            for &consumer in model.data(output).consumers() {
                // A stage reading the same tensor twice waits on it twice.
                let uses = model
                    .stage(consumer)
                    .inputs()
                    .iter()
                    .filter(|input| **input == output)
                    .count();
                let slot = &mut pending[consumer.index()];
                *slot -= uses;
                if *slot == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }
    }

    if order.len() != model.num_stages() {
        let stuck = model
            .stages()
            .find(|stage| pending[stage.id().index()] > 0)
            .ok_or(ContractViolation::UnknownStage(StageId(order.len() as u32)))?;
        let data = stuck
            .inputs()
            .iter()
            .map(|input| model.data(*input))
            .find(|data| data.producer().is_some())
            .map(|data| data.name().to_string())
            .unwrap_or_default();
        return Err(ContractViolation::Cycle {
            stage: stuck.name().to_string(),
            data,
        }
        .into());
    }
    Ok(order)
}

/// Re-checks every graph invariant the passes rely on.
pub fn validate_structure(model: &Model) -> CompileResult<()> {
    for stage in model.stages() {
        stage.check_arity()?;
        for &input in stage.inputs() {
            let data = model.try_data(input)?;
            if !data.consumers().contains(&stage.id()) {
                return Err(dangling(stage.name(), data.name()));
            }
        }
        for &output in stage.outputs() {
            let data = model.try_data(output)?;
            if data.producer() != Some(stage.id()) {
                return Err(dangling(stage.name(), data.name()));
            }
        }
    }

    for data in model.datas() {
        if let Some(producer) = data.producer() {
            let stage = model.try_stage(producer)?;
            if !stage.outputs().contains(&data.id()) {
                return Err(dangling(stage.name(), data.name()));
            }
        }
        for &consumer in data.consumers() {
            let stage = model.try_stage(consumer)?;
            if !stage.inputs().contains(&data.id()) {
                return Err(dangling(stage.name(), data.name()));
            }
        }

        match (data.usage(), data.producer()) {
            (DataUsage::Input, Some(producer)) => {
                return Err(ContractViolation::ProducedNetworkInput {
                    data: data.name().to_string(),
                    stage: model.stage(producer).name().to_string(),
                }
                .into());
            }
            (DataUsage::Input, None) => {
                if data.consumers().is_empty() {
                    return Err(ContractViolation::OrphanData {
                        data: data.name().to_string(),
                    }
                    .into());
                }
            }
            (_, None) if data.consumers().is_empty() => {
                return Err(ContractViolation::OrphanData {
                    data: data.name().to_string(),
                }
                .into());
            }
            (_, None) => {
                return Err(ContractViolation::MissingProducer {
                    data: data.name().to_string(),
                }
                .into());
            }
            (_, Some(_)) => {}
        }
    }

    topological_order(model).map(|_| ())
}

fn dangling(stage: &str, data: &str) -> crate::error::CompileError {
    ContractViolation::DanglingEdge {
        stage: stage.to_string(),
        data: data.to_string(),
    }
    .into()
}
