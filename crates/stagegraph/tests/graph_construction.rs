use stagegraph::{
    validate_structure, CompileError, ContractViolation, CopyParams, DataDesc, DataType, Dim,
    DimStride, DimValues, DimsOrder, LayerOrigin, Model, PowerParams, StageBuilder, StageKind,
    StridesRequirement,
};

fn vec_desc(w: usize) -> DataDesc {
    DataDesc::new(DataType::Fp32, [(Dim::W, w)])
}

#[test]
fn expand_with_two_inputs_is_rejected() {
    let mut model = Model::new("arity");
    let a = model.add_input("a", vec_desc(4));
    let b = model.add_input("b", vec_desc(4));
    let out = model.add_data("out", vec_desc(8));

    let err = StageBuilder::add_expand_stage(
        &mut model,
        "expand",
        None,
        &[a, b],
        &[out],
        DimValues::new(),
    )
    .unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err,
        CompileError::Contract(ContractViolation::Arity {
            kind: StageKind::Expand,
            expected_inputs: 1,
            expected_outputs: 1,
            inputs: 2,
            outputs: 1,
            ..
        })
    ));
    assert_eq!(model.num_stages(), 0);
    assert!(model.data(a).consumers().is_empty());
    assert_eq!(model.data(out).producer(), None);
}

#[test]
fn closing_a_loop_is_rejected() {
    let mut model = Model::new("loop");
    let a = model.add_data("a", vec_desc(4));
    let b = model.add_data("b", vec_desc(4));
    let c = model.add_data("c", vec_desc(4));
    StageBuilder::add_copy_stage(&mut model, "ab", None, &[a], &[b], CopyParams::default())
        .expect("ab");
    StageBuilder::add_copy_stage(&mut model, "bc", None, &[b], &[c], CopyParams::default())
        .expect("bc");

    let err = StageBuilder::add_copy_stage(&mut model, "ca", None, &[c], &[a], CopyParams::default())
        .unwrap_err();

    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::Cycle { stage, .. }) if stage == "ca"
    ));
    assert_eq!(model.num_stages(), 2);
    assert!(model.data(c).consumers().is_empty());
    assert_eq!(model.data(a).producer(), None);
}

#[test]
fn self_loop_is_rejected() {
    let mut model = Model::new("self");
    let a = model.add_data("a", vec_desc(4));
    let err = StageBuilder::add_power_stage(
        &mut model,
        "square",
        None,
        &[a],
        &[a],
        PowerParams::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::Cycle { .. })
    ));
}

#[test]
fn second_producer_is_rejected() {
    let mut model = Model::new("producers");
    let x = model.add_input("x", vec_desc(4));
    let y = model.add_data("y", vec_desc(4));
    StageBuilder::add_copy_stage(&mut model, "first", None, &[x], &[y], CopyParams::default())
        .expect("first");

    let err = StageBuilder::add_copy_stage(&mut model, "second", None, &[x], &[y], CopyParams::default())
        .unwrap_err();
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::MultipleProducers { data, producer }) if data == "y" && producer == "first"
    ));
    assert_eq!(model.data(x).consumers().len(), 1);
}

#[test]
fn network_input_cannot_be_produced() {
    let mut model = Model::new("inputs");
    let x = model.add_input("x", vec_desc(4));
    let z = model.add_input("z", vec_desc(4));

    let err = StageBuilder::add_copy_stage(&mut model, "copy", None, &[x], &[z], CopyParams::default())
        .unwrap_err();
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::ProducedNetworkInput { .. })
    ));
    assert!(model.mark_output(z).is_err());
}

#[test]
fn consumers_keep_wiring_order() {
    let mut model = Model::new("fanout");
    let x = model.add_input("x", vec_desc(4));
    let outs: Vec<_> = (0..3)
        .map(|idx| model.add_data(format!("y{idx}"), vec_desc(4)))
        .collect();
    let stages: Vec<_> = outs
        .iter()
        .enumerate()
        .map(|(idx, out)| {
            StageBuilder::add_copy_stage(
                &mut model,
                format!("copy{idx}"),
                None,
                &[x],
                &[*out],
                CopyParams::default(),
            )
            .expect("copy")
        })
        .collect();

    assert_eq!(model.data(x).consumers(), stages.as_slice());
    validate_structure(&model).expect("valid fan-out");
}

#[test]
fn typed_params_read_back_and_reject_wrong_type() {
    let mut model = Model::new("params");
    let x = model.add_input("x", vec_desc(4));
    let y = model.add_data("y", vec_desc(4));
    let params = PowerParams {
        scale: 2.0,
        shift: 0.5,
        power: 3.0,
    };
    let stage = StageBuilder::add_power_stage(
        &mut model,
        "cube",
        Some(LayerOrigin::new("layer7", "Power")),
        &[x],
        &[y],
        params,
    )
    .expect("power");

    assert_eq!(model.stage_params::<PowerParams>(stage).expect("params"), &params);
    assert_eq!(model.stage(stage).origin().map(|o| o.name.as_str()), Some("layer7"));

    let err = model.stage_params::<CopyParams>(stage).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::ParamsMismatch { stage, .. }) if stage == "cube"
    ));
}

#[test]
fn detached_clone_rewires_with_same_params() {
    let mut model = Model::new("clone");
    let x = model.add_input("x", vec_desc(4));
    let y = model.add_data("y", vec_desc(4));
    let z = model.add_data("z", vec_desc(4));
    let params = CopyParams {
        input_strides: StridesRequirement::empty(),
        output_strides: StridesRequirement::empty().add(0, DimStride::Compact),
    };
    let original =
        StageBuilder::add_copy_stage(&mut model, "copy", None, &[x], &[y], params).expect("copy");

    let detached = model.detach_clone(original).expect("detach");
    assert_eq!(detached.kind(), StageKind::Copy);
    assert_eq!(detached.name(), "copy");
    let clone = StageBuilder::add_cloned_stage(&mut model, "copy_again", detached, &[y], &[z])
        .expect("clone");

    assert_eq!(model.stage(clone).inputs(), &[y]);
    assert_eq!(model.stage(clone).outputs(), &[z]);
    assert_eq!(model.stage_params::<CopyParams>(clone).expect("params"), &params);
    assert_eq!(model.data(y).consumers(), &[clone]);
}

#[test]
fn unknown_handles_are_rejected() {
    let mut model = Model::new("handles");
    let x = model.add_input("x", vec_desc(4));
    let mut other = Model::new("other");
    other.add_input("a", vec_desc(4));
    let foreign = other.add_data("b", vec_desc(4));

    let err = StageBuilder::add_copy_stage(&mut model, "copy", None, &[x], &[foreign], CopyParams::default())
        .unwrap_err();
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::UnknownData(id)) if *id == foreign
    ));
}

#[test]
fn input_order_flows_to_produced_tensors() -> anyhow::Result<()> {
    let mut model = Model::new("order");
    let desc = DataDesc::new(DataType::Fp16, [(Dim::C, 3), (Dim::H, 2), (Dim::W, 2)]);
    let x = model.add_input("x", desc.clone());
    let y = model.add_data("y", desc);
    model.set_input_order(x, "HWC".parse::<DimsOrder>()?)?;
    StageBuilder::add_copy_stage(&mut model, "copy", None, &[x], &[y], CopyParams::default())?;

    stagegraph::compile(&mut model, stagegraph::CompileConfig::default())?;

    assert_eq!(model.data(y).order().to_string(), "HWC");
    assert_eq!(model.data(y).order().dim_at(0), Some(Dim::C));
    Ok(())
}

#[test]
fn input_order_must_cover_its_axes() {
    let mut model = Model::new("order");
    let x = model.add_input("x", vec_desc(4));
    let err = model
        .set_input_order(x, "HW".parse::<DimsOrder>().expect("order"))
        .unwrap_err();
    assert!(matches!(
        err.as_contract(),
        Some(ContractViolation::DataInvariant { .. })
    ));
}
