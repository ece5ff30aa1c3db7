use stagegraph::model::MAX_DIMS;
use stagegraph::passes::{PassContext, StridesNegotiationPass};
use stagegraph::{
    compile, CompileConfig, CompileError, CopyMode, CopyParams, CopyStage, DataDesc, DataId,
    DataType, Dim, DimStride, DimValues, Model, ModelPass, NegotiationError, StageBuilder,
    StageId, StridesRequirement,
};

struct ExpandFixture {
    model: Model,
    a: DataId,
    b: DataId,
    expand: StageId,
    strided_sink: StageId,
    plain_sink: StageId,
}

fn desc(h: usize) -> DataDesc {
    DataDesc::new(DataType::Fp16, [(Dim::C, 2), (Dim::H, h), (Dim::W, 4)])
}

/// `a -> expand -> b -> {strided_sink, plain_sink}`; the strided sink wants a padded `W` and
/// a compact `C` on `b`.
fn expand_fixture(sink_demand: StridesRequirement) -> ExpandFixture {
    let mut model = Model::new("expand");
    let a = model.add_input("a", desc(4));
    let b = model.add_data("b", desc(8));
    let c = model.add_data("c", desc(8));
    let d = model.add_data("d", desc(8));

    let expand = StageBuilder::add_expand_stage(
        &mut model,
        "expand",
        None,
        &[a],
        &[b],
        DimValues::from([(Dim::H, 2)]),
    )
    .expect("expand stage");
    let strided_sink = StageBuilder::add_copy_stage(
        &mut model,
        "strided_sink",
        None,
        &[b],
        &[c],
        CopyParams {
            input_strides: sink_demand,
            output_strides: StridesRequirement::empty(),
        },
    )
    .expect("strided sink");
    let plain_sink = StageBuilder::add_copy_stage(
        &mut model,
        "plain_sink",
        None,
        &[b],
        &[d],
        CopyParams::default(),
    )
    .expect("plain sink");
    model.mark_output(c).expect("mark c");
    model.mark_output(d).expect("mark d");

    ExpandFixture {
        model,
        a,
        b,
        expand,
        strided_sink,
        plain_sink,
    }
}

fn padded_w_compact_c() -> StridesRequirement {
    StridesRequirement::empty()
        .add(0, DimStride::Fixed(4))
        .add(2, DimStride::Compact)
}

#[test]
fn consumer_stride_demand_reaches_expand_input() -> anyhow::Result<()> {
    let mut fx = expand_fixture(padded_w_compact_c());
    let compiled = compile(&mut fx.model, CompileConfig::default())?;

    let a = fx.model.data(fx.a);
    let b = fx.model.data(fx.b);
    assert_eq!(a.requirement_for(Dim::W), DimStride::Fixed(4));
    assert_eq!(b.requirement_for(Dim::W), DimStride::Fixed(4));
    assert_eq!(a.requirement_for(Dim::H), DimStride::Any);
    assert_eq!(b.requirement_for(Dim::H), DimStride::Any);

    // Two rounds: one that tightens, one that observes no change.
    assert_eq!(compiled.stats.iterations, 2);
    assert_eq!(compiled.serialized_stages, 2);
    Ok(())
}

#[test]
fn positions_past_first_widened_axis_stay_unconstrained() -> anyhow::Result<()> {
    let mut fx = expand_fixture(padded_w_compact_c());
    compile(&mut fx.model, CompileConfig::default())?;

    let a = fx.model.data(fx.a);
    let b = fx.model.data(fx.b);
    assert_eq!(b.requirement_for(Dim::C), DimStride::Compact);
    assert_eq!(a.requirement_for(Dim::C), DimStride::Any);

    let a_strides = a.strides().expect("a resolved");
    let b_strides = b.strides().expect("b resolved");
    assert_eq!(a_strides.get(Dim::W), Some(4));
    assert_eq!(a_strides.get(Dim::H), Some(16));
    assert_eq!(a_strides.get(Dim::C), Some(64));
    assert_eq!(b_strides.get(Dim::W), Some(4));
    assert_eq!(b_strides.get(Dim::H), Some(16));
    assert_eq!(b_strides.get(Dim::C), Some(128));
    Ok(())
}

#[test]
fn padded_w_alone_leaves_outer_positions_free() -> anyhow::Result<()> {
    let mut fx = expand_fixture(StridesRequirement::empty().add(0, DimStride::Fixed(4)));
    compile(&mut fx.model, CompileConfig::default())?;

    for id in [fx.a, fx.b] {
        let data = fx.model.data(id);
        assert_eq!(data.requirement_for(Dim::W), DimStride::Fixed(4));
        for pos in 1..MAX_DIMS {
            assert_eq!(
                data.required_strides().get(pos),
                DimStride::Any,
                "{} position {pos}",
                data.name()
            );
        }
    }
    Ok(())
}

#[test]
fn padded_buffers_select_strided_copies() -> anyhow::Result<()> {
    let mut fx = expand_fixture(padded_w_compact_c());
    compile(&mut fx.model, CompileConfig::default())?;

    for sink in [fx.strided_sink, fx.plain_sink] {
        let stage = fx.model.stage_impl::<CopyStage>(sink)?;
        assert_eq!(stage.mode(), Some(CopyMode::Strided));
    }
    Ok(())
}

#[test]
fn negotiation_is_idempotent() -> anyhow::Result<()> {
    let mut fx = expand_fixture(padded_w_compact_c());
    compile(&mut fx.model, CompileConfig::default())?;
    let before: Vec<_> = fx
        .model
        .datas()
        .map(|data| *data.required_strides())
        .collect();

    let mut cx = PassContext::new(CompileConfig::default());
    let rerun = StridesNegotiationPass.run(&mut fx.model, &mut cx)?;
    let after: Vec<_> = fx
        .model
        .datas()
        .map(|data| *data.required_strides())
        .collect();

    assert!(!rerun.changed);
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn expand_query_is_repeatable() -> anyhow::Result<()> {
    let fx = expand_fixture(padded_w_compact_c());
    let first = fx.model.data_strides_requirements(fx.expand)?;
    let second = fx.model.data_strides_requirements(fx.expand)?;
    assert_eq!(first, second);
    assert_eq!(first[&fx.a].get(0), DimStride::Fixed(4));
    assert_eq!(first[&fx.a].get(2), DimStride::Any);
    // Outer positions are left to the consumers' own answers.
    assert_eq!(first[&fx.b].get(0), DimStride::Fixed(4));
    assert_eq!(first[&fx.b].get(2), DimStride::Any);
    Ok(())
}

#[test]
fn conflicting_consumers_are_reported_by_expand() {
    let mut fx = expand_fixture(StridesRequirement::empty().add(0, DimStride::Fixed(4)));
    let e = fx.model.add_data("e", desc(8));
    StageBuilder::add_copy_stage(
        &mut fx.model,
        "wide_sink",
        None,
        &[fx.b],
        &[e],
        CopyParams {
            input_strides: StridesRequirement::empty().add(0, DimStride::Fixed(8)),
            output_strides: StridesRequirement::empty(),
        },
    )
    .expect("wide sink");

    let err = fx.model.data_strides_requirements(fx.expand).unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(
        err,
        CompileError::Negotiation(NegotiationError::Conflict {
            ref data,
            dim: Dim::W,
            existing: DimStride::Fixed(4),
            demanded: DimStride::Fixed(8),
            ref existing_source,
            ref demanded_by,
        }) if data == "b" && existing_source == "stage `strided_sink`" && demanded_by == "wide_sink"
    ));
}

#[test]
fn conflicting_consumers_fail_compilation() {
    let mut fx = expand_fixture(StridesRequirement::empty().add(0, DimStride::Fixed(4)));
    let e = fx.model.add_data("e", desc(8));
    StageBuilder::add_copy_stage(
        &mut fx.model,
        "wide_sink",
        None,
        &[fx.b],
        &[e],
        CopyParams {
            input_strides: StridesRequirement::empty().add(0, DimStride::Compact),
            output_strides: StridesRequirement::empty(),
        },
    )
    .expect("wide sink");

    let err = compile(&mut fx.model, CompileConfig::default()).unwrap_err();
    assert!(matches!(
        err.as_negotiation(),
        Some(NegotiationError::Conflict { dim: Dim::W, .. })
    ));
}

#[test]
fn iteration_cap_reports_non_convergence() {
    let mut fx = expand_fixture(padded_w_compact_c());
    let config = CompileConfig {
        negotiation_max_iters: 1,
        ..CompileConfig::default()
    };

    let err = compile(&mut fx.model, config).unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(
        err.as_negotiation(),
        Some(NegotiationError::NotConverged { passes, iterations: 1 }) if passes == "negotiate-strides"
    ));
}

#[test]
fn undersized_fixed_stride_is_infeasible() {
    let mut model = Model::new("infeasible");
    let x = model.add_input("x", DataDesc::new(DataType::Fp16, [(Dim::H, 2), (Dim::W, 4)]));
    let y = model.add_data("y", DataDesc::new(DataType::Fp16, [(Dim::H, 2), (Dim::W, 4)]));
    StageBuilder::add_copy_stage(
        &mut model,
        "copy",
        None,
        &[x],
        &[y],
        CopyParams {
            input_strides: StridesRequirement::empty().add(1, DimStride::Fixed(2)),
            output_strides: StridesRequirement::empty(),
        },
    )
    .expect("copy");

    let err = compile(&mut model, CompileConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        CompileError::Negotiation(NegotiationError::InfeasibleStride {
            dim: Dim::H,
            demanded: 2,
            minimum: 8,
            ..
        })
    ));
}

#[test]
fn expand_without_widening_is_fatal() {
    let mut model = Model::new("flat");
    let a = model.add_input("a", desc(4));
    let b = model.add_data("b", desc(4));
    let expand = StageBuilder::add_expand_stage(
        &mut model,
        "expand",
        None,
        &[a],
        &[b],
        DimValues::new(),
    )
    .expect("expand");

    let err = model.data_strides_requirements(expand).unwrap_err();
    assert!(err.is_fatal());
    let err = compile(&mut model, CompileConfig::default()).unwrap_err();
    assert!(err.is_fatal());
}

/// `x` feeds `padded` (W and H demands) and `wide` (H only); the backward round visits `wide`
/// first, so `padded` conflicts on H after its W demand would already have fit.
fn rejected_demand_model() -> (Model, DataId) {
    let mut model = Model::new("partial");
    let shape = DataDesc::new(DataType::Fp16, [(Dim::H, 4), (Dim::W, 4)]);
    let x = model.add_input("x", shape.clone());
    let y = model.add_data("y", shape.clone());
    let z = model.add_data("z", shape);
    StageBuilder::add_copy_stage(
        &mut model,
        "padded",
        None,
        &[x],
        &[y],
        CopyParams {
            input_strides: StridesRequirement::empty()
                .add(0, DimStride::Fixed(4))
                .add(1, DimStride::Fixed(32)),
            output_strides: StridesRequirement::empty(),
        },
    )
    .expect("padded");
    StageBuilder::add_copy_stage(
        &mut model,
        "wide",
        None,
        &[x],
        &[z],
        CopyParams {
            input_strides: StridesRequirement::empty().add(1, DimStride::Fixed(64)),
            output_strides: StridesRequirement::empty(),
        },
    )
    .expect("wide");
    (model, x)
}

#[test]
fn rejected_demand_leaves_requirement_untouched() {
    let (mut model, x) = rejected_demand_model();
    let mut cx = PassContext::new(CompileConfig::default());

    let err = StridesNegotiationPass.run(&mut model, &mut cx).unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(
        *model.data(x).required_strides(),
        StridesRequirement::empty().add(1, DimStride::Fixed(64))
    );
    assert_eq!(model.data(x).requirement_for(Dim::W), DimStride::Any);
}

#[test]
fn pass_conflict_names_both_stages() {
    let (mut model, _) = rejected_demand_model();
    let mut cx = PassContext::new(CompileConfig::default());

    let err = StridesNegotiationPass.run(&mut model, &mut cx).unwrap_err();
    assert!(matches!(
        err.as_negotiation(),
        Some(NegotiationError::Conflict {
            data,
            dim: Dim::H,
            existing: DimStride::Fixed(64),
            demanded: DimStride::Fixed(32),
            existing_source,
            demanded_by,
        }) if data == "x" && existing_source == "stage `wide`" && demanded_by == "padded"
    ));
}
