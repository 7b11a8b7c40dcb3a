use lamina::{
    BakeCache, BlendLibrary, BlendMode, LayerKind, PackManager, StackSnapshot, compile,
    dsl::{constant_material, scalar_channels, scalar_value_fragment},
    model::LayerStack,
    pack::PaintPurpose,
};

fn three_layer_stack() -> LayerStack {
    let mut stack = LayerStack::new(
        scalar_channels(&["Base Color", "Roughness"]),
        constant_material(&[("Base Color", 0.8), ("Roughness", 0.5)]),
    )
    .unwrap();
    let mid = stack
        .add_layer(
            "Rust",
            LayerKind::MaterialPaint,
            1,
            constant_material(&[("Base Color", 0.4), ("Roughness", 0.9)]),
        )
        .unwrap();
    let top = stack
        .add_layer(
            "Dust",
            LayerKind::MaterialFill,
            2,
            constant_material(&[("Roughness", 0.7)]),
        )
        .unwrap();

    stack.set_blend_mode(&mid, "Roughness", BlendMode::Multiply).unwrap();
    stack.set_blend_mode(&top, "Roughness", BlendMode::Add).unwrap();
    stack
        .set_node_mask(&mid, Some(scalar_value_fragment("Mask", 0.5)))
        .unwrap();
    stack
}

#[test]
fn json_round_trip_preserves_the_compiled_hash() {
    let stack = three_layer_stack();
    let lib = BlendLibrary::new();
    let before = compile(&stack, &lib, &BakeCache::new())
        .unwrap()
        .fingerprint();

    let json = StackSnapshot::capture(&stack, &BakeCache::new(), &PackManager::new())
        .to_json()
        .unwrap();
    let restored = StackSnapshot::from_json(&json).unwrap().restore(&lib).unwrap();

    assert_eq!(restored.compiled.fingerprint(), before);
}

#[test]
fn pack_regions_survive_the_round_trip() {
    let stack = three_layer_stack();
    let mid_id = stack.layers()[1].id.clone();
    let mut pack = PackManager::new();
    let paint = pack
        .acquire(&mid_id, PaintPurpose::PaintedAlpha, (64, 64))
        .unwrap();

    let json = StackSnapshot::capture(&stack, &BakeCache::new(), &pack)
        .to_json()
        .unwrap();
    let restored = StackSnapshot::from_json(&json)
        .unwrap()
        .restore(&BlendLibrary::new())
        .unwrap();

    assert_eq!(
        restored.pack.region(&mid_id, PaintPurpose::PaintedAlpha),
        Some(&paint)
    );
}

#[test]
fn restore_rejects_a_snapshot_that_cannot_compile() {
    let mut stack = three_layer_stack();
    let top_id = stack.top_layer().id.clone();
    stack
        .set_blend_mode(&top_id, "Roughness", BlendMode::Custom("unbound".to_string()))
        .unwrap();

    let json = StackSnapshot::capture(&stack, &BakeCache::new(), &PackManager::new())
        .to_json()
        .unwrap();
    let err = StackSnapshot::from_json(&json)
        .unwrap()
        .restore(&BlendLibrary::new())
        .unwrap_err();
    assert!(matches!(
        err,
        lamina::LaminaError::IncompatibleCustomFragment(_)
    ));
}
