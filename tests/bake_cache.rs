use lamina::{
    BakeCache, BlendLibrary, LaminaResult, LayerKind, Rasterizer, compile,
    dsl::{constant_material, scalar_channels},
    graph::Fragment,
    model::LayerStack,
};

struct FlatRaster;

impl Rasterizer for FlatRaster {
    fn rasterize(
        &mut self,
        _fragment: &Fragment,
        resolution: (u32, u32),
    ) -> LaminaResult<image::Rgba32FImage> {
        Ok(image::Rgba32FImage::new(resolution.0, resolution.1))
    }
}

struct RefusingRaster;

impl Rasterizer for RefusingRaster {
    fn rasterize(
        &mut self,
        _fragment: &Fragment,
        _resolution: (u32, u32),
    ) -> LaminaResult<image::Rgba32FImage> {
        Err(lamina::LaminaError::bake("collaborator offline"))
    }
}

const RES: (u32, u32) = (16, 16);

fn fixture() -> (LayerStack, String) {
    let mut stack = LayerStack::new(
        scalar_channels(&["Metallic", "Roughness"]),
        constant_material(&[("Metallic", 0.0), ("Roughness", 0.5)]),
    )
    .unwrap();
    let id = stack
        .add_layer(
            "Paint",
            LayerKind::MaterialFill,
            1,
            constant_material(&[("Metallic", 1.0), ("Roughness", 0.9)]),
        )
        .unwrap();
    (stack, id)
}

#[test]
fn factor_edits_stay_live_while_baked() {
    let (mut stack, id) = fixture();
    let lib = BlendLibrary::new();
    let mut bakes = BakeCache::new();
    bakes
        .bake_layer(&mut stack, &id, &mut FlatRaster, RES)
        .unwrap();

    let baked = compile(&stack, &lib, &bakes).unwrap();
    stack.set_opacity(&id, 0.5).unwrap();
    let after_opacity = compile(&stack, &lib, &bakes).unwrap();
    assert_ne!(
        after_opacity.channel("Roughness").unwrap().fingerprint,
        baked.channel("Roughness").unwrap().fingerprint
    );
}

#[test]
fn material_edits_are_invisible_until_the_bake_is_freed() {
    let (mut stack, id) = fixture();
    let lib = BlendLibrary::new();
    let mut bakes = BakeCache::new();
    bakes
        .bake_layer(&mut stack, &id, &mut FlatRaster, RES)
        .unwrap();
    let baked = compile(&stack, &lib, &bakes).unwrap();

    stack
        .set_material(
            &id,
            constant_material(&[("Metallic", 0.2), ("Roughness", 0.1)]),
        )
        .unwrap();
    let edited = compile(&stack, &lib, &bakes).unwrap();
    assert_eq!(edited.fingerprint(), baked.fingerprint());
    assert!(bakes.is_stale(&stack, &id));

    bakes.free_bake_layer(&mut stack, &id).unwrap();
    let freed = compile(&stack, &lib, &bakes).unwrap();
    assert_ne!(freed.fingerprint(), baked.fingerprint());
}

#[test]
fn failed_bake_rolls_back_and_leaves_live_graphs_active() {
    let (mut stack, id) = fixture();
    let lib = BlendLibrary::new();
    let mut bakes = BakeCache::new();
    let live = compile(&stack, &lib, &bakes).unwrap();

    assert!(bakes
        .bake_layer(&mut stack, &id, &mut RefusingRaster, RES)
        .is_err());
    assert!(bakes.layer_record(&id).is_none());

    let after = compile(&stack, &lib, &bakes).unwrap();
    assert_eq!(after.fingerprint(), live.fingerprint());
}

#[test]
fn bake_marks_carried_channels_dirty() {
    let (mut stack, id) = fixture();
    let mut bakes = BakeCache::new();
    stack.take_dirty();

    bakes
        .bake_layer(&mut stack, &id, &mut FlatRaster, RES)
        .unwrap();
    let dirty = stack.take_dirty();
    assert!(dirty.channels.contains("Metallic"));
    assert!(dirty.channels.contains("Roughness"));
}
