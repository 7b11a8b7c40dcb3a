//! Alpha resolver.
//!
//! Produces, per layer, the fragment computing the scalar factor fed to
//! that layer's blend operators: `opacity * painted_alpha * node_mask`.
//! All three terms are always wired, in that fixed order, so a live edit
//! to any one of them never requires resynthesizing the other two.

use crate::{
    error::{LaminaError, LaminaResult},
    graph::{Fragment, FragmentOutput, Graph, InputRef, MathOp, NodeKind, OutputRef, ValueType},
    model::{Layer, LayerKind},
};

pub const ALPHA_PORT: &str = "Alpha";

/// Builds the factor fragment for one layer.
///
/// The painted-alpha term is a raster read for paintable kinds, the
/// constant 1 for fill layers, and the layer's own alpha sub-graph for
/// `CustomAlpha` layers (kept nested as a group).
pub fn resolve_alpha(layer: &Layer) -> LaminaResult<Fragment> {
    let mut g = Graph::new();

    let opacity = g.add(NodeKind::Value(layer.opacity));
    let painted = painted_alpha_source(&mut g, layer)?;

    let mask = match &layer.node_mask {
        Some(fragment) => {
            let group = g.add(NodeKind::Group(Box::new(fragment.clone())));
            OutputRef {
                node: group,
                socket: 0,
            }
        }
        None => {
            let one = g.add(NodeKind::Value(1.0));
            OutputRef {
                node: one,
                socket: 0,
            }
        }
    };

    let opacity_x_alpha = g.add(NodeKind::Math(MathOp::Multiply));
    g.connect(
        OutputRef {
            node: opacity,
            socket: 0,
        },
        InputRef {
            node: opacity_x_alpha,
            socket: 0,
        },
    )?;
    g.connect(
        painted,
        InputRef {
            node: opacity_x_alpha,
            socket: 1,
        },
    )?;

    let x_mask = g.add(NodeKind::Math(MathOp::Multiply));
    g.connect(
        OutputRef {
            node: opacity_x_alpha,
            socket: 0,
        },
        InputRef {
            node: x_mask,
            socket: 0,
        },
    )?;
    g.connect(
        mask,
        InputRef {
            node: x_mask,
            socket: 1,
        },
    )?;

    Ok(Fragment {
        graph: g,
        inputs: vec![],
        outputs: vec![FragmentOutput {
            name: ALPHA_PORT.to_string(),
            ty: ValueType::Scalar,
            source: OutputRef {
                node: x_mask,
                socket: 0,
            },
        }],
    })
}

fn painted_alpha_source(g: &mut Graph, layer: &Layer) -> LaminaResult<OutputRef> {
    let node = match layer.kind {
        LayerKind::MaterialPaint | LayerKind::ChannelPaint => match &layer.paint {
            Some(paint) => g.add(NodeKind::PaintSample {
                image: paint.image.clone(),
                channel: paint.channel,
            }),
            // Nothing painted yet: full coverage.
            None => g.add(NodeKind::Value(1.0)),
        },
        LayerKind::MaterialFill => g.add(NodeKind::Value(1.0)),
        LayerKind::CustomAlpha => {
            let fragment = layer.alpha_source.as_ref().ok_or_else(|| {
                LaminaError::synthesis(format!(
                    "CustomAlpha layer '{}' has no alpha source",
                    layer.id
                ))
            })?;
            g.add(NodeKind::Group(Box::new(fragment.clone())))
        }
    };
    Ok(OutputRef { node, socket: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dsl::{constant_material, scalar_channels, scalar_value_fragment},
        model::LayerStack,
        pack::PaintRef,
    };

    fn stack_with_layer(kind: LayerKind) -> (LayerStack, String) {
        let mut stack = LayerStack::new(
            scalar_channels(&["Roughness"]),
            constant_material(&[("Roughness", 0.5)]),
        )
        .unwrap();
        let id = stack
            .add_layer("L", kind, 1, constant_material(&[("Roughness", 1.0)]))
            .unwrap();
        (stack, id)
    }

    #[test]
    fn factor_is_product_of_all_three_terms() {
        let (mut stack, id) = stack_with_layer(LayerKind::MaterialPaint);
        stack.set_opacity(&id, 0.5).unwrap();
        stack
            .set_paint(
                &id,
                Some(PaintRef {
                    image: "pack.0".to_string(),
                    channel: 0,
                }),
            )
            .unwrap();
        stack
            .set_node_mask(&id, Some(scalar_value_fragment("Mask", 0.5)))
            .unwrap();

        let fragment = resolve_alpha(stack.layer(&id).unwrap()).unwrap();
        let out = fragment.output(ALPHA_PORT).unwrap().source;
        let factor = fragment
            .graph
            .eval_scalar(out, &|kind| match kind {
                NodeKind::PaintSample { .. } => Some(0.8),
                _ => None,
            })
            .unwrap();
        assert!((factor - 0.2).abs() < 1e-6);
    }

    #[test]
    fn fill_layer_uses_constant_one_alpha() {
        let (mut stack, id) = stack_with_layer(LayerKind::MaterialFill);
        stack.set_opacity(&id, 0.25).unwrap();

        let fragment = resolve_alpha(stack.layer(&id).unwrap()).unwrap();
        let out = fragment.output(ALPHA_PORT).unwrap().source;
        let factor = fragment.graph.eval_scalar(out, &|_| None).unwrap();
        assert!((factor - 0.25).abs() < 1e-6);
    }

    #[test]
    fn custom_alpha_layer_splices_its_own_source() {
        let (mut stack, id) = stack_with_layer(LayerKind::CustomAlpha);
        stack
            .set_alpha_source(&id, scalar_value_fragment("Alpha", 0.4))
            .unwrap();

        let fragment = resolve_alpha(stack.layer(&id).unwrap()).unwrap();
        let out = fragment.output(ALPHA_PORT).unwrap().source;
        let factor = fragment.graph.eval_scalar(out, &|_| None).unwrap();
        assert!((factor - 0.4).abs() < 1e-6);
    }

    #[test]
    fn custom_alpha_without_source_is_a_synthesis_error() {
        let (stack, id) = stack_with_layer(LayerKind::CustomAlpha);
        let err = resolve_alpha(stack.layer(&id).unwrap()).unwrap_err();
        assert!(matches!(err, LaminaError::Synthesis(_)));
    }

    #[test]
    fn unpainted_paint_layer_defaults_to_full_coverage() {
        let (stack, id) = stack_with_layer(LayerKind::MaterialPaint);
        let fragment = resolve_alpha(stack.layer(&id).unwrap()).unwrap();
        let out = fragment.output(ALPHA_PORT).unwrap().source;
        let factor = fragment.graph.eval_scalar(out, &|_| None).unwrap();
        assert!((factor - 1.0).abs() < 1e-6);
    }
}
