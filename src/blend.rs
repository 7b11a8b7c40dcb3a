//! Blend operator library.
//!
//! Maps a blend-mode identifier to the graph fragment that combines a
//! layer's contribution with the accumulated value below it. Every
//! fragment exposes the same port signature: a scalar `Factor`, two
//! same-typed values `A` (accumulated) and `B` (layer), and one `Result`.

use std::collections::BTreeMap;

use crate::{
    error::{LaminaError, LaminaResult},
    graph::{
        Fragment, FragmentInput, FragmentOutput, Graph, InputRef, MathOp, MixOp, NodeKind,
        OutputRef, SocketValue, ValueType, VectorMathOp,
    },
};

pub const FACTOR_PORT: &str = "Factor";
pub const BELOW_PORT: &str = "A";
pub const LAYER_PORT: &str = "B";
pub const RESULT_PORT: &str = "Result";

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlendMode {
    Mix,
    Darken,
    Multiply,
    Burn,
    Lighten,
    Screen,
    Dodge,
    Add,
    Overlay,
    SoftLight,
    LinearLight,
    Difference,
    Subtract,
    Divide,
    Hue,
    Saturation,
    Color,
    Value,
    /// A caller-bound fragment, looked up by name in the library.
    Custom(String),
}

impl BlendMode {
    fn mix_op(&self) -> Option<MixOp> {
        Some(match self {
            BlendMode::Mix => MixOp::Mix,
            BlendMode::Darken => MixOp::Darken,
            BlendMode::Multiply => MixOp::Multiply,
            BlendMode::Burn => MixOp::Burn,
            BlendMode::Lighten => MixOp::Lighten,
            BlendMode::Screen => MixOp::Screen,
            BlendMode::Dodge => MixOp::Dodge,
            BlendMode::Add => MixOp::Add,
            BlendMode::Overlay => MixOp::Overlay,
            BlendMode::SoftLight => MixOp::SoftLight,
            BlendMode::LinearLight => MixOp::LinearLight,
            BlendMode::Difference => MixOp::Difference,
            BlendMode::Subtract => MixOp::Subtract,
            BlendMode::Divide => MixOp::Divide,
            BlendMode::Hue => MixOp::Hue,
            BlendMode::Saturation => MixOp::Saturation,
            BlendMode::Color => MixOp::Color,
            BlendMode::Value => MixOp::Value,
            BlendMode::Custom(_) => return None,
        })
    }
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlendMode::Custom(name) => write!(f, "custom:{name}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Registry of blend operators: fixed templates for the builtin modes plus
/// caller-bound custom fragments.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BlendLibrary {
    custom: BTreeMap<String, Fragment>,
}

impl BlendLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a fragment as a custom blend operation. The fragment must
    /// expose exactly three inputs (one scalar factor, two values) and one
    /// output.
    pub fn bind_custom(&mut self, name: impl Into<String>, fragment: Fragment) -> LaminaResult<()> {
        fragment.validate()?;
        if fragment.inputs.len() != 3 {
            return Err(LaminaError::incompatible_custom_fragment(format!(
                "expected exactly 3 inputs, found {}",
                fragment.inputs.len()
            )));
        }
        if fragment.outputs.len() != 1 {
            return Err(LaminaError::incompatible_custom_fragment(format!(
                "expected exactly 1 output, found {}",
                fragment.outputs.len()
            )));
        }
        factor_input_index(&fragment)?;
        self.custom.insert(name.into(), fragment);
        Ok(())
    }

    pub fn unbind_custom(&mut self, name: &str) -> Option<Fragment> {
        self.custom.remove(name)
    }

    pub fn custom(&self, name: &str) -> Option<&Fragment> {
        self.custom.get(name)
    }

    /// Resolves a blend mode to its fragment for a channel of type `ty`.
    pub fn fragment_for(&self, mode: &BlendMode, ty: ValueType) -> LaminaResult<Fragment> {
        match mode {
            BlendMode::Custom(name) => {
                let bound = self.custom.get(name).ok_or_else(|| {
                    LaminaError::incompatible_custom_fragment(format!(
                        "no custom blend fragment bound as '{name}'"
                    ))
                })?;
                custom_blend_fragment(bound, ty)
            }
            BlendMode::Mix if ty == ValueType::Normal => Ok(reoriented_normal_fragment()),
            builtin => {
                // mix_op is total over the builtin modes.
                let op = builtin.mix_op().expect("builtin blend mode");
                Ok(mix_node_fragment(op, ty))
            }
        }
    }
}

/// Single mix-node template used by all builtin modes.
fn mix_node_fragment(op: MixOp, ty: ValueType) -> Fragment {
    let mix_ty = if ty == ValueType::Normal {
        ValueType::Vector
    } else {
        ty
    };
    let mut graph = Graph::new();
    let mix = graph.add(NodeKind::Mix { op, ty: mix_ty });
    Fragment {
        graph,
        inputs: vec![
            FragmentInput {
                name: FACTOR_PORT.to_string(),
                ty: ValueType::Scalar,
                default: SocketValue::Scalar(1.0),
                targets: vec![InputRef {
                    node: mix,
                    socket: 0,
                }],
            },
            FragmentInput {
                name: BELOW_PORT.to_string(),
                ty: mix_ty,
                default: SocketValue::zero_of(mix_ty),
                targets: vec![InputRef {
                    node: mix,
                    socket: 1,
                }],
            },
            FragmentInput {
                name: LAYER_PORT.to_string(),
                ty: mix_ty,
                default: SocketValue::zero_of(mix_ty),
                targets: vec![InputRef {
                    node: mix,
                    socket: 2,
                }],
            },
        ],
        outputs: vec![FragmentOutput {
            name: RESULT_PORT.to_string(),
            ty,
            source: OutputRef {
                node: mix,
                socket: 0,
            },
        }],
    }
}

/// Default operator for normal-typed channels: tangent-space reoriented
/// normal mapping, factor-mixed against the accumulated normal and then
/// renormalized. Naive per-component mixing of normals is not meaningful,
/// so this replaces the plain mix template. Returned as one opaque group.
fn reoriented_normal_fragment() -> Fragment {
    use ValueType::{Scalar, Vector};

    let mut g = Graph::new();

    // t = below + (0, 0, 1)
    let t = g.add(NodeKind::VectorMath(VectorMathOp::Add));
    // u = layer * (-1, -1, 1)
    let u = g.add(NodeKind::VectorMath(VectorMathOp::Multiply));
    let d = g.add(NodeKind::VectorMath(VectorMathOp::Dot));
    let tz = g.add(NodeKind::VectorMath(VectorMathOp::Dot));
    let ratio = g.add(NodeKind::Math(MathOp::Divide));
    let scaled = g.add(NodeKind::VectorMath(VectorMathOp::Scale));
    let reoriented = g.add(NodeKind::VectorMath(VectorMathOp::Subtract));
    let mixed = g.add(NodeKind::Mix {
        op: MixOp::Mix,
        ty: Vector,
    });
    let norm = g.add(NodeKind::VectorMath(VectorMathOp::Normalize));

    let in_ref = |node, socket| InputRef { node, socket };
    let out_ref = |node, socket| OutputRef { node, socket };

    // Constant operands live in unlinked socket defaults.
    let wire = |g: &mut Graph| -> LaminaResult<()> {
        g.set_default(in_ref(t, 1), SocketValue::Vector([0.0, 0.0, 1.0]))?;
        g.set_default(in_ref(u, 1), SocketValue::Vector([-1.0, -1.0, 1.0]))?;
        g.set_default(in_ref(tz, 1), SocketValue::Vector([0.0, 0.0, 1.0]))?;

        g.connect(out_ref(t, 0), in_ref(d, 0))?;
        g.connect(out_ref(u, 0), in_ref(d, 1))?;
        g.connect(out_ref(d, 0), in_ref(ratio, 0))?;
        g.connect(out_ref(t, 0), in_ref(tz, 0))?;
        g.connect(out_ref(tz, 0), in_ref(ratio, 1))?;
        g.connect(out_ref(t, 0), in_ref(scaled, 0))?;
        g.connect(out_ref(ratio, 0), in_ref(scaled, 2))?;
        g.connect(out_ref(scaled, 0), in_ref(reoriented, 0))?;
        g.connect(out_ref(u, 0), in_ref(reoriented, 1))?;
        g.connect(out_ref(reoriented, 0), in_ref(mixed, 2))?;
        g.connect(out_ref(mixed, 0), in_ref(norm, 0))?;
        Ok(())
    };
    // Infallible: every ref above addresses a socket created here.
    wire(&mut g).expect("static normal-blend wiring");

    let inner = Fragment {
        graph: g,
        inputs: vec![
            FragmentInput {
                name: FACTOR_PORT.to_string(),
                ty: Scalar,
                default: SocketValue::Scalar(1.0),
                targets: vec![in_ref(mixed, 0)],
            },
            FragmentInput {
                name: BELOW_PORT.to_string(),
                ty: ValueType::Normal,
                default: SocketValue::Vector([0.0, 0.0, 1.0]),
                targets: vec![in_ref(t, 0), in_ref(mixed, 1)],
            },
            FragmentInput {
                name: LAYER_PORT.to_string(),
                ty: ValueType::Normal,
                default: SocketValue::Vector([0.0, 0.0, 1.0]),
                targets: vec![in_ref(u, 0)],
            },
        ],
        outputs: vec![FragmentOutput {
            name: RESULT_PORT.to_string(),
            ty: ValueType::Normal,
            source: out_ref(norm, 0),
        }],
    };
    inner.into_group()
}

/// Index of the factor input of a custom fragment: the single scalar
/// input, or the first input when all inputs are scalar.
fn factor_input_index(fragment: &Fragment) -> LaminaResult<usize> {
    let scalar_inputs: Vec<usize> = fragment
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, p)| p.ty == ValueType::Scalar)
        .map(|(idx, _)| idx)
        .collect();
    match scalar_inputs.len() {
        1 => Ok(scalar_inputs[0]),
        3 => Ok(0),
        _ => Err(LaminaError::incompatible_custom_fragment(
            "expected exactly one scalar factor input",
        )),
    }
}

/// Wraps a bound custom fragment as an opaque group with the library's
/// canonical port names, validating its signature against the channel
/// type.
fn custom_blend_fragment(bound: &Fragment, ty: ValueType) -> LaminaResult<Fragment> {
    if bound.inputs.len() != 3 || bound.outputs.len() != 1 {
        return Err(LaminaError::incompatible_custom_fragment(format!(
            "expected 3 inputs and 1 output, found {} and {}",
            bound.inputs.len(),
            bound.outputs.len()
        )));
    }
    let factor = factor_input_index(bound)?;
    let value_inputs: Vec<usize> = (0..3).filter(|idx| *idx != factor).collect();

    for idx in &value_inputs {
        let input = &bound.inputs[*idx];
        if !ty.can_coerce_to(input.ty) {
            return Err(LaminaError::incompatible_custom_fragment(format!(
                "value input '{}' is {} but the channel is {ty}",
                input.name, input.ty
            )));
        }
    }
    let output = &bound.outputs[0];
    if !output.ty.can_coerce_to(ty) {
        return Err(LaminaError::incompatible_custom_fragment(format!(
            "output '{}' is {} but the channel is {ty}",
            output.name, output.ty
        )));
    }

    let mut wrapped = bound.clone().into_group();
    wrapped.inputs[factor].name = FACTOR_PORT.to_string();
    wrapped.inputs[value_inputs[0]].name = BELOW_PORT.to_string();
    wrapped.inputs[value_inputs[1]].name = LAYER_PORT.to_string();
    wrapped.outputs[0].name = RESULT_PORT.to_string();
    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{self, NodeKind};
    use std::collections::BTreeMap as Map;

    fn scalar_custom(outputs: usize) -> Fragment {
        let mut g = Graph::new();
        let mix = g.add(NodeKind::Mix {
            op: MixOp::Mix,
            ty: ValueType::Scalar,
        });
        let port_in = |name: &str, socket| FragmentInput {
            name: name.to_string(),
            ty: ValueType::Scalar,
            default: SocketValue::Scalar(0.0),
            targets: vec![InputRef { node: mix, socket }],
        };
        Fragment {
            graph: g,
            inputs: vec![port_in("Fac", 0), port_in("Lower", 1), port_in("Upper", 2)],
            outputs: (0..outputs)
                .map(|idx| FragmentOutput {
                    name: format!("Out{idx}"),
                    ty: ValueType::Scalar,
                    source: OutputRef {
                        node: mix,
                        socket: 0,
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn builtin_fragment_is_single_mix_node() {
        let lib = BlendLibrary::new();
        let frag = lib
            .fragment_for(&BlendMode::Multiply, ValueType::Color)
            .unwrap();
        assert_eq!(frag.graph.node_count(), 1);
        assert!(frag.input(FACTOR_PORT).is_some());
        assert!(frag.input(BELOW_PORT).is_some());
        assert!(frag.input(LAYER_PORT).is_some());
        assert!(frag.output(RESULT_PORT).is_some());
    }

    #[test]
    fn normal_default_routes_through_nested_group() {
        let lib = BlendLibrary::new();
        let frag = lib
            .fragment_for(&BlendMode::Mix, ValueType::Normal)
            .unwrap();
        assert_eq!(frag.graph.node_count(), 1);
        let (_, node) = frag.graph.nodes().next().unwrap();
        assert!(matches!(node.kind, NodeKind::Group(_)));

        // Same mode on a color channel stays a plain mix node.
        let color = lib.fragment_for(&BlendMode::Mix, ValueType::Color).unwrap();
        let (_, node) = color.graph.nodes().next().unwrap();
        assert!(matches!(node.kind, NodeKind::Mix { .. }));
    }

    #[test]
    fn custom_bind_rejects_wrong_arity() {
        let mut lib = BlendLibrary::new();
        let err = lib.bind_custom("bad", scalar_custom(2)).unwrap_err();
        assert!(matches!(err, LaminaError::IncompatibleCustomFragment(_)));
    }

    #[test]
    fn custom_lookup_normalizes_port_names() {
        let mut lib = BlendLibrary::new();
        lib.bind_custom("soft", scalar_custom(1)).unwrap();

        let frag = lib
            .fragment_for(&BlendMode::Custom("soft".to_string()), ValueType::Scalar)
            .unwrap();
        assert!(frag.input(FACTOR_PORT).is_some());
        assert!(frag.output(RESULT_PORT).is_some());
        // The bound fragment stays nested.
        let (_, node) = frag.graph.nodes().next().unwrap();
        assert!(matches!(node.kind, NodeKind::Group(_)));
    }

    #[test]
    fn custom_lookup_fails_for_unbound_name() {
        let lib = BlendLibrary::new();
        let err = lib
            .fragment_for(&BlendMode::Custom("missing".to_string()), ValueType::Scalar)
            .unwrap_err();
        assert!(matches!(err, LaminaError::IncompatibleCustomFragment(_)));
    }

    #[test]
    fn reoriented_fragment_keeps_identity_at_zero_factor() {
        let frag = reoriented_normal_fragment();
        frag.validate().unwrap();

        // Splice and check the factor defaults propagate; vector math is
        // not constant-folded, so just verify the graph shape survives.
        let mut host = Graph::new();
        let spliced = graph::splice(&mut host, &frag, &Map::new()).unwrap();
        assert!(spliced.outputs.contains_key(RESULT_PORT));
        assert_eq!(host.node_count(), 1);
    }
}
