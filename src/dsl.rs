//! Programmatic construction helpers for stacks and fragments.

use crate::{
    error::LaminaResult,
    graph::{
        Fragment, FragmentInput, FragmentOutput, Graph, InputRef, MixOp, NodeKind, OutputRef,
        SocketValue, ValueType,
    },
    model::{Channel, LayerKind, LayerStack},
};

pub struct StackBuilder {
    channels: Vec<Channel>,
    base_material: Fragment,
    layers: Vec<LayerSpec>,
}

struct LayerSpec {
    name: String,
    kind: LayerKind,
    material: Fragment,
    opacity: Option<f64>,
}

impl StackBuilder {
    pub fn new(base_material: Fragment) -> Self {
        Self {
            channels: Vec::new(),
            base_material,
            layers: Vec::new(),
        }
    }

    pub fn channel(mut self, channel: Channel) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn scalar_channel(self, name: impl Into<String>) -> Self {
        self.channel(Channel::new(name, ValueType::Scalar))
    }

    pub fn layer(mut self, name: impl Into<String>, kind: LayerKind, material: Fragment) -> Self {
        self.layers.push(LayerSpec {
            name: name.into(),
            kind,
            material,
            opacity: None,
        });
        self
    }

    pub fn layer_with_opacity(
        mut self,
        name: impl Into<String>,
        kind: LayerKind,
        material: Fragment,
        opacity: f64,
    ) -> Self {
        self.layers.push(LayerSpec {
            name: name.into(),
            kind,
            material,
            opacity: Some(opacity),
        });
        self
    }

    pub fn build(self) -> LaminaResult<LayerStack> {
        let mut stack = LayerStack::new(self.channels, self.base_material)?;
        for (offset, spec) in self.layers.into_iter().enumerate() {
            let id = stack.add_layer(spec.name, spec.kind, offset + 1, spec.material)?;
            if let Some(opacity) = spec.opacity {
                stack.set_opacity(&id, opacity)?;
            }
        }
        Ok(stack)
    }
}

/// Scalar channels with library defaults, in the given order.
pub fn scalar_channels(names: &[&str]) -> Vec<Channel> {
    names
        .iter()
        .map(|name| Channel::new(*name, ValueType::Scalar))
        .collect()
}

/// A material fragment emitting one constant scalar per named output.
pub fn constant_material(outputs: &[(&str, f64)]) -> Fragment {
    let mut graph = Graph::new();
    let outputs = outputs
        .iter()
        .map(|(name, value)| {
            let node = graph.add(NodeKind::Value(*value));
            FragmentOutput {
                name: name.to_string(),
                ty: ValueType::Scalar,
                source: OutputRef { node, socket: 0 },
            }
        })
        .collect();
    Fragment {
        graph,
        inputs: vec![],
        outputs,
    }
}

/// A fragment with a single constant scalar output.
pub fn scalar_value_fragment(name: impl Into<String>, value: f64) -> Fragment {
    let mut graph = Graph::new();
    let node = graph.add(NodeKind::Value(value));
    Fragment {
        graph,
        inputs: vec![],
        outputs: vec![FragmentOutput {
            name: name.into(),
            ty: ValueType::Scalar,
            source: OutputRef { node, socket: 0 },
        }],
    }
}

/// A minimal fragment with a valid custom-blend signature (factor, two
/// values, one result) built around a single mix node.
pub fn passthrough_blend_fragment(ty: ValueType) -> Fragment {
    let mix_ty = if ty == ValueType::Normal {
        ValueType::Vector
    } else {
        ty
    };
    let mut graph = Graph::new();
    let mix = graph.add(NodeKind::Mix {
        op: MixOp::Mix,
        ty: mix_ty,
    });
    let port = |name: &str, ty, socket| FragmentInput {
        name: name.to_string(),
        ty,
        default: SocketValue::zero_of(ty),
        targets: vec![InputRef { node: mix, socket }],
    };
    Fragment {
        graph,
        inputs: vec![
            port("Fac", ValueType::Scalar, 0),
            port("Lower", mix_ty, 1),
            port("Upper", mix_ty, 2),
        ],
        outputs: vec![FragmentOutput {
            name: "Out".to_string(),
            ty,
            source: OutputRef {
                node: mix,
                socket: 0,
            },
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_ordered_layers() {
        let stack = StackBuilder::new(constant_material(&[("Roughness", 0.5)]))
            .scalar_channel("Roughness")
            .layer(
                "Fill",
                LayerKind::MaterialFill,
                constant_material(&[("Roughness", 0.9)]),
            )
            .layer_with_opacity(
                "Paint",
                LayerKind::MaterialPaint,
                constant_material(&[("Roughness", 0.1)]),
                0.5,
            )
            .build()
            .unwrap();

        assert_eq!(stack.layers().len(), 3);
        assert_eq!(stack.layers()[1].name, "Fill");
        assert_eq!(stack.layers()[2].name, "Paint");
        assert!((stack.layers()[2].opacity - 0.5).abs() < 1e-9);
    }

    #[test]
    fn builder_rejects_base_without_coverage() {
        let err = StackBuilder::new(constant_material(&[("Metallic", 0.0)]))
            .scalar_channel("Roughness")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::LaminaError::IncompatibleMaterial(_)
        ));
    }

    #[test]
    fn passthrough_blend_fragment_binds_as_custom() {
        let mut lib = crate::blend::BlendLibrary::new();
        lib.bind_custom("pass", passthrough_blend_fragment(ValueType::Scalar))
            .unwrap();
        assert!(lib.custom("pass").is_some());
    }
}
