//! Graph synthesizer.
//!
//! Folds the layer stack bottom-up into one compiled graph per enabled
//! channel. Layers that do not carry a channel contribute identity with
//! zero emitted nodes; a channel touched by no layer above the base
//! compiles to a direct read of the base material. The bake cache is
//! consulted so that baked layers (or a baked stack) are substituted by
//! raster reads without changing the external contract.

use std::collections::BTreeMap;

use crate::{
    alpha::{self, ALPHA_PORT},
    bake::BakeCache,
    blend::{BELOW_PORT, BlendLibrary, FACTOR_PORT, LAYER_PORT, RESULT_PORT},
    error::{LaminaError, LaminaResult},
    graph::{
        Fnv1a64, Fragment, FragmentOutput, Graph, GraphFingerprint, InputRef, MathOp, NodeKind,
        OutputRef, SocketValue, ValueType, VectorMathOp, splice, structural_hash,
    },
    model::{Channel, Layer, LayerStack},
};

/// One channel's compiled fold chain. The output socket is the channel's
/// external contract; consumers reconnect only when the chain itself is
/// resynthesized.
#[derive(Clone, Debug)]
pub struct CompiledChannel {
    pub name: String,
    pub ty: ValueType,
    pub graph: Graph,
    pub output: OutputRef,
    pub fingerprint: GraphFingerprint,
    /// Number of blend operator fragments emitted for this channel.
    pub blend_ops: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CompiledStack {
    pub channels: BTreeMap<String, CompiledChannel>,
}

/// A union graph with one named output socket per enabled channel, for
/// hosts that want a single graph handoff.
#[derive(Clone, Debug)]
pub struct MergedGraph {
    pub graph: Graph,
    pub outputs: BTreeMap<String, OutputRef>,
}

impl CompiledStack {
    pub fn channel(&self, name: &str) -> Option<&CompiledChannel> {
        self.channels.get(name)
    }

    /// Combined fingerprint over all channels, order-independent of how
    /// the channels were (re)built.
    pub fn fingerprint(&self) -> GraphFingerprint {
        let mut a = Fnv1a64::new(0xcbf29ce484222325);
        let mut b = Fnv1a64::new(0x9ae16a3b2f90404f);
        for (name, ch) in &self.channels {
            for h in [&mut a, &mut b] {
                h.write_str(name);
                h.write_u64(ch.fingerprint.hi);
                h.write_u64(ch.fingerprint.lo);
            }
        }
        GraphFingerprint {
            hi: a.finish(),
            lo: b.finish(),
        }
    }

    pub fn merged(&self) -> LaminaResult<MergedGraph> {
        let mut graph = Graph::new();
        let mut outputs = BTreeMap::new();
        for (name, ch) in &self.channels {
            let as_fragment = Fragment {
                graph: ch.graph.clone(),
                inputs: vec![],
                outputs: vec![FragmentOutput {
                    name: name.clone(),
                    ty: ch.ty,
                    source: ch.output,
                }],
            };
            let spliced = splice(&mut graph, &as_fragment, &BTreeMap::new())?;
            outputs.insert(name.clone(), spliced.outputs[name]);
        }
        Ok(MergedGraph { graph, outputs })
    }
}

/// Compiles every enabled channel of the stack from scratch.
#[tracing::instrument(skip_all, fields(layers = stack.layers().len()))]
pub fn compile(
    stack: &LayerStack,
    lib: &BlendLibrary,
    bakes: &BakeCache,
) -> LaminaResult<CompiledStack> {
    let mut compiled = CompiledStack::default();
    for channel in stack.enabled_channels() {
        let ch = compile_channel(stack, channel, lib, bakes)?;
        tracing::debug!(
            channel = %channel.name,
            nodes = ch.graph.node_count(),
            blend_ops = ch.blend_ops,
            "compiled channel"
        );
        compiled.channels.insert(channel.name.clone(), ch);
    }
    Ok(compiled)
}

/// Folds one channel's chain: base contribution, then one blend fragment
/// per carrying layer, factor-driven by the alpha resolver.
pub(crate) fn compile_channel(
    stack: &LayerStack,
    channel: &Channel,
    lib: &BlendLibrary,
    bakes: &BakeCache,
) -> LaminaResult<CompiledChannel> {
    // A baked stack replaces the whole fold with a raster read.
    if let Some(record) = bakes.stack_record() {
        if let Some(baked) = record.channels.get(&channel.name) {
            let mut graph = Graph::new();
            let node = graph.add(NodeKind::RasterSample {
                image: baked.image.clone(),
                channel: baked.channel,
            });
            let output = OutputRef { node, socket: 0 };
            let fingerprint = structural_hash(&graph);
            return Ok(CompiledChannel {
                name: channel.name.clone(),
                ty: channel.ty,
                graph,
                output,
                fingerprint,
                blend_ops: 0,
            });
        }
    }

    let mut graph = Graph::new();
    let base = stack.base_layer();
    if !base.carries(&channel.name) {
        return Err(LaminaError::synthesis(format!(
            "base layer does not provide enabled channel '{}'",
            channel.name
        )));
    }

    let mut running = material_output(&mut graph, base, &channel.name, bakes)?;
    let mut blend_ops = 0usize;

    for layer in &stack.layers()[1..] {
        if !layer.carries(&channel.name) {
            continue;
        }

        let new_value = material_output(&mut graph, layer, &channel.name, bakes)?;

        let alpha_fragment = alpha::resolve_alpha(layer)?;
        let spliced_alpha = splice(&mut graph, &alpha_fragment, &BTreeMap::new())?;
        let mut factor = spliced_alpha.outputs[ALPHA_PORT];

        // `LayerChannelSettings` existence is implied by `carries`.
        let settings = &layer.channels[&channel.name];
        if settings.opacity < 1.0 {
            let mul = graph.add(NodeKind::Math(MathOp::Multiply));
            graph.connect(
                factor,
                InputRef {
                    node: mul,
                    socket: 0,
                },
            )?;
            graph.set_default(
                InputRef {
                    node: mul,
                    socket: 1,
                },
                SocketValue::Scalar(settings.opacity),
            )?;
            factor = OutputRef {
                node: mul,
                socket: 0,
            };
        }

        let blend_fragment = lib.fragment_for(&settings.blend, channel.ty)?;
        let bindings = BTreeMap::from([
            (FACTOR_PORT.to_string(), factor),
            (BELOW_PORT.to_string(), running),
            (LAYER_PORT.to_string(), new_value),
        ]);
        let spliced = splice(&mut graph, &blend_fragment, &bindings)?;
        let mut out = spliced.outputs[RESULT_PORT];

        if channel.renormalize && channel.ty.is_vector_family() {
            let norm = graph.add(NodeKind::VectorMath(VectorMathOp::Normalize));
            graph.connect(
                out,
                InputRef {
                    node: norm,
                    socket: 0,
                },
            )?;
            out = OutputRef {
                node: norm,
                socket: 0,
            };
        }

        running = out;
        blend_ops += 1;
    }

    let fingerprint = structural_hash(&graph);
    Ok(CompiledChannel {
        name: channel.name.clone(),
        ty: channel.ty,
        graph,
        output: running,
        fingerprint,
        blend_ops,
    })
}

/// The socket providing a layer's value for one channel: a raster read of
/// the bake result when the layer is baked, otherwise the layer's live
/// material sub-graph (kept nested as a group).
fn material_output(
    graph: &mut Graph,
    layer: &Layer,
    channel: &str,
    bakes: &BakeCache,
) -> LaminaResult<OutputRef> {
    if let Some(record) = bakes.layer_record(&layer.id) {
        if let Some(baked) = record.channels.get(channel) {
            let node = graph.add(NodeKind::RasterSample {
                image: baked.image.clone(),
                channel: baked.channel,
            });
            return Ok(OutputRef { node, socket: 0 });
        }
    }

    let group = graph.add(NodeKind::Group(Box::new(layer.material.clone())));
    graph.output_named(group, channel).ok_or_else(|| {
        LaminaError::synthesis(format!(
            "layer '{}' material has no output for channel '{channel}'",
            layer.id
        ))
    })
}
