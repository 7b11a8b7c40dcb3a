//! Graph intermediate representation.
//!
//! The compiler's output format and the format for reusable fragments
//! (blend operators, masks, custom alpha sources). Nodes are addressed by
//! numeric id only; ids are an artifact of splicing and never contribute to
//! the structural hash.

use std::collections::BTreeMap;

use crate::error::{LaminaError, LaminaResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValueType {
    Scalar,
    Color,
    Vector,
    /// Vector with a distinguished blend algebra (reoriented normal
    /// mapping instead of a linear mix).
    Normal,
}

impl ValueType {
    pub fn is_vector_family(self) -> bool {
        !matches!(self, ValueType::Scalar)
    }

    /// Whether a value of this type may drive an input of type `to`.
    /// Scalars broadcast into any input; the vector family inter-coerces;
    /// nothing narrows to a scalar.
    pub fn can_coerce_to(self, to: ValueType) -> bool {
        self == to || matches!(self, ValueType::Scalar) || to.is_vector_family()
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Scalar => "scalar",
            ValueType::Color => "color",
            ValueType::Vector => "vector",
            ValueType::Normal => "normal",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SocketValue {
    Scalar(f64),
    Vector([f64; 3]),
    Color([f64; 4]),
}

impl SocketValue {
    pub fn zero_of(ty: ValueType) -> Self {
        match ty {
            ValueType::Scalar => SocketValue::Scalar(0.0),
            ValueType::Vector | ValueType::Normal => SocketValue::Vector([0.0; 3]),
            ValueType::Color => SocketValue::Color([0.0, 0.0, 0.0, 1.0]),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SocketValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VectorMathOp {
    Add,
    Subtract,
    Multiply,
    Scale,
    Dot,
    Normalize,
}

/// Blend operation of a `Mix` node. `Mix` is the plain factor lerp; the
/// rest are the separable blend operators of the host's mix node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MixOp {
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
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    /// Scalar constant.
    Value(f64),
    /// Color constant.
    ColorValue([f64; 4]),
    Math(MathOp),
    VectorMath(VectorMathOp),
    /// Factor blend of two same-typed values.
    Mix { op: MixOp, ty: ValueType },
    /// Typed pass-through.
    Reroute(ValueType),
    /// Scalar read of a painted-alpha raster. `channel` selects one RGB
    /// channel of a shared pack page, or -1 for a standalone image.
    PaintSample { image: String, channel: i8 },
    /// Read of a baked raster result. `channel` as for `PaintSample`;
    /// -1 samples the whole image as a color.
    RasterSample { image: String, channel: i8 },
    /// Opaque nested sub-graph. Splicing copies this node as a unit.
    Group(Box<Fragment>),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Socket {
    pub name: String,
    pub ty: ValueType,
    pub default: SocketValue,
}

impl Socket {
    fn new(name: &str, ty: ValueType) -> Self {
        Socket {
            name: name.to_string(),
            ty,
            default: SocketValue::zero_of(ty),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Vec<Socket>,
    pub outputs: Vec<Socket>,
}

impl Node {
    pub fn of(kind: NodeKind) -> Self {
        let (inputs, outputs) = socket_template(&kind);
        Node {
            kind,
            inputs,
            outputs,
        }
    }
}

fn socket_template(kind: &NodeKind) -> (Vec<Socket>, Vec<Socket>) {
    use ValueType::*;
    match kind {
        NodeKind::Value(_) => (vec![], vec![Socket::new("Value", Scalar)]),
        NodeKind::ColorValue(_) => (vec![], vec![Socket::new("Color", Color)]),
        NodeKind::Math(_) => (
            vec![Socket::new("A", Scalar), Socket::new("B", Scalar)],
            vec![Socket::new("Value", Scalar)],
        ),
        NodeKind::VectorMath(op) => {
            let inputs = vec![
                Socket::new("A", Vector),
                Socket::new("B", Vector),
                Socket::new("Scale", Scalar),
            ];
            let outputs = if matches!(op, VectorMathOp::Dot) {
                vec![Socket::new("Value", Scalar)]
            } else {
                vec![Socket::new("Vector", Vector)]
            };
            (inputs, outputs)
        }
        NodeKind::Mix { ty, .. } => (
            vec![
                Socket::new("Factor", Scalar),
                Socket::new("A", *ty),
                Socket::new("B", *ty),
            ],
            vec![Socket::new("Result", *ty)],
        ),
        NodeKind::Reroute(ty) => (
            vec![Socket::new("Input", *ty)],
            vec![Socket::new("Output", *ty)],
        ),
        NodeKind::PaintSample { .. } => (vec![], vec![Socket::new("Alpha", Scalar)]),
        NodeKind::RasterSample { channel, .. } => {
            let out = if *channel < 0 {
                Socket::new("Color", Color)
            } else {
                Socket::new("Value", Scalar)
            };
            (vec![], vec![out])
        }
        NodeKind::Group(frag) => (
            frag.inputs
                .iter()
                .map(|p| Socket {
                    name: p.name.clone(),
                    ty: p.ty,
                    default: p.default,
                })
                .collect(),
            frag.outputs
                .iter()
                .map(|p| Socket::new(&p.name, p.ty))
                .collect(),
        ),
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct NodeId(pub u32);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct OutputRef {
    pub node: NodeId,
    pub socket: usize,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct InputRef {
    pub node: NodeId,
    pub socket: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Link {
    pub from: OutputRef,
    pub to: InputRef,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    links: Vec<Link>,
    next_id: u32,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::of(kind));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().map(|(id, n)| (*id, n))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn out_ref(&self, node: NodeId, socket: usize) -> LaminaResult<OutputRef> {
        let n = self
            .node(node)
            .ok_or_else(|| LaminaError::validation(format!("unknown node id {}", node.0)))?;
        if socket >= n.outputs.len() {
            return Err(LaminaError::validation(format!(
                "node {} has no output socket {socket}",
                node.0
            )));
        }
        Ok(OutputRef { node, socket })
    }

    pub fn in_ref(&self, node: NodeId, socket: usize) -> LaminaResult<InputRef> {
        let n = self
            .node(node)
            .ok_or_else(|| LaminaError::validation(format!("unknown node id {}", node.0)))?;
        if socket >= n.inputs.len() {
            return Err(LaminaError::validation(format!(
                "node {} has no input socket {socket}",
                node.0
            )));
        }
        Ok(InputRef { node, socket })
    }

    /// Output socket of `node` with the given name (group nodes expose
    /// their fragment's output ports by name).
    pub fn output_named(&self, node: NodeId, name: &str) -> Option<OutputRef> {
        let n = self.node(node)?;
        let socket = n.outputs.iter().position(|s| s.name == name)?;
        Some(OutputRef { node, socket })
    }

    /// Connects an output to an input. An input holds at most one driver:
    /// connecting over an existing link replaces it.
    pub fn connect(&mut self, from: OutputRef, to: InputRef) -> LaminaResult<()> {
        let from_ty = self
            .node(from.node)
            .and_then(|n| n.outputs.get(from.socket))
            .ok_or_else(|| {
                LaminaError::validation(format!(
                    "link source {}:{} does not exist",
                    from.node.0, from.socket
                ))
            })?
            .ty;
        let to_ty = self
            .node(to.node)
            .and_then(|n| n.inputs.get(to.socket))
            .ok_or_else(|| {
                LaminaError::validation(format!(
                    "link target {}:{} does not exist",
                    to.node.0, to.socket
                ))
            })?
            .ty;

        if !from_ty.can_coerce_to(to_ty) {
            return Err(LaminaError::validation(format!(
                "cannot connect {from_ty} output to {to_ty} input"
            )));
        }

        self.links.retain(|l| l.to != to);
        self.links.push(Link { from, to });
        Ok(())
    }

    pub fn input_driver(&self, to: InputRef) -> Option<OutputRef> {
        self.links.iter().find(|l| l.to == to).map(|l| l.from)
    }

    pub fn set_default(&mut self, to: InputRef, value: SocketValue) -> LaminaResult<()> {
        let socket = self
            .nodes
            .get_mut(&to.node)
            .and_then(|n| n.inputs.get_mut(to.socket))
            .ok_or_else(|| {
                LaminaError::validation(format!(
                    "input {}:{} does not exist",
                    to.node.0, to.socket
                ))
            })?;
        socket.default = value;
        Ok(())
    }

    /// Constant-folds a scalar output. `ext` supplies values for raster
    /// sampling leaves; anything else that is not a constant chain is an
    /// error. Used by tests and the CLI to inspect factor chains.
    pub fn eval_scalar(
        &self,
        out: OutputRef,
        ext: &dyn Fn(&NodeKind) -> Option<f64>,
    ) -> LaminaResult<f64> {
        self.eval_scalar_inner(out, &BTreeMap::new(), ext, 0)
    }

    fn eval_input(
        &self,
        to: InputRef,
        overrides: &BTreeMap<InputRef, f64>,
        ext: &dyn Fn(&NodeKind) -> Option<f64>,
        depth: usize,
    ) -> LaminaResult<f64> {
        if let Some(v) = overrides.get(&to) {
            return Ok(*v);
        }
        if let Some(from) = self.input_driver(to) {
            return self.eval_scalar_inner(from, overrides, ext, depth);
        }
        let socket = self
            .node(to.node)
            .and_then(|n| n.inputs.get(to.socket))
            .ok_or_else(|| LaminaError::synthesis("dangling input during evaluation"))?;
        socket
            .default
            .as_scalar()
            .ok_or_else(|| LaminaError::synthesis("non-scalar default in scalar evaluation"))
    }

    fn eval_scalar_inner(
        &self,
        out: OutputRef,
        overrides: &BTreeMap<InputRef, f64>,
        ext: &dyn Fn(&NodeKind) -> Option<f64>,
        depth: usize,
    ) -> LaminaResult<f64> {
        if depth > 256 {
            return Err(LaminaError::synthesis("evaluation recursion limit hit"));
        }
        let node = self
            .node(out.node)
            .ok_or_else(|| LaminaError::synthesis("dangling output during evaluation"))?;
        let input = |socket: usize| InputRef {
            node: out.node,
            socket,
        };

        match &node.kind {
            NodeKind::Value(v) => Ok(*v),
            NodeKind::Math(op) => {
                let a = self.eval_input(input(0), overrides, ext, depth + 1)?;
                let b = self.eval_input(input(1), overrides, ext, depth + 1)?;
                Ok(match op {
                    MathOp::Add => a + b,
                    MathOp::Subtract => a - b,
                    MathOp::Multiply => a * b,
                    MathOp::Divide => {
                        if b == 0.0 {
                            0.0
                        } else {
                            a / b
                        }
                    }
                })
            }
            NodeKind::Mix {
                op,
                ty: ValueType::Scalar,
            } => {
                let f = self.eval_input(input(0), overrides, ext, depth + 1)?;
                let a = self.eval_input(input(1), overrides, ext, depth + 1)?;
                let b = self.eval_input(input(2), overrides, ext, depth + 1)?;
                match op {
                    MixOp::Mix => Ok(a * (1.0 - f) + b * f),
                    MixOp::Multiply => Ok(a * (1.0 - f) + a * b * f),
                    MixOp::Add => Ok(a + b * f),
                    MixOp::Subtract => Ok(a - b * f),
                    _ => Err(LaminaError::synthesis(format!(
                        "scalar evaluation of {op:?} mix is not supported"
                    ))),
                }
            }
            NodeKind::Reroute(_) => self.eval_input(input(0), overrides, ext, depth + 1),
            NodeKind::Group(frag) => {
                let port = frag.outputs.get(out.socket).ok_or_else(|| {
                    LaminaError::synthesis("group output socket out of range")
                })?;
                let mut inner_overrides = BTreeMap::new();
                for (idx, port_in) in frag.inputs.iter().enumerate() {
                    let v = self.eval_input(input(idx), overrides, ext, depth + 1)?;
                    for target in &port_in.targets {
                        inner_overrides.insert(*target, v);
                    }
                }
                frag.graph
                    .eval_scalar_inner(port.source, &inner_overrides, ext, depth + 1)
            }
            kind @ (NodeKind::PaintSample { .. } | NodeKind::RasterSample { .. }) => ext(kind)
                .ok_or_else(|| {
                    LaminaError::synthesis("raster sample has no value in constant evaluation")
                }),
            other => Err(LaminaError::synthesis(format!(
                "{other:?} is not scalar-evaluable"
            ))),
        }
    }
}

/// Exposed input of a fragment. May fan out to several internal inputs.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct FragmentInput {
    pub name: String,
    pub ty: ValueType,
    pub default: SocketValue,
    pub targets: Vec<InputRef>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct FragmentOutput {
    pub name: String,
    pub ty: ValueType,
    pub source: OutputRef,
}

/// A reusable, self-contained piece of graph with declared ports.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Fragment {
    pub graph: Graph,
    pub inputs: Vec<FragmentInput>,
    pub outputs: Vec<FragmentOutput>,
}

impl Fragment {
    pub fn input(&self, name: &str) -> Option<&FragmentInput> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&FragmentOutput> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> LaminaResult<()> {
        for port in &self.inputs {
            for target in &port.targets {
                let socket = self
                    .graph
                    .node(target.node)
                    .and_then(|n| n.inputs.get(target.socket))
                    .ok_or_else(|| {
                        LaminaError::validation(format!(
                            "fragment input '{}' targets a missing socket",
                            port.name
                        ))
                    })?;
                if !port.ty.can_coerce_to(socket.ty) {
                    return Err(LaminaError::validation(format!(
                        "fragment input '{}' ({}) cannot drive a {} socket",
                        port.name, port.ty, socket.ty
                    )));
                }
            }
        }
        for port in &self.outputs {
            let socket = self
                .graph
                .node(port.source.node)
                .and_then(|n| n.outputs.get(port.source.socket))
                .ok_or_else(|| {
                    LaminaError::validation(format!(
                        "fragment output '{}' reads a missing socket",
                        port.name
                    ))
                })?;
            if !socket.ty.can_coerce_to(port.ty) {
                return Err(LaminaError::validation(format!(
                    "fragment output '{}' ({}) cannot be fed by a {} socket",
                    port.name, port.ty, socket.ty
                )));
            }
        }
        Ok(())
    }

    /// Wraps this fragment into a graph containing a single opaque group
    /// node, preserving the fragment's own nesting across later splices.
    pub fn into_group(self) -> Fragment {
        let inputs_decl = self.inputs.clone();
        let outputs_decl = self.outputs.clone();
        let mut graph = Graph::new();
        let group = graph.add(NodeKind::Group(Box::new(self)));
        Fragment {
            graph,
            inputs: inputs_decl
                .iter()
                .enumerate()
                .map(|(idx, p)| FragmentInput {
                    name: p.name.clone(),
                    ty: p.ty,
                    default: p.default,
                    targets: vec![InputRef {
                        node: group,
                        socket: idx,
                    }],
                })
                .collect(),
            outputs: outputs_decl
                .iter()
                .enumerate()
                .map(|(idx, p)| FragmentOutput {
                    name: p.name.clone(),
                    ty: p.ty,
                    source: OutputRef {
                        node: group,
                        socket: idx,
                    },
                })
                .collect(),
        }
    }
}

/// Result of splicing a fragment into a host graph.
pub struct Spliced {
    /// Fragment node id -> host node id.
    pub nodes: BTreeMap<NodeId, NodeId>,
    /// Fragment output port name -> host socket.
    pub outputs: BTreeMap<String, OutputRef>,
}

/// Copies a fragment's nodes and links into `host`, one nesting level deep
/// (nested groups are copied as opaque units), and wires its exposed inputs
/// to the caller-supplied sockets. Unbound inputs keep the port default.
pub fn splice(
    host: &mut Graph,
    fragment: &Fragment,
    bindings: &BTreeMap<String, OutputRef>,
) -> LaminaResult<Spliced> {
    fragment.validate()?;
    for name in bindings.keys() {
        if fragment.input(name).is_none() {
            return Err(LaminaError::validation(format!(
                "binding '{name}' does not match any fragment input"
            )));
        }
    }

    let mut node_map = BTreeMap::new();
    for (id, node) in fragment.graph.nodes() {
        let new_id = host.add(node.kind.clone());
        // Carry over edited socket defaults; `add` installs template values.
        if let Some(new_node) = host.nodes.get_mut(&new_id) {
            new_node.inputs = node.inputs.clone();
            new_node.outputs = node.outputs.clone();
        }
        node_map.insert(id, new_id);
    }

    let remap_out = |r: OutputRef| OutputRef {
        node: node_map[&r.node],
        socket: r.socket,
    };
    let remap_in = |r: InputRef| InputRef {
        node: node_map[&r.node],
        socket: r.socket,
    };

    for link in fragment.graph.links() {
        host.connect(remap_out(link.from), remap_in(link.to))?;
    }

    for port in &fragment.inputs {
        match bindings.get(&port.name) {
            Some(source) => {
                for target in &port.targets {
                    host.connect(*source, remap_in(*target))?;
                }
            }
            None => {
                for target in &port.targets {
                    host.set_default(remap_in(*target), port.default)?;
                }
            }
        }
    }

    let outputs = fragment
        .outputs
        .iter()
        .map(|p| (p.name.clone(), remap_out(p.source)))
        .collect();

    Ok(Spliced {
        nodes: node_map,
        outputs,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GraphFingerprint {
    pub hi: u64,
    pub lo: u64,
}

impl std::fmt::Display for GraphFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Content hash over node kinds, parameter values, and link topology.
/// Invariant under node id permutation: node labels are refined from local
/// signatures through their link neighborhoods (three rounds), then the
/// sorted label and link multisets are folded into a seeded FNV-1a pair.
pub fn structural_hash(graph: &Graph) -> GraphFingerprint {
    let ids: Vec<NodeId> = graph.nodes().map(|(id, _)| id).collect();
    let mut labels: BTreeMap<NodeId, u64> = graph
        .nodes()
        .map(|(id, node)| (id, node_signature(node)))
        .collect();

    for _ in 0..3 {
        let mut next = BTreeMap::new();
        for &id in &ids {
            let mut neighborhood: Vec<[u64; 4]> = Vec::new();
            for link in graph.links() {
                if link.to.node == id {
                    neighborhood.push([
                        0,
                        link.to.socket as u64,
                        link.from.socket as u64,
                        labels[&link.from.node],
                    ]);
                } else if link.from.node == id {
                    neighborhood.push([
                        1,
                        link.from.socket as u64,
                        link.to.socket as u64,
                        labels[&link.to.node],
                    ]);
                }
            }
            neighborhood.sort_unstable();

            let mut h = Fnv1a64::new(labels[&id]);
            for entry in &neighborhood {
                for v in entry {
                    h.write_u64(*v);
                }
            }
            next.insert(id, h.finish());
        }
        labels = next;
    }

    let mut node_labels: Vec<u64> = labels.values().copied().collect();
    node_labels.sort_unstable();

    let mut link_labels: Vec<[u64; 4]> = graph
        .links()
        .iter()
        .map(|l| {
            [
                labels[&l.from.node],
                l.from.socket as u64,
                labels[&l.to.node],
                l.to.socket as u64,
            ]
        })
        .collect();
    link_labels.sort_unstable();

    let mut a = Fnv1a64::new(0xcbf29ce484222325);
    let mut b = Fnv1a64::new(0x9ae16a3b2f90404f);
    for h in [&mut a, &mut b] {
        h.write_u64(node_labels.len() as u64);
        for label in &node_labels {
            h.write_u64(*label);
        }
        h.write_u64(link_labels.len() as u64);
        for entry in &link_labels {
            for v in entry {
                h.write_u64(*v);
            }
        }
    }
    GraphFingerprint {
        hi: a.finish(),
        lo: b.finish(),
    }
}

/// Hash of a fragment: its graph plus the declared port signatures.
pub fn fragment_hash(fragment: &Fragment) -> GraphFingerprint {
    let inner = structural_hash(&fragment.graph);
    let mut a = Fnv1a64::new(inner.hi);
    let mut b = Fnv1a64::new(inner.lo);
    for h in [&mut a, &mut b] {
        for port in &fragment.inputs {
            h.write_str(&port.name);
            h.write_u64(type_tag(port.ty));
            write_socket_value(h, &port.default);
        }
        for port in &fragment.outputs {
            h.write_str(&port.name);
            h.write_u64(type_tag(port.ty));
        }
    }
    GraphFingerprint {
        hi: a.finish(),
        lo: b.finish(),
    }
}

fn type_tag(ty: ValueType) -> u64 {
    match ty {
        ValueType::Scalar => 0,
        ValueType::Color => 1,
        ValueType::Vector => 2,
        ValueType::Normal => 3,
    }
}

fn write_socket_value(h: &mut Fnv1a64, v: &SocketValue) {
    match v {
        SocketValue::Scalar(x) => {
            h.write_u8(0);
            h.write_u64(x.to_bits());
        }
        SocketValue::Vector(xs) => {
            h.write_u8(1);
            for x in xs {
                h.write_u64(x.to_bits());
            }
        }
        SocketValue::Color(xs) => {
            h.write_u8(2);
            for x in xs {
                h.write_u64(x.to_bits());
            }
        }
    }
}

fn node_signature(node: &Node) -> u64 {
    let mut h = Fnv1a64::new(0x84222325_cbf29ce4);
    match &node.kind {
        NodeKind::Value(v) => {
            h.write_u8(0);
            h.write_u64(v.to_bits());
        }
        NodeKind::ColorValue(c) => {
            h.write_u8(1);
            for v in c {
                h.write_u64(v.to_bits());
            }
        }
        NodeKind::Math(op) => {
            h.write_u8(2);
            h.write_u8(*op as u8);
        }
        NodeKind::VectorMath(op) => {
            h.write_u8(3);
            h.write_u8(*op as u8);
        }
        NodeKind::Mix { op, ty } => {
            h.write_u8(4);
            h.write_u8(*op as u8);
            h.write_u64(type_tag(*ty));
        }
        NodeKind::Reroute(ty) => {
            h.write_u8(5);
            h.write_u64(type_tag(*ty));
        }
        NodeKind::PaintSample { image, channel } => {
            h.write_u8(6);
            h.write_str(image);
            h.write_u8(*channel as u8);
        }
        NodeKind::RasterSample { image, channel } => {
            h.write_u8(7);
            h.write_str(image);
            h.write_u8(*channel as u8);
        }
        NodeKind::Group(frag) => {
            h.write_u8(8);
            let fp = fragment_hash(frag);
            h.write_u64(fp.hi);
            h.write_u64(fp.lo);
        }
    }
    // Unlinked input defaults are parameter values.
    for socket in &node.inputs {
        write_socket_value(&mut h, &socket.default);
    }
    h.finish()
}

#[derive(Clone, Copy)]
pub(crate) struct Fnv1a64(u64);

impl Fnv1a64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub(crate) fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub(crate) fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_bytes(s.as_bytes());
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        let mut h = self.0;
        for &b in bytes {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        self.0 = h;
    }

    pub(crate) fn finish(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multiply_fragment() -> Fragment {
        let mut graph = Graph::new();
        let mul = graph.add(NodeKind::Math(MathOp::Multiply));
        Fragment {
            graph,
            inputs: vec![
                FragmentInput {
                    name: "A".to_string(),
                    ty: ValueType::Scalar,
                    default: SocketValue::Scalar(1.0),
                    targets: vec![InputRef {
                        node: mul,
                        socket: 0,
                    }],
                },
                FragmentInput {
                    name: "B".to_string(),
                    ty: ValueType::Scalar,
                    default: SocketValue::Scalar(1.0),
                    targets: vec![InputRef {
                        node: mul,
                        socket: 1,
                    }],
                },
            ],
            outputs: vec![FragmentOutput {
                name: "Value".to_string(),
                ty: ValueType::Scalar,
                source: OutputRef {
                    node: mul,
                    socket: 0,
                },
            }],
        }
    }

    #[test]
    fn connect_replaces_existing_driver() {
        let mut g = Graph::new();
        let a = g.add(NodeKind::Value(1.0));
        let b = g.add(NodeKind::Value(2.0));
        let m = g.add(NodeKind::Math(MathOp::Add));

        let to = g.in_ref(m, 0).unwrap();
        g.connect(g.out_ref(a, 0).unwrap(), to).unwrap();
        g.connect(g.out_ref(b, 0).unwrap(), to).unwrap();

        assert_eq!(g.input_driver(to), Some(g.out_ref(b, 0).unwrap()));
        assert_eq!(g.links().len(), 1);
    }

    #[test]
    fn connect_rejects_vector_into_scalar() {
        let mut g = Graph::new();
        let v = g.add(NodeKind::ColorValue([1.0, 0.0, 0.0, 1.0]));
        let m = g.add(NodeKind::Math(MathOp::Add));
        let err = g
            .connect(g.out_ref(v, 0).unwrap(), g.in_ref(m, 0).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("cannot connect"));
    }

    #[test]
    fn scalar_broadcasts_into_color_input() {
        let mut g = Graph::new();
        let s = g.add(NodeKind::Value(0.5));
        let mix = g.add(NodeKind::Mix {
            op: MixOp::Mix,
            ty: ValueType::Color,
        });
        g.connect(g.out_ref(s, 0).unwrap(), g.in_ref(mix, 1).unwrap())
            .unwrap();
    }

    #[test]
    fn splice_wires_bindings_and_defaults() {
        let mut host = Graph::new();
        let half = host.add(NodeKind::Value(0.5));
        let bindings = BTreeMap::from([("A".to_string(), host.out_ref(half, 0).unwrap())]);

        let spliced = splice(&mut host, &multiply_fragment(), &bindings).unwrap();
        let out = spliced.outputs["Value"];

        // B stays at the port default of 1.0, so the product is 0.5.
        let v = host.eval_scalar(out, &|_| None).unwrap();
        assert!((v - 0.5).abs() < 1e-9);
    }

    #[test]
    fn splice_rejects_unknown_binding() {
        let mut host = Graph::new();
        let half = host.add(NodeKind::Value(0.5));
        let bindings = BTreeMap::from([("Nope".to_string(), host.out_ref(half, 0).unwrap())]);
        assert!(splice(&mut host, &multiply_fragment(), &bindings).is_err());
    }

    #[test]
    fn structural_hash_ignores_node_ids() {
        // Same topology built in two different insertion orders.
        let mut g1 = Graph::new();
        let a1 = g1.add(NodeKind::Value(2.0));
        let m1 = g1.add(NodeKind::Math(MathOp::Multiply));
        g1.connect(g1.out_ref(a1, 0).unwrap(), g1.in_ref(m1, 0).unwrap())
            .unwrap();

        let mut g2 = Graph::new();
        let _padding = g2.add(NodeKind::Value(9.0));
        let m2 = g2.add(NodeKind::Math(MathOp::Multiply));
        let a2 = g2.add(NodeKind::Value(2.0));
        g2.connect(g2.out_ref(a2, 0).unwrap(), g2.in_ref(m2, 0).unwrap())
            .unwrap();

        // Remove the padding effect by rebuilding without it.
        let mut g3 = Graph::new();
        let m3 = g3.add(NodeKind::Math(MathOp::Multiply));
        let a3 = g3.add(NodeKind::Value(2.0));
        g3.connect(g3.out_ref(a3, 0).unwrap(), g3.in_ref(m3, 0).unwrap())
            .unwrap();

        assert_eq!(structural_hash(&g1), structural_hash(&g3));
        assert_ne!(structural_hash(&g1), structural_hash(&g2));
    }

    #[test]
    fn structural_hash_sees_parameter_changes() {
        let mut g1 = Graph::new();
        g1.add(NodeKind::Value(1.0));
        let mut g2 = Graph::new();
        g2.add(NodeKind::Value(2.0));
        assert_ne!(structural_hash(&g1), structural_hash(&g2));
    }

    #[test]
    fn structural_hash_sees_default_changes() {
        let build = |b_default: f64| {
            let mut g = Graph::new();
            let m = g.add(NodeKind::Math(MathOp::Multiply));
            g.set_default(
                g.in_ref(m, 1).unwrap(),
                SocketValue::Scalar(b_default),
            )
            .unwrap();
            g
        };
        assert_ne!(structural_hash(&build(1.0)), structural_hash(&build(0.5)));
    }

    #[test]
    fn group_eval_recurses_with_port_values() {
        let grouped = multiply_fragment().into_group();
        let mut host = Graph::new();
        let a = host.add(NodeKind::Value(0.25));
        let bindings = BTreeMap::from([("A".to_string(), host.out_ref(a, 0).unwrap())]);
        let spliced = splice(&mut host, &grouped, &bindings).unwrap();

        let v = host.eval_scalar(spliced.outputs["Value"], &|_| None).unwrap();
        assert!((v - 0.25).abs() < 1e-9);
    }

    #[test]
    fn nested_group_stays_opaque_across_splice() {
        let grouped = multiply_fragment().into_group();
        let mut host = Graph::new();
        let spliced = splice(&mut host, &grouped, &BTreeMap::new()).unwrap();

        assert_eq!(host.node_count(), 1);
        let (_, node) = host.nodes().next().unwrap();
        assert!(matches!(node.kind, NodeKind::Group(_)));
        assert_eq!(spliced.nodes.len(), 1);
    }
}
