use std::collections::BTreeMap;

use crate::{
    blend::BlendMode,
    error::{LaminaError, LaminaResult},
    graph::{Fragment, SocketValue, ValueType},
    pack::PaintRef,
    rebuild::DirtySet,
};

/// A single named output value of the layer stack, with a fixed value
/// type. Channels are defined at stack initialization from the reference
/// shader's sockets; only `enabled` is mutable afterwards.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Channel {
    pub name: String,
    pub ty: ValueType,
    pub default: SocketValue,
    pub enabled: bool,
    /// Re-normalize vector-family channels after each blend.
    pub renormalize: bool,
}

impl Channel {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Channel {
            name: name.into(),
            ty,
            default: SocketValue::zero_of(ty),
            enabled: true,
            renormalize: matches!(ty, ValueType::Normal),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LayerKind {
    /// Full material with a paintable alpha mask.
    MaterialPaint,
    /// Full material applied everywhere (alpha from opacity/mask only).
    MaterialFill,
    /// Material whose alpha comes from its own sub-graph.
    CustomAlpha,
    /// Paints values into channels directly; alpha is paintable.
    ChannelPaint,
}

impl LayerKind {
    pub fn has_painted_alpha(self) -> bool {
        matches!(self, LayerKind::MaterialPaint | LayerKind::ChannelPaint)
    }
}

/// Per-layer, per-channel blend settings. A channel absent from a layer's
/// map contributes identity to that channel's chain.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LayerChannelSettings {
    pub blend: BlendMode,
    pub enabled: bool,
    /// Extra per-channel factor; only wired into the chain when < 1.0.
    pub opacity: f64,
}

impl Default for LayerChannelSettings {
    fn default() -> Self {
        LayerChannelSettings {
            blend: BlendMode::Mix,
            enabled: true,
            opacity: 1.0,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Layer {
    pub id: String,
    pub name: String,
    pub kind: LayerKind,
    pub enabled: bool,
    /// The layer's material sub-graph. Output ports named after the
    /// channels they feed.
    pub material: Fragment,
    pub opacity: f64,
    /// Painted-alpha raster reference; absent for the base layer and
    /// kinds without a paintable alpha.
    pub paint: Option<PaintRef>,
    pub node_mask: Option<Fragment>,
    /// Alpha-producing sub-graph for `CustomAlpha` layers.
    pub alpha_source: Option<Fragment>,
    pub channels: BTreeMap<String, LayerChannelSettings>,
}

impl Layer {
    /// Whether this layer contributes to `channel` (rather than passing
    /// the accumulated value through unchanged).
    pub fn carries(&self, channel: &str) -> bool {
        self.enabled && self.channels.get(channel).is_some_and(|s| s.enabled)
    }
}

/// The ordered stack of layers over one base layer, plus the channel set.
/// Layer index 0 is always the base layer.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LayerStack {
    channels: BTreeMap<String, Channel>,
    layers: Vec<Layer>,
    next_layer_seq: u64,
    #[serde(skip)]
    dirty: DirtySet,
}

impl LayerStack {
    /// Creates a stack from a reference shader's channel set and the base
    /// material. The base material must cover every enabled channel.
    pub fn new(channels: Vec<Channel>, base_material: Fragment) -> LaminaResult<Self> {
        if channels.is_empty() {
            return Err(LaminaError::validation("a stack needs at least one channel"));
        }
        let mut channel_map = BTreeMap::new();
        for ch in channels {
            if ch.name.trim().is_empty() {
                return Err(LaminaError::validation("channel name must be non-empty"));
            }
            if channel_map.insert(ch.name.clone(), ch).is_some() {
                return Err(LaminaError::validation("duplicate channel name"));
            }
        }

        let coverage = material_coverage(&channel_map, &base_material)?;
        for ch in channel_map.values().filter(|c| c.enabled) {
            if !coverage.contains_key(&ch.name) {
                return Err(LaminaError::incompatible_material(format!(
                    "base material does not cover enabled channel '{}'",
                    ch.name
                )));
            }
        }

        let base = Layer {
            id: "layer.0".to_string(),
            name: "Base".to_string(),
            kind: LayerKind::MaterialFill,
            enabled: true,
            material: base_material,
            opacity: 1.0,
            paint: None,
            node_mask: None,
            alpha_source: None,
            channels: coverage,
        };

        let mut stack = LayerStack {
            channels: channel_map,
            layers: vec![base],
            next_layer_seq: 1,
            dirty: DirtySet::default(),
        };
        stack.dirty.mark_topology();
        Ok(stack)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values().filter(|c| c.enabled)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn base_layer(&self) -> &Layer {
        &self.layers[0]
    }

    pub fn top_layer(&self) -> &Layer {
        self.layers.last().unwrap_or(&self.layers[0])
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// Drains the dirty set; called by the rebuild controller once a
    /// rebuild has committed.
    pub fn take_dirty(&mut self) -> DirtySet {
        std::mem::take(&mut self.dirty)
    }

    // Bake state changes compiled output without going through a stack
    // mutation, so the cache marks its own scope.
    pub(crate) fn mark_channel_dirty(&mut self, channel: &str) {
        self.dirty.mark_channel(channel);
    }

    /// Adds a layer above the base. `position` is the target stack index
    /// (1..=len). Returns the new layer's id.
    pub fn add_layer(
        &mut self,
        name: impl Into<String>,
        kind: LayerKind,
        position: usize,
        material: Fragment,
    ) -> LaminaResult<String> {
        if position == 0 || position > self.layers.len() {
            return Err(LaminaError::validation(format!(
                "layer position {position} out of bounds (1..={})",
                self.layers.len()
            )));
        }
        let coverage = material_coverage(&self.channels, &material)?;

        let id = format!("layer.{}", self.next_layer_seq);
        self.next_layer_seq += 1;
        let layer = Layer {
            id: id.clone(),
            name: name.into(),
            kind,
            enabled: true,
            material,
            opacity: 1.0,
            paint: None,
            node_mask: None,
            alpha_source: None,
            channels: coverage,
        };
        self.layers.insert(position, layer);
        self.dirty.mark_topology();
        Ok(id)
    }

    pub fn remove_layer(&mut self, id: &str) -> LaminaResult<Layer> {
        let position = self.require_above_base(id, "remove")?;
        let layer = self.layers.remove(position);
        self.dirty.mark_topology();
        Ok(layer)
    }

    pub fn reorder_layer(&mut self, id: &str, new_position: usize) -> LaminaResult<()> {
        let position = self.require_above_base(id, "reorder")?;
        if new_position == 0 || new_position >= self.layers.len() {
            return Err(LaminaError::validation(format!(
                "layer position {new_position} out of bounds (1..={})",
                self.layers.len() - 1
            )));
        }
        let layer = self.layers.remove(position);
        self.layers.insert(new_position, layer);
        self.dirty.mark_topology();
        Ok(())
    }

    pub fn set_layer_enabled(&mut self, id: &str, enabled: bool) -> LaminaResult<()> {
        let position = self.require_above_base(id, "disable")?;
        self.layers[position].enabled = enabled;
        self.mark_layer_channels(position);
        Ok(())
    }

    /// Enables or disables one channel on one layer.
    pub fn set_channel_enabled(
        &mut self,
        id: &str,
        channel: &str,
        enabled: bool,
    ) -> LaminaResult<()> {
        self.require_channel(channel)?;
        let position = self.require_above_base(id, "toggle a channel on")?;
        let settings = self.layers[position]
            .channels
            .get_mut(channel)
            .ok_or_else(|| {
                LaminaError::validation(format!(
                    "layer '{id}' material does not cover channel '{channel}'"
                ))
            })?;
        settings.enabled = enabled;
        self.dirty.mark_channel(channel);
        Ok(())
    }

    /// Enables or disables a channel for the whole stack.
    pub fn set_stack_channel_enabled(&mut self, channel: &str, enabled: bool) -> LaminaResult<()> {
        self.require_channel(channel)?;
        if enabled && !self.layers[0].channels.contains_key(channel) {
            return Err(LaminaError::incompatible_material(format!(
                "base material does not cover channel '{channel}'"
            )));
        }
        if let Some(ch) = self.channels.get_mut(channel) {
            ch.enabled = enabled;
        }
        self.dirty.mark_topology();
        Ok(())
    }

    pub fn set_blend_mode(&mut self, id: &str, channel: &str, mode: BlendMode) -> LaminaResult<()> {
        self.require_channel(channel)?;
        let position = self.require_above_base(id, "set a blend mode on")?;
        let settings = self.layers[position]
            .channels
            .get_mut(channel)
            .ok_or_else(|| {
                LaminaError::validation(format!(
                    "layer '{id}' material does not cover channel '{channel}'"
                ))
            })?;
        settings.blend = mode;
        self.dirty.mark_channel(channel);
        Ok(())
    }

    pub fn set_opacity(&mut self, id: &str, value: f64) -> LaminaResult<()> {
        let position = self.require_above_base(id, "set opacity on")?;
        self.layers[position].opacity = value.clamp(0.0, 1.0);
        self.mark_layer_channels(position);
        Ok(())
    }

    pub fn set_channel_opacity(&mut self, id: &str, channel: &str, value: f64) -> LaminaResult<()> {
        self.require_channel(channel)?;
        let position = self.require_above_base(id, "set channel opacity on")?;
        let settings = self.layers[position]
            .channels
            .get_mut(channel)
            .ok_or_else(|| {
                LaminaError::validation(format!(
                    "layer '{id}' material does not cover channel '{channel}'"
                ))
            })?;
        settings.opacity = value.clamp(0.0, 1.0);
        self.dirty.mark_channel(channel);
        Ok(())
    }

    pub fn set_node_mask(&mut self, id: &str, mask: Option<Fragment>) -> LaminaResult<()> {
        let position = self.require_above_base(id, "set a node mask on")?;
        if let Some(fragment) = &mask {
            fragment.validate()?;
            let first_out = fragment.outputs.first().ok_or_else(|| {
                LaminaError::validation("node mask fragment must have at least one output")
            })?;
            if first_out.ty != ValueType::Scalar {
                return Err(LaminaError::validation(
                    "node mask fragment's first output must be scalar",
                ));
            }
        }
        self.layers[position].node_mask = mask;
        self.mark_layer_channels(position);
        Ok(())
    }

    /// Replaces a layer's material sub-graph, keeping settings of channels
    /// that remain covered.
    pub fn set_material(&mut self, id: &str, material: Fragment) -> LaminaResult<()> {
        let position = self
            .position_of(id)
            .ok_or_else(|| LaminaError::validation(format!("no layer with id '{id}'")))?;
        let mut coverage = material_coverage(&self.channels, &material)?;

        if position == 0 {
            for ch in self.channels.values().filter(|c| c.enabled) {
                if !coverage.contains_key(&ch.name) {
                    return Err(LaminaError::incompatible_material(format!(
                        "base material does not cover enabled channel '{}'",
                        ch.name
                    )));
                }
            }
        }

        let layer = &mut self.layers[position];
        let old_channels: Vec<String> = layer.channels.keys().cloned().collect();
        for (name, settings) in &layer.channels {
            if let Some(kept) = coverage.get_mut(name) {
                *kept = settings.clone();
            }
        }
        layer.material = material;
        layer.channels = coverage;

        for ch in old_channels {
            self.dirty.mark_channel(&ch);
        }
        let new_channels: Vec<String> = self.layers[position].channels.keys().cloned().collect();
        for ch in new_channels {
            self.dirty.mark_channel(&ch);
        }
        Ok(())
    }

    /// Points a layer's painted alpha at a raster resource. Only layer
    /// kinds with a paintable alpha accept one.
    pub fn set_paint(&mut self, id: &str, paint: Option<PaintRef>) -> LaminaResult<()> {
        let position = self.require_above_base(id, "assign paint to")?;
        if paint.is_some() && !self.layers[position].kind.has_painted_alpha() {
            return Err(LaminaError::validation(format!(
                "layer '{id}' ({:?}) has no paintable alpha",
                self.layers[position].kind
            )));
        }
        self.layers[position].paint = paint;
        self.mark_layer_channels(position);
        Ok(())
    }

    /// Sets the alpha-producing sub-graph of a `CustomAlpha` layer.
    pub fn set_alpha_source(&mut self, id: &str, fragment: Fragment) -> LaminaResult<()> {
        let position = self.require_above_base(id, "set an alpha source on")?;
        if self.layers[position].kind != LayerKind::CustomAlpha {
            return Err(LaminaError::validation(format!(
                "layer '{id}' is not a CustomAlpha layer"
            )));
        }
        fragment.validate()?;
        let first_out = fragment.outputs.first().ok_or_else(|| {
            LaminaError::validation("alpha source fragment must have at least one output")
        })?;
        if first_out.ty != ValueType::Scalar {
            return Err(LaminaError::validation(
                "alpha source fragment's first output must be scalar",
            ));
        }
        self.layers[position].alpha_source = Some(fragment);
        self.mark_layer_channels(position);
        Ok(())
    }

    fn mark_layer_channels(&mut self, position: usize) {
        let carried: Vec<String> = self.layers[position].channels.keys().cloned().collect();
        for ch in carried {
            self.dirty.mark_channel(&ch);
        }
    }

    fn require_channel(&self, channel: &str) -> LaminaResult<()> {
        if !self.channels.contains_key(channel) {
            return Err(LaminaError::validation(format!(
                "no channel named '{channel}'"
            )));
        }
        Ok(())
    }

    fn require_above_base(&self, id: &str, action: &str) -> LaminaResult<usize> {
        let position = self
            .position_of(id)
            .ok_or_else(|| LaminaError::validation(format!("no layer with id '{id}'")))?;
        if position == 0 {
            return Err(LaminaError::validation(format!(
                "cannot {action} the base layer"
            )));
        }
        Ok(position)
    }
}

/// Maps a material fragment's outputs onto the stack's channels. Output
/// ports are matched to channels by name; a matching port with an
/// unconvertible type is an error, and a material covering no channel at
/// all is an error.
pub(crate) fn material_coverage(
    channels: &BTreeMap<String, Channel>,
    material: &Fragment,
) -> LaminaResult<BTreeMap<String, LayerChannelSettings>> {
    material.validate()?;

    let mut coverage = BTreeMap::new();
    for port in &material.outputs {
        let Some(channel) = channels.get(&port.name) else {
            continue;
        };
        if !port.ty.can_coerce_to(channel.ty) {
            return Err(LaminaError::incompatible_material(format!(
                "material output '{}' is {} but channel expects {}",
                port.name, port.ty, channel.ty
            )));
        }
        coverage.insert(port.name.clone(), LayerChannelSettings::default());
    }

    if coverage.is_empty() {
        return Err(LaminaError::incompatible_material(
            "material covers no channel of the stack",
        ));
    }
    Ok(coverage)
}
