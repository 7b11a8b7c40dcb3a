//! Bake cache.
//!
//! A bake runs a sub-graph through the external rasterization
//! collaborator and records the result keyed by the sub-graph's
//! structural hash. While a record is live, compilation splices a raster
//! read in place of the live material, so graph edits behind a bake stay
//! invisible until the bake is freed. Factor-side edits (opacity, mask,
//! blend mode) are wired outside the baked sub-graph and remain live.
//!
//! Commits are all-or-nothing: a rasterization failure for any channel
//! leaves the cache exactly as it was.

use std::collections::BTreeMap;

use image::Rgba32FImage;

use crate::{
    error::{LaminaError, LaminaResult},
    graph::{Fragment, FragmentOutput, Graph, GraphFingerprint, NodeKind, ValueType, fragment_hash},
    model::{Channel, Layer, LayerStack},
};

/// External rasterization collaborator: evaluates a fragment's first
/// output over a target resolution.
pub trait Rasterizer {
    fn rasterize(
        &mut self,
        fragment: &Fragment,
        resolution: (u32, u32),
    ) -> LaminaResult<Rgba32FImage>;
}

/// Where one channel's baked value lives. Scalar results pack three to
/// an RGB image (`channel` in `0..3`); color and vector results own a
/// whole image (`channel == -1`).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BakedChannel {
    pub image: String,
    pub channel: i8,
}

/// One committed bake: raster refs per channel plus the fingerprint of
/// the sub-graph that produced them.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BakeRecord {
    pub fingerprint: GraphFingerprint,
    pub resolution: (u32, u32),
    pub channels: BTreeMap<String, BakedChannel>,
}

#[derive(Clone, Debug, Default)]
pub struct BakeCache {
    layers: BTreeMap<String, BakeRecord>,
    stack: Option<BakeRecord>,
    images: BTreeMap<String, Rgba32FImage>,
    next_image: u64,
}

impl BakeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer_record(&self, id: &str) -> Option<&BakeRecord> {
        self.layers.get(id)
    }

    pub fn stack_record(&self) -> Option<&BakeRecord> {
        self.stack.as_ref()
    }

    pub fn image(&self, name: &str) -> Option<&Rgba32FImage> {
        self.images.get(name)
    }

    /// True when a layer's record no longer matches its live material.
    /// Staleness is detected lazily; a stale record keeps being used for
    /// compilation until an explicit rebake or free.
    pub fn is_stale(&self, stack: &LayerStack, id: &str) -> bool {
        match (self.layers.get(id), stack.layer(id)) {
            (Some(record), Some(layer)) => record.fingerprint != fragment_hash(&layer.material),
            _ => false,
        }
    }

    /// Bakes one layer's material for every enabled channel it carries.
    /// Always recomputes, so a stale record is refreshed rather than
    /// reused.
    #[tracing::instrument(skip(self, stack, raster))]
    pub fn bake_layer(
        &mut self,
        stack: &mut LayerStack,
        id: &str,
        raster: &mut dyn Rasterizer,
        resolution: (u32, u32),
    ) -> LaminaResult<()> {
        let layer = stack
            .layer(id)
            .ok_or_else(|| LaminaError::bake(format!("unknown layer '{id}'")))?;
        let channels: Vec<Channel> = stack
            .enabled_channels()
            .filter(|c| layer.carries(&c.name))
            .cloned()
            .collect();
        if channels.is_empty() {
            return Err(LaminaError::bake(format!(
                "layer '{id}' carries no enabled channel"
            )));
        }

        let mut staging = Staging::new(self.next_image, resolution);
        for channel in &channels {
            let fragment = material_channel_fragment(layer, channel)?;
            let raster_result = rasterize_checked(raster, &fragment, resolution)?;
            staging.place(channel, raster_result);
        }
        let fingerprint = fragment_hash(&layer.material);

        // Commit point: nothing above mutated the cache.
        let previous = self.layers.remove(id);
        self.drop_images(previous);
        let (images, baked, next_image) = staging.finish();
        self.next_image = next_image;
        self.images.extend(images);
        self.layers.insert(
            id.to_string(),
            BakeRecord {
                fingerprint,
                resolution,
                channels: baked,
            },
        );
        for channel in &channels {
            stack.mark_channel_dirty(&channel.name);
        }
        tracing::debug!(layer = id, "bake committed");
        Ok(())
    }

    /// Bakes the fold result of the whole stack: one raster per enabled
    /// channel, read back by compilation in place of the entire chain.
    /// The caller supplies the live per-channel fragments (the compiled
    /// stack's channels wrapped as fragments) so baked layers inside the
    /// fold are honored.
    #[tracing::instrument(skip_all)]
    pub fn bake_stack(
        &mut self,
        stack: &mut LayerStack,
        fragments: &BTreeMap<String, Fragment>,
        fingerprint: GraphFingerprint,
        raster: &mut dyn Rasterizer,
        resolution: (u32, u32),
    ) -> LaminaResult<()> {
        let channels: Vec<Channel> = stack.enabled_channels().cloned().collect();
        let mut staging = Staging::new(self.next_image, resolution);
        for channel in &channels {
            let fragment = fragments.get(&channel.name).ok_or_else(|| {
                LaminaError::bake(format!(
                    "no compiled fragment supplied for channel '{}'",
                    channel.name
                ))
            })?;
            let raster_result = rasterize_checked(raster, fragment, resolution)?;
            staging.place(channel, raster_result);
        }

        let previous = self.stack.take();
        self.drop_images(previous);
        let (images, baked, next_image) = staging.finish();
        self.next_image = next_image;
        self.images.extend(images);
        self.stack = Some(BakeRecord {
            fingerprint,
            resolution,
            channels: baked,
        });
        for channel in &channels {
            stack.mark_channel_dirty(&channel.name);
        }
        tracing::debug!("stack bake committed");
        Ok(())
    }

    /// Discards a layer's record; compilation falls back to the live
    /// sub-graph on the next rebuild.
    pub fn free_bake_layer(&mut self, stack: &mut LayerStack, id: &str) -> LaminaResult<()> {
        let record = self
            .layers
            .remove(id)
            .ok_or_else(|| LaminaError::bake(format!("layer '{id}' is not baked")))?;
        for name in record.channels.keys() {
            stack.mark_channel_dirty(name);
        }
        self.drop_images(Some(record));
        Ok(())
    }

    pub fn free_bake_stack(&mut self, stack: &mut LayerStack) -> LaminaResult<()> {
        let record = self
            .stack
            .take()
            .ok_or_else(|| LaminaError::bake("stack is not baked"))?;
        for name in record.channels.keys() {
            stack.mark_channel_dirty(name);
        }
        self.drop_images(Some(record));
        Ok(())
    }

    /// Record metadata for persistence; raster contents stay external.
    pub fn records(&self) -> (BTreeMap<String, BakeRecord>, Option<BakeRecord>) {
        (self.layers.clone(), self.stack.clone())
    }

    /// Rebuilds cache bookkeeping from persisted metadata. Raster
    /// contents are resolved by name by the shading host.
    pub fn from_records(
        layers: BTreeMap<String, BakeRecord>,
        stack: Option<BakeRecord>,
    ) -> Self {
        let next_image = layers
            .values()
            .chain(stack.iter())
            .flat_map(|r| r.channels.values())
            .filter_map(|b| b.image.strip_prefix("bake."))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        Self {
            layers,
            stack,
            images: BTreeMap::new(),
            next_image,
        }
    }

    fn drop_images(&mut self, record: Option<BakeRecord>) {
        let Some(record) = record else { return };
        for baked in record.channels.values() {
            // Shared scalar pages host up to three records' channels,
            // but only within one record; cross-record sharing never
            // happens, so dropping by name is safe.
            self.images.remove(&baked.image);
        }
    }
}

/// A collaborator result at the wrong resolution is a bake failure, not
/// something staging may index into.
fn rasterize_checked(
    raster: &mut dyn Rasterizer,
    fragment: &Fragment,
    resolution: (u32, u32),
) -> LaminaResult<Rgba32FImage> {
    let image = raster.rasterize(fragment, resolution)?;
    if image.dimensions() != resolution {
        let (w, h) = image.dimensions();
        return Err(LaminaError::bake(format!(
            "rasterizer returned a {w}x{h} image for a {}x{} request",
            resolution.0, resolution.1
        )));
    }
    Ok(image)
}

/// Builds the fragment baked for one (layer, channel): the material kept
/// nested as a group, one output socket for the channel.
fn material_channel_fragment(layer: &Layer, channel: &Channel) -> LaminaResult<Fragment> {
    let mut graph = Graph::new();
    let group = graph.add(NodeKind::Group(Box::new(layer.material.clone())));
    let source = graph.output_named(group, &channel.name).ok_or_else(|| {
        LaminaError::bake(format!(
            "layer '{}' material has no output for channel '{}'",
            layer.id, channel.name
        ))
    })?;
    Ok(Fragment {
        graph,
        inputs: vec![],
        outputs: vec![FragmentOutput {
            name: channel.name.clone(),
            ty: channel.ty,
            source,
        }],
    })
}

/// Accumulates raster results without touching the cache, so a failure
/// mid-bake discards everything.
struct Staging {
    images: BTreeMap<String, Rgba32FImage>,
    baked: BTreeMap<String, BakedChannel>,
    scalar_page: Option<(String, u8)>,
    next_image: u64,
    resolution: (u32, u32),
}

impl Staging {
    fn new(next_image: u64, resolution: (u32, u32)) -> Self {
        Self {
            images: BTreeMap::new(),
            baked: BTreeMap::new(),
            scalar_page: None,
            next_image,
            resolution,
        }
    }

    fn fresh_name(&mut self) -> String {
        let name = format!("bake.{}", self.next_image);
        self.next_image += 1;
        name
    }

    fn place(&mut self, channel: &Channel, raster: Rgba32FImage) {
        if channel.ty == ValueType::Scalar {
            let (page, slot) = match self.scalar_page.take() {
                Some((page, slot)) if slot < 3 => (page, slot),
                _ => {
                    let page = self.fresh_name();
                    self.images
                        .insert(page.clone(), Rgba32FImage::new(self.resolution.0, self.resolution.1));
                    (page, 0)
                }
            };
            if let Some(pixels) = self.images.get_mut(&page) {
                for (x, y, px) in pixels.enumerate_pixels_mut() {
                    px.0[slot as usize] = raster.get_pixel(x, y).0[0];
                }
            }
            self.baked.insert(
                channel.name.clone(),
                BakedChannel {
                    image: page.clone(),
                    channel: slot as i8,
                },
            );
            self.scalar_page = Some((page, slot + 1));
        } else {
            let name = self.fresh_name();
            self.images.insert(name.clone(), raster);
            self.baked.insert(
                channel.name.clone(),
                BakedChannel {
                    image: name,
                    channel: -1,
                },
            );
        }
    }

    fn finish(
        self,
    ) -> (
        BTreeMap<String, Rgba32FImage>,
        BTreeMap<String, BakedChannel>,
        u64,
    ) {
        (self.images, self.baked, self.next_image)
    }
}
