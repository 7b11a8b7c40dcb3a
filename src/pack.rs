//! Shared raster storage for painted alpha.
//!
//! Painted alpha is a single scalar plane per layer, so up to three
//! layers share one RGB page instead of each owning a full image.
//! Consumers that need exclusive access (an external editor, a resize)
//! get the region extracted into a standalone resource first. Packing is
//! a memory trade-off only; it never changes what a channel compiles to.

use std::collections::BTreeMap;

use image::{ImageBuffer, Luma, Rgba, Rgba32FImage};

use crate::error::{LaminaError, LaminaResult};

/// Standalone scalar plane produced by extraction.
pub type AlphaImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Where a layer's painted alpha lives: a named image plus the color
/// channel holding the data. `channel` in `0..3` selects a slot of a
/// shared page; `-1` means the image is standalone and wholly owned.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PaintRef {
    pub image: String,
    pub channel: i8,
}

impl PaintRef {
    pub fn is_shared(&self) -> bool {
        self.channel >= 0
    }
}

/// What a region is used for. Keys the region table together with the
/// owning layer id.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum PaintPurpose {
    PaintedAlpha,
}

const SLOTS_PER_PAGE: usize = 3;

#[derive(Clone, Debug)]
struct PackPage {
    resolution: (u32, u32),
    pixels: Rgba32FImage,
    // Slot index -> owning (layer, purpose), None when free.
    slots: [Option<(String, PaintPurpose)>; SLOTS_PER_PAGE],
}

impl PackPage {
    fn new(resolution: (u32, u32)) -> Self {
        Self {
            resolution,
            pixels: Rgba32FImage::new(resolution.0, resolution.1),
            slots: [None, None, None],
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Serializable region table: enough to rebuild the pack's bookkeeping on
/// load. Pixel contents are external resources and are not persisted here.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct PackTable {
    pub regions: Vec<PackRegion>,
    pub next_page: u64,
    pub next_alpha: u64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PackRegion {
    pub owner: String,
    pub purpose: PaintPurpose,
    pub paint: PaintRef,
    pub resolution: (u32, u32),
}

/// Arena of shared pages plus standalone extracted planes.
#[derive(Clone, Debug, Default)]
pub struct PackManager {
    pages: BTreeMap<String, PackPage>,
    standalone: BTreeMap<String, AlphaImage>,
    regions: BTreeMap<(String, PaintPurpose), PaintRef>,
    next_page: u64,
    next_alpha: u64,
}

impl PackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A readable/writable handle for `(owner, purpose)`. Repeated calls
    /// return the existing region; otherwise the first free slot of a
    /// page at the requested resolution is claimed, growing the arena by
    /// one page when every slot is taken.
    #[tracing::instrument(skip(self))]
    pub fn acquire(
        &mut self,
        owner: &str,
        purpose: PaintPurpose,
        resolution: (u32, u32),
    ) -> LaminaResult<PaintRef> {
        let key = (owner.to_string(), purpose);
        if let Some(existing) = self.regions.get(&key) {
            return Ok(existing.clone());
        }

        let page_name = self
            .pages
            .iter()
            .find(|(_, page)| page.resolution == resolution && page.free_slot().is_some())
            .map(|(name, _)| name.clone());
        let page_name = match page_name {
            Some(name) => name,
            None => {
                let name = format!("pack.{}", self.next_page);
                self.next_page += 1;
                self.pages.insert(name.clone(), PackPage::new(resolution));
                name
            }
        };

        let page = self
            .pages
            .get_mut(&page_name)
            .ok_or_else(|| LaminaError::validation("pack page vanished during acquire"))?;
        let slot = page
            .free_slot()
            .ok_or_else(|| LaminaError::validation("pack page has no free slot"))?;
        page.slots[slot] = Some(key.clone());

        let paint = PaintRef {
            image: page_name,
            channel: slot as i8,
        };
        self.regions.insert(key, paint.clone());
        Ok(paint)
    }

    /// Like [`acquire`](Self::acquire), but guarantees the returned image
    /// is not shared with any other region: a shared region is extracted
    /// into a standalone plane first and its slot returned to the pack.
    #[tracing::instrument(skip(self))]
    pub fn acquire_exclusive(
        &mut self,
        owner: &str,
        purpose: PaintPurpose,
        resolution: (u32, u32),
    ) -> LaminaResult<PaintRef> {
        let paint = self.acquire(owner, purpose, resolution)?;
        if !paint.is_shared() {
            return Ok(paint);
        }
        self.extract(owner, purpose, &paint)
    }

    /// Copies a shared region into a standalone plane, rewrites the
    /// region table, and frees the slot.
    fn extract(
        &mut self,
        owner: &str,
        purpose: PaintPurpose,
        paint: &PaintRef,
    ) -> LaminaResult<PaintRef> {
        let page = self.pages.get(&paint.image).ok_or_else(|| {
            LaminaError::validation(format!("unknown pack page '{}'", paint.image))
        })?;
        let (w, h) = page.resolution;
        let slot = paint.channel as usize;

        let mut plane = AlphaImage::new(w, h);
        for (x, y, px) in plane.enumerate_pixels_mut() {
            let Rgba(src) = *page.pixels.get_pixel(x, y);
            *px = Luma([src[slot]]);
        }

        let name = format!("alpha.{}", self.next_alpha);
        self.next_alpha += 1;
        self.standalone.insert(name.clone(), plane);

        let key = (owner.to_string(), purpose);
        let standalone = PaintRef {
            image: name,
            channel: -1,
        };
        self.regions.insert(key.clone(), standalone.clone());
        self.free_slot(&paint.image, slot, &key);

        tracing::debug!(owner, from = %paint.image, to = %standalone.image, "extracted pack region");
        Ok(standalone)
    }

    /// Returns a region's capacity to the pack. Unknown regions are a
    /// no-op.
    pub fn release(&mut self, owner: &str, purpose: PaintPurpose) {
        let key = (owner.to_string(), purpose);
        let Some(paint) = self.regions.remove(&key) else {
            return;
        };
        if paint.is_shared() {
            self.free_slot(&paint.image, paint.channel as usize, &key);
        } else {
            self.standalone.remove(&paint.image);
        }
    }

    fn free_slot(&mut self, page_name: &str, slot: usize, key: &(String, PaintPurpose)) {
        let mut drop_page = false;
        if let Some(page) = self.pages.get_mut(page_name) {
            if page.slots[slot].as_ref() == Some(key) {
                page.slots[slot] = None;
            }
            drop_page = page.is_empty();
        }
        if drop_page {
            self.pages.remove(page_name);
        }
    }

    pub fn region(&self, owner: &str, purpose: PaintPurpose) -> Option<&PaintRef> {
        self.regions.get(&(owner.to_string(), purpose))
    }

    pub fn page_image(&self, name: &str) -> Option<&Rgba32FImage> {
        self.pages.get(name).map(|p| &p.pixels)
    }

    pub fn standalone_image(&self, name: &str) -> Option<&AlphaImage> {
        self.standalone.get(name)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Region-table snapshot for persistence.
    pub fn table(&self) -> PackTable {
        let regions = self
            .regions
            .iter()
            .map(|((owner, purpose), paint)| {
                let resolution = if paint.is_shared() {
                    self.pages
                        .get(&paint.image)
                        .map(|p| p.resolution)
                        .unwrap_or_default()
                } else {
                    self.standalone
                        .get(&paint.image)
                        .map(|p| p.dimensions())
                        .unwrap_or_default()
                };
                PackRegion {
                    owner: owner.clone(),
                    purpose: *purpose,
                    paint: paint.clone(),
                    resolution,
                }
            })
            .collect();
        PackTable {
            regions,
            next_page: self.next_page,
            next_alpha: self.next_alpha,
        }
    }

    /// Rebuilds pack bookkeeping from a persisted table. Pixel contents
    /// start blank; the paint host repopulates them.
    pub fn from_table(table: PackTable) -> LaminaResult<Self> {
        let mut pack = Self {
            next_page: table.next_page,
            next_alpha: table.next_alpha,
            ..Self::default()
        };
        for region in table.regions {
            let key = (region.owner.clone(), region.purpose);
            if region.paint.is_shared() {
                let slot = region.paint.channel as usize;
                if slot >= SLOTS_PER_PAGE {
                    return Err(LaminaError::validation(format!(
                        "region for '{}' names slot {slot} out of range",
                        region.owner
                    )));
                }
                let page = pack
                    .pages
                    .entry(region.paint.image.clone())
                    .or_insert_with(|| PackPage::new(region.resolution));
                if page.slots[slot].is_some() {
                    return Err(LaminaError::validation(format!(
                        "pack slot {}[{slot}] claimed twice",
                        region.paint.image
                    )));
                }
                page.slots[slot] = Some(key.clone());
            } else {
                pack.standalone.insert(
                    region.paint.image.clone(),
                    AlphaImage::new(region.resolution.0, region.resolution.1),
                );
            }
            pack.regions.insert(key, region.paint);
        }
        Ok(pack)
    }
}
