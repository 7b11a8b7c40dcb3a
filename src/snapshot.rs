//! Persistence snapshots.
//!
//! The persistence layer gets pure data: the stack model, bake record
//! metadata, and the pack region table. No compiled graph is ever
//! persisted or trusted; restoring a snapshot performs a full compile
//! and fails if the restored stack does not synthesize.

use std::collections::BTreeMap;

use crate::{
    bake::{BakeCache, BakeRecord},
    blend::BlendLibrary,
    compile::{CompiledStack, compile},
    error::{LaminaError, LaminaResult},
    model::LayerStack,
    pack::{PackManager, PackTable},
};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StackSnapshot {
    pub stack: LayerStack,
    pub layer_bakes: BTreeMap<String, BakeRecord>,
    pub stack_bake: Option<BakeRecord>,
    pub pack: PackTable,
}

/// Everything a host gets back from a restore: the reconstructed state
/// plus the compiled stack that validated it.
#[derive(Debug)]
pub struct Restored {
    pub stack: LayerStack,
    pub bakes: BakeCache,
    pub pack: PackManager,
    pub compiled: CompiledStack,
}

impl StackSnapshot {
    pub fn capture(stack: &LayerStack, bakes: &BakeCache, pack: &PackManager) -> Self {
        let (layer_bakes, stack_bake) = bakes.records();
        Self {
            stack: stack.clone(),
            layer_bakes,
            stack_bake,
            pack: pack.table(),
        }
    }

    pub fn to_json(&self) -> LaminaResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| LaminaError::serde(e.to_string()))
    }

    pub fn from_json(json: &str) -> LaminaResult<Self> {
        serde_json::from_str(json).map_err(|e| LaminaError::serde(e.to_string()))
    }

    /// Reconstructs state from the snapshot and validates it with a full
    /// compile. Bake records whose layer no longer exists are dropped
    /// rather than carried as orphans.
    #[tracing::instrument(skip_all)]
    pub fn restore(self, lib: &BlendLibrary) -> LaminaResult<Restored> {
        let mut stack = self.stack;
        let mut layer_bakes = self.layer_bakes;
        layer_bakes.retain(|id, _| stack.layer(id).is_some());
        let bakes = BakeCache::from_records(layer_bakes, self.stack_bake);
        let pack = PackManager::from_table(self.pack)?;

        let compiled = compile(&stack, lib, &bakes)?;
        // A restored stack starts clean; the compile above is the
        // authoritative build.
        stack.take_dirty();
        Ok(Restored {
            stack,
            bakes,
            pack,
            compiled,
        })
    }
}
