//! Incremental rebuild controller.
//!
//! The stack model marks dirty scope on every mutation; this module
//! turns that scope into the minimal set of channel resyntheses. A clean
//! channel keeps its previously compiled chain untouched, so downstream
//! consumers of its output socket never have to reconnect. Incrementality
//! is a performance optimization only: after any mutation sequence the
//! rebuilt result hashes identically to a fresh full compile.

use std::collections::BTreeSet;

use crate::{
    bake::BakeCache,
    blend::BlendLibrary,
    compile::{CompiledStack, compile_channel},
    error::LaminaResult,
    model::LayerStack,
};

/// Scope invalidated since the last rebuild. Topology covers anything
/// that changes fold order or channel membership (add/remove/reorder,
/// stack-level channel toggles); everything else lands on the named
/// channels it touches.
#[derive(Clone, Debug, Default)]
pub struct DirtySet {
    pub topology: bool,
    pub channels: BTreeSet<String>,
}

impl DirtySet {
    pub fn mark_topology(&mut self) {
        self.topology = true;
    }

    pub fn mark_channel(&mut self, channel: &str) {
        self.channels.insert(channel.to_string());
    }

    pub fn is_clean(&self) -> bool {
        !self.topology && self.channels.is_empty()
    }
}

/// Owns the active compiled stack and re-enters the synthesizer for
/// exactly the dirty channels. On synthesis failure the previous
/// compiled stack stays active and the dirty scope is retained, so a
/// later rebuild retries the same work.
#[derive(Clone, Debug, Default)]
pub struct RebuildController {
    compiled: CompiledStack,
}

impl RebuildController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently committed compiled stack. Empty until the first
    /// successful [`rebuild`](Self::rebuild).
    pub fn compiled(&self) -> &CompiledStack {
        &self.compiled
    }

    #[tracing::instrument(skip_all)]
    pub fn rebuild(
        &mut self,
        stack: &mut LayerStack,
        lib: &BlendLibrary,
        bakes: &BakeCache,
    ) -> LaminaResult<&CompiledStack> {
        let dirty = stack.dirty().clone();

        let mut next = self.compiled.clone();
        let mut rebuilt = 0usize;
        for channel in stack.enabled_channels() {
            let stale = dirty.topology
                || dirty.channels.contains(&channel.name)
                || !next.channels.contains_key(&channel.name);
            if !stale {
                continue;
            }
            let compiled = compile_channel(stack, channel, lib, bakes)?;
            next.channels.insert(channel.name.clone(), compiled);
            rebuilt += 1;
        }

        let enabled: BTreeSet<&str> = stack.enabled_channels().map(|c| c.name.as_str()).collect();
        next.channels.retain(|name, _| enabled.contains(name.as_str()));

        tracing::debug!(rebuilt, kept = next.channels.len() - rebuilt, "rebuild committed");
        self.compiled = next;
        stack.take_dirty();
        Ok(&self.compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blend::BlendMode,
        compile::compile,
        dsl::{constant_material, scalar_channels},
        model::LayerKind,
    };

    fn fixture() -> (LayerStack, BlendLibrary, BakeCache, RebuildController) {
        let stack = LayerStack::new(
            scalar_channels(&["Metallic", "Roughness"]),
            constant_material(&[("Metallic", 0.0), ("Roughness", 0.5)]),
        )
        .unwrap();
        (
            stack,
            BlendLibrary::new(),
            BakeCache::new(),
            RebuildController::new(),
        )
    }

    #[test]
    fn clean_rebuild_is_a_no_op() {
        let (mut stack, lib, bakes, mut ctl) = fixture();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        let before = ctl.compiled().fingerprint();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        assert_eq!(ctl.compiled().fingerprint(), before);
    }

    #[test]
    fn channel_edit_rebuilds_only_that_channel() {
        let (mut stack, lib, bakes, mut ctl) = fixture();
        let id = stack
            .add_layer(
                "Paint",
                LayerKind::MaterialFill,
                1,
                constant_material(&[("Roughness", 0.9), ("Metallic", 1.0)]),
            )
            .unwrap();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();

        stack
            .set_blend_mode(&id, "Roughness", BlendMode::Multiply)
            .unwrap();
        let dirty = stack.dirty().clone();
        assert!(!dirty.topology);
        assert_eq!(dirty.channels.len(), 1);

        let before_metallic = ctl.compiled().channel("Metallic").unwrap().fingerprint;
        let before_roughness = ctl.compiled().channel("Roughness").unwrap().fingerprint;
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        assert_eq!(
            ctl.compiled().channel("Metallic").unwrap().fingerprint,
            before_metallic
        );
        assert_ne!(
            ctl.compiled().channel("Roughness").unwrap().fingerprint,
            before_roughness
        );
    }

    #[test]
    fn rebuild_matches_fresh_compile_after_mutations() {
        let (mut stack, lib, bakes, mut ctl) = fixture();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();

        let a = stack
            .add_layer(
                "A",
                LayerKind::MaterialFill,
                1,
                constant_material(&[("Roughness", 0.9)]),
            )
            .unwrap();
        let b = stack
            .add_layer(
                "B",
                LayerKind::MaterialFill,
                2,
                constant_material(&[("Metallic", 0.4), ("Roughness", 0.1)]),
            )
            .unwrap();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();

        stack.set_opacity(&a, 0.3).unwrap();
        stack.set_blend_mode(&b, "Metallic", BlendMode::Add).unwrap();
        stack.reorder_layer(&b, 1).unwrap();
        let incremental = ctl.rebuild(&mut stack, &lib, &bakes).unwrap().fingerprint();

        let fresh = compile(&stack, &lib, &bakes).unwrap().fingerprint();
        assert_eq!(incremental, fresh);
    }

    #[test]
    fn disabled_channel_is_dropped_from_the_compiled_stack() {
        let (mut stack, lib, bakes, mut ctl) = fixture();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        assert!(ctl.compiled().channel("Metallic").is_some());

        stack.set_stack_channel_enabled("Metallic", false).unwrap();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        assert!(ctl.compiled().channel("Metallic").is_none());
    }

    #[test]
    fn failed_rebuild_keeps_previous_graph_and_dirty_scope() {
        let (mut stack, mut lib, bakes, mut ctl) = fixture();
        let id = stack
            .add_layer(
                "Paint",
                LayerKind::MaterialFill,
                1,
                constant_material(&[("Roughness", 0.9)]),
            )
            .unwrap();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        let before = ctl.compiled().fingerprint();

        // Point the layer at a custom blend that is not bound.
        stack
            .set_blend_mode(&id, "Roughness", BlendMode::Custom("missing".to_string()))
            .unwrap();
        assert!(ctl.rebuild(&mut stack, &lib, &bakes).is_err());
        assert_eq!(ctl.compiled().fingerprint(), before);
        assert!(!stack.dirty().is_clean());

        // Binding the fragment lets the retained scope rebuild.
        lib.bind_custom(
            "missing",
            crate::dsl::passthrough_blend_fragment(crate::graph::ValueType::Scalar),
        )
        .unwrap();
        ctl.rebuild(&mut stack, &lib, &bakes).unwrap();
        assert_ne!(ctl.compiled().fingerprint(), before);
        assert!(stack.dirty().is_clean());
    }
}
