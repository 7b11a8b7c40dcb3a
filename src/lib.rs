#![forbid(unsafe_code)]

pub mod alpha;
pub mod bake;
pub mod blend;
pub mod compile;
pub mod dsl;
pub mod error;
pub mod graph;
pub mod model;
pub mod pack;
pub mod rebuild;
pub mod snapshot;

pub use bake::{BakeCache, BakeRecord, Rasterizer};
pub use blend::{BlendLibrary, BlendMode};
pub use compile::{CompiledStack, compile};
pub use error::{LaminaError, LaminaResult};
pub use graph::{Fragment, Graph, GraphFingerprint, ValueType, splice, structural_hash};
pub use model::{Channel, Layer, LayerKind, LayerStack};
pub use pack::{PackManager, PaintRef};
pub use rebuild::RebuildController;
pub use snapshot::StackSnapshot;
