//! `gsm-perception` – spatial model of the world.
//!
//! Owns the block-sparse voxel layers that make up the global segment map and
//! the geometry helpers around them.
//!
//! # Modules
//!
//! - [`layer`] – [`Layer`][layer::Layer] and [`FeatureLayer`][layer::FeatureLayer]:
//!   voxel grids allocated block by block.
//! - [`map`] – [`GlobalMap`][map::GlobalMap]: the single owned map state
//!   (geometric, label and feature layers, label set, revisions, touched
//!   blocks).
//! - [`bbox`] – [`Aabb`][bbox::Aabb] and [`oriented_bbox`][bbox::oriented_bbox]:
//!   bounding boxes for published objects.
//! - [`transform`] – [`TfEngine`][transform::TfEngine]: directed graph of
//!   named reference frames used to resolve the sensor pose.

pub mod bbox;
pub mod layer;
pub mod map;
pub mod transform;

pub use layer::{Block, FeatureLayer, Layer};
pub use map::{GlobalMap, MapConfig};
pub use transform::{Quaternion, TfEngine, Transform3D};
