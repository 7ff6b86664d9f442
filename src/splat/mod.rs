//! Oriented splat samples and their sources

pub mod blob;
pub mod set;

pub use blob::{BlobInfo, FastBlobSet};
pub use set::{FileSet, SplatFile};

use bytemuck::{Pod, Zeroable};

use crate::core::types::Vec3;

/// A single point sample: position, surface normal and influence radius.
///
/// The layout matches the device buffers, so host arrays can be shipped
/// without repacking.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Splat {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub radius: f32,
}

impl Splat {
    pub fn new(position: Vec3, normal: Vec3, radius: f32) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            radius,
        }
    }

    /// A splat is usable iff all seven components are finite and the radius is
    /// positive. Streams drop anything else and count it.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.normal.iter().all(|v| v.is_finite())
            && self.radius.is_finite()
            && self.radius > 0.0
    }

    /// Lower corner of the influence region `position - radius`.
    pub fn lower(&self) -> Vec3 {
        Vec3::from(self.position) - Vec3::splat(self.radius)
    }

    /// Upper corner of the influence region `position + radius`.
    pub fn upper(&self) -> Vec3 {
        Vec3::from(self.position) + Vec3::splat(self.radius)
    }
}
