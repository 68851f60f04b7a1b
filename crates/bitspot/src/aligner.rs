//! Field-of-view to global coordinate mapping seam.
//!
//! Each field of view has its own pixel coordinate frame; stitching them into
//! the experiment-wide frame is handled outside this crate. Extraction only
//! needs the forward mapping, consumed through this trait. When no aligner is
//! supplied, local coordinates pass through unchanged.

/// Maps local field-of-view coordinates into the global frame.
pub trait FovAligner {
    /// Map a local `(x, y, z)` point within `fov` to global coordinates.
    fn fov_coordinate_to_global(&self, fov: u32, local: [f64; 3]) -> [f64; 3];
}

impl<T: FovAligner + ?Sized> FovAligner for &T {
    fn fov_coordinate_to_global(&self, fov: u32, local: [f64; 3]) -> [f64; 3] {
        (**self).fov_coordinate_to_global(fov, local)
    }
}
