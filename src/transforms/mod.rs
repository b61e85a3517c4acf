//! Deterministic pixel transforms
//!
//! Pure functions over `image` buffers: levels adjustment with its binary-threshold
//! fallback, content-bounds detection with smart margins, and edge-refined alpha
//! compositing. Nothing in this module touches the filesystem or holds state.

pub mod bounds;
pub mod composite;
pub mod levels;

pub use bounds::{
    compute_smart_margins, crop_bounds, detect_content_bounds, ContentBounds, Margins,
    CONTENT_ALPHA_THRESHOLD,
};
pub use composite::{add_solid_background, composite_over, flatten_onto_color, refine_edge_alpha};
pub use levels::{adjust_mask_levels, apply_levels_lut, create_binary_mask, levels_lut, LevelsParams};
