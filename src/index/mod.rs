//! Region→tile spatial index.

mod tile_cache;

pub use tile_cache::{CoverageStats, RebuildStats, TileCache};
