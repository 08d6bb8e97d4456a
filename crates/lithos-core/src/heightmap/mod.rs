//! Heightmap materialisation: the barycentric spherical sampler, the
//! colour palettes, and the overlap-tiled equirectangular exporter.

pub mod export;
pub mod palette;
pub mod sampler;
