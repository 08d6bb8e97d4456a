//! Geodynamic update kernels, applied in a fixed order each step:
//! subduction uplift (with fold-direction and slab-pull reactions), the
//! oceanic crust template, continental collision, rifting, and the
//! erosion/dampening/accretion pass.

pub mod collision;
pub mod erosion;
pub mod oceanic;
pub mod rifting;
pub mod subduction;
