// Admiral Kernel
//
// Control-plane primitives for administrative statement execution:
// versioned metadata, plan lifecycle, coordinator routing and state
// broadcasting.

pub mod admin;
pub mod client;
pub mod cluster;
pub mod config;
pub mod metadata;
pub mod observe;
pub mod plan;
