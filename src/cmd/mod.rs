//! Command-line entry points.

pub mod background;
pub mod compress;
pub mod resize;
pub mod schema;
pub mod search;
