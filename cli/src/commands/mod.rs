//! Command implementations

pub mod build;
pub mod destroy;
pub mod validate;
pub mod version;
