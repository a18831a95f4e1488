pub mod artifact;
pub mod types;
pub mod version;

pub use artifact::{ArtifactMetadata, BUILDER_ID, DiskSize, ExportedFile, METADATA_FILENAME};
pub use types::*;
pub use version::{ProductVersion, VersionParseError};
