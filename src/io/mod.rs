//! Output artifact I/O.

mod artifact;

pub use artifact::{artifact_name, ArtifactStats, ArtifactWriter, RecordFormat};
