//! crewscan-core: face matching primitives.
//!
//! Rotation-invariant detection over a pluggable embedding oracle, the
//! spatial layout metric, and resolution of detected faces to enrolled
//! identities. An ONNX Runtime oracle (SCRFD + ArcFace) is included.

pub mod detector;
pub mod naming;
pub mod onnx;
pub mod oracle;
pub mod recognizer;
pub mod resolver;
pub mod rotation;
pub mod spatial;
pub mod types;

#[cfg(test)]
mod testing;

pub use naming::{parse_identity_name, IdentityName, NamingError};
pub use onnx::OnnxOracle;
pub use oracle::{EmbeddingOracle, OracleError};
pub use resolver::MatchResolver;
pub use rotation::RotationSweep;
pub use types::{BoundingBox, DetectedFace, Embedding, Identity, ImageResult, LayoutMatrix, MatchCandidate};
