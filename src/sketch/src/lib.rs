pub mod encode;
pub mod error;
pub mod estimate;
pub mod hll;
pub mod varint;

pub use encode::{decode, digest, encode};
pub use error::SketchError;
pub use estimate::estimate;
pub use hll::HllSketch;
