//! Image identity: references and content digests


mod digest;
mod name;

pub use digest::ContentDigest;
pub use name::ImageName;
