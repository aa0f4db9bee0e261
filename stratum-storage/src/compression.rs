//! Value transform hooks for the remote cache tier.
//!
//! Values pass through a [`Compression`] implementation on the way to and
//! from the remote tier. The default [`NoopCompression`] passes values
//! through unchanged; the trait is the seam for a real codec later.

use stratum_core::error::Result;

/// Symmetric transform applied to cache values before they cross to the
/// remote tier.
///
/// Implementations must satisfy `decompress(compress(v)) == v` for every
/// value they accept.
pub trait Compression: Send + Sync + 'static {
    fn compress(&self, value: &str) -> Result<String>;
    fn decompress(&self, value: &str) -> Result<String>;
}

/// Identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompression;

impl Compression for NoopCompression {
    fn compress(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }

    fn decompress(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}
