//! Loaders and the scheme registry.
//!
//! A loader turns an identity into a decoded payload. Loaders are looked up
//! by the identity's scheme, so new transports plug in without the rest of
//! the pipeline knowing about them.
//!
//! ```text
//!   "file:/data/ct/slice-001.raw"   ──► FileLoader
//!   "s3:studies/1.2.3/volume.bin"   ──► S3Loader
//!   "anything-else:..."             ──► fallback loader, or UnknownScheme
//! ```

mod file;
mod registry;
mod s3;

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::LoadError;
use crate::identity::ImageId;

pub use file::FileLoader;
pub use registry::LoaderRegistry;
pub use s3::{create_s3_client, S3Loader};

// =============================================================================
// Loader Trait
// =============================================================================

/// A decoded payload and the number of bytes it should be charged against
/// the cache budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub payload: Bytes,
    pub size_in_bytes: usize,
}

impl LoadedImage {
    pub fn new(payload: Bytes, size_in_bytes: usize) -> Self {
        Self {
            payload,
            size_in_bytes,
        }
    }

    /// Charge exactly the payload length.
    pub fn from_bytes(payload: Bytes) -> Self {
        let size_in_bytes = payload.len();
        Self::new(payload, size_in_bytes)
    }
}

/// A source of decoded images for one or more schemes.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Fetch and decode the resource behind `id`.
    ///
    /// Return [`LoadError::cancelled`] if the work was abandoned.
    async fn load(&self, id: &ImageId) -> Result<LoadedImage, LoadError>;
}

// =============================================================================
// Closure Adapter
// =============================================================================

/// Adapts an async closure into a [`Loader`].
///
/// ```
/// use bytes::Bytes;
/// use image_feed::loader::{FnLoader, LoadedImage};
/// use image_feed::ImageId;
///
/// let loader = FnLoader::new(|id: ImageId| async move {
///     Ok(LoadedImage::from_bytes(Bytes::from(id.locator().to_owned())))
/// });
/// # let _ = loader;
/// ```
pub struct FnLoader<F, Fut> {
    func: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnLoader<F, Fut>
where
    F: Fn(ImageId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<LoadedImage, LoadError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Loader for FnLoader<F, Fut>
where
    F: Fn(ImageId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<LoadedImage, LoadError>> + Send,
{
    async fn load(&self, id: &ImageId) -> Result<LoadedImage, LoadError> {
        (self.func)(id.clone()).await
    }
}
