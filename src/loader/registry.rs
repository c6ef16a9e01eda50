//! Scheme → loader registry.
//!
//! Images and volumes have separate tables, each with its own optional
//! fallback. An identity is resolved in the table of its kind only.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::PipelineError;
use crate::identity::{ImageId, ResourceKind};

use super::Loader;

#[derive(Default)]
struct LoaderTable {
    by_scheme: HashMap<String, Arc<dyn Loader>>,
    fallback: Option<Arc<dyn Loader>>,
}

/// Maps identity schemes to loaders.
///
/// Registration is last-write-wins. An optional fallback loader handles any
/// scheme without its own registration.
#[derive(Default)]
pub struct LoaderRegistry {
    images: RwLock<LoaderTable>,
    volumes: RwLock<LoaderTable>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: ResourceKind) -> &RwLock<LoaderTable> {
        match kind {
            ResourceKind::Image => &self.images,
            ResourceKind::Volume => &self.volumes,
        }
    }

    /// Register an image `loader` for `scheme`, returning the loader it
    /// replaced.
    pub async fn register(
        &self,
        scheme: impl Into<String>,
        loader: Arc<dyn Loader>,
    ) -> Option<Arc<dyn Loader>> {
        self.register_for(ResourceKind::Image, scheme, loader).await
    }

    /// Register a volume `loader` for `scheme`.
    pub async fn register_volume(
        &self,
        scheme: impl Into<String>,
        loader: Arc<dyn Loader>,
    ) -> Option<Arc<dyn Loader>> {
        self.register_for(ResourceKind::Volume, scheme, loader).await
    }

    pub async fn register_for(
        &self,
        kind: ResourceKind,
        scheme: impl Into<String>,
        loader: Arc<dyn Loader>,
    ) -> Option<Arc<dyn Loader>> {
        let mut table = self.table(kind).write().await;
        table.by_scheme.insert(scheme.into(), loader)
    }

    pub async fn unregister(&self, scheme: &str) -> Option<Arc<dyn Loader>> {
        self.unregister_for(ResourceKind::Image, scheme).await
    }

    pub async fn unregister_for(&self, kind: ResourceKind, scheme: &str) -> Option<Arc<dyn Loader>> {
        let mut table = self.table(kind).write().await;
        table.by_scheme.remove(scheme)
    }

    /// Install the image loader used for unregistered schemes.
    pub async fn set_fallback(&self, loader: Arc<dyn Loader>) -> Option<Arc<dyn Loader>> {
        self.set_fallback_for(ResourceKind::Image, loader).await
    }

    /// Install the volume loader used for unregistered schemes.
    pub async fn set_volume_fallback(&self, loader: Arc<dyn Loader>) -> Option<Arc<dyn Loader>> {
        self.set_fallback_for(ResourceKind::Volume, loader).await
    }

    pub async fn set_fallback_for(
        &self,
        kind: ResourceKind,
        loader: Arc<dyn Loader>,
    ) -> Option<Arc<dyn Loader>> {
        self.table(kind).write().await.fallback.replace(loader)
    }

    pub async fn clear_fallback(&self) -> Option<Arc<dyn Loader>> {
        self.clear_fallback_for(ResourceKind::Image).await
    }

    pub async fn clear_fallback_for(&self, kind: ResourceKind) -> Option<Arc<dyn Loader>> {
        self.table(kind).write().await.fallback.take()
    }

    /// Find the loader for an identity's scheme, in the table of its kind.
    ///
    /// Identities without a `:` have no scheme and can only be served by
    /// the fallback.
    pub async fn resolve(&self, id: &ImageId) -> Result<Arc<dyn Loader>, PipelineError> {
        let table = self.table(id.kind()).read().await;
        if let Some(loader) = id.scheme().and_then(|scheme| table.by_scheme.get(scheme)) {
            return Ok(loader.clone());
        }

        table.fallback.clone().ok_or_else(|| PipelineError::UnknownScheme {
            id: id.clone(),
            scheme: id.scheme().unwrap_or_default().to_string(),
        })
    }

    pub async fn is_registered(&self, scheme: &str) -> bool {
        self.is_registered_for(ResourceKind::Image, scheme).await
    }

    pub async fn is_registered_for(&self, kind: ResourceKind, scheme: &str) -> bool {
        self.table(kind).read().await.by_scheme.contains_key(scheme)
    }

    /// Registered image schemes, sorted.
    pub async fn schemes(&self) -> Vec<String> {
        self.schemes_for(ResourceKind::Image).await
    }

    pub async fn schemes_for(&self, kind: ResourceKind) -> Vec<String> {
        let table = self.table(kind).read().await;
        let mut schemes: Vec<String> = table.by_scheme.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}
