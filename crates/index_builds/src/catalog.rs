//! Collection catalog seam: index registration, readiness, multikey state,
//! and the attachment point for write interceptors.

use std::sync::Arc;

use crate::{
    context::OperationContext,
    interceptor::IndexBuildInterceptor,
    types::{
        CollectionId,
        IndexIdent,
        IndexSpec,
        MultikeyPaths,
    },
};

/// Point-in-time view of one catalog entry. Never hold one across a yield;
/// re-resolve through [`Catalog::entry`] with the ident instead.
#[derive(Clone, Debug)]
pub struct IndexCatalogEntry {
    pub ident: IndexIdent,
    pub spec: IndexSpec,
    pub ready: bool,
    pub multikey: bool,
    pub multikey_paths: MultikeyPaths,
}

pub trait Catalog: Send + Sync {
    fn collection_exists(&self, collection: CollectionId) -> bool;

    /// Register a new, not-yet-ready index. Fails with
    /// `IndexBuildAlreadyInProgress` when an unfinished index with the same
    /// name or the same definition is already registered, and with
    /// `IndexAlreadyExists` when a ready one is.
    ///
    /// Registration is transactional: implementations register an undo hook
    /// on the recovery unit so a rolled-back unit of work removes the entry.
    fn register_index(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        spec: &IndexSpec,
    ) -> anyhow::Result<IndexIdent>;

    fn unregister_index(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<()>;

    /// Resolve an entry. `NotFound` when the index (or collection) has been
    /// dropped since `ident` was obtained.
    fn entry(
        &self,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<IndexCatalogEntry>;

    fn attach_interceptor(
        &self,
        collection: CollectionId,
        ident: IndexIdent,
        interceptor: Arc<IndexBuildInterceptor>,
    ) -> anyhow::Result<()>;

    fn detach_interceptor(
        &self,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<()>;

    /// Interceptors currently attached to the collection's in-progress
    /// indexes. The collection write path routes every document write
    /// through each of these.
    fn interceptors(
        &self,
        collection: CollectionId,
    ) -> Vec<(IndexIdent, Arc<IndexBuildInterceptor>)>;

    fn mark_ready(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<()>;

    fn set_multikey(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        ident: IndexIdent,
        paths: &MultikeyPaths,
    ) -> anyhow::Result<()>;

    /// Whether the collection is flagged as possibly containing documents
    /// with mixed-schema array values.
    fn may_contain_mixed_schema(&self, collection: CollectionId) -> anyhow::Result<bool>;

    fn clear_mixed_schema_flag(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
    ) -> anyhow::Result<()>;
}
