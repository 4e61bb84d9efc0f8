//! Database handle shared by checkouts, mirrors and the service

use snap_core::{Config, MemoryRecipeStore, OwnerId, RecipeStore};
use snap_eval::{Materializer, Optimizer, RewritingStore};
use snap_journal::{MemoryPointerStore, PointerStore};
use std::sync::Arc;
use tracing::debug;

/// Recipe store, pointer store and the evaluators built on them
#[derive(Clone)]
pub struct Db {
    owner: OwnerId,
    host: String,
    config: Config,
    store: Arc<dyn RecipeStore>,
    pointers: Arc<dyn PointerStore>,
    materializer: Materializer,
    optimizer: Optimizer,
}

impl Db {
    /// In-memory database for `owner`
    pub fn new(owner: OwnerId, config: Config) -> Self {
        Self::with_stores(
            owner,
            config,
            Arc::new(MemoryRecipeStore::new()),
            Arc::new(MemoryPointerStore::new()),
        )
    }

    /// Database over existing stores
    ///
    /// With `optimizer.rewrite_on_create` the recipe store is wrapped in the
    /// rewriting creator.
    pub fn with_stores(
        owner: OwnerId,
        config: Config,
        store: Arc<dyn RecipeStore>,
        pointers: Arc<dyn PointerStore>,
    ) -> Self {
        let store: Arc<dyn RecipeStore> = if config.optimizer.rewrite_on_create {
            Arc::new(RewritingStore::new(store, config.optimizer.max_rewrite_height))
        } else {
            store
        };
        let materializer =
            Materializer::with_cache_entries(store.clone(), config.optimizer.materializer_cache_entries);
        let optimizer = Optimizer::new(materializer.clone(), config.optimizer.clone());
        let host = format!("snap-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        debug!(owner = %owner, host = %host, "opened database");
        Self {
            owner,
            host,
            config,
            store,
            pointers,
            materializer,
            optimizer,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Name this process records when it acquires a pointer
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecipeStore> {
        &self.store
    }

    pub fn pointers(&self) -> &Arc<dyn PointerStore> {
        &self.pointers
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }
}
