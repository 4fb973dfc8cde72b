//! Session configuration

use crate::cleaner::{self, Cleaner};
use crate::dispatch::ClassRegistry;
use std::sync::Arc;

/// Default guest stack limit (in slots)
pub const DEFAULT_STACK_LIMIT: usize = 1024 * 64;

/// Default bound on deep projection nesting
pub const DEFAULT_MAX_PROJECTION_DEPTH: usize = 64;

/// Options for a new [`Session`](crate::Session)
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Guest stack limit (in slots)
    pub stack_limit: usize,

    /// Maximum nesting followed by deep projections
    pub max_projection_depth: usize,

    /// Host classes visible to the dispatch resolver
    pub classes: Arc<ClassRegistry>,

    /// Finalizer queue that reclaims dropped handles
    pub cleaner: Arc<Cleaner>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stack_limit: DEFAULT_STACK_LIMIT,
            max_projection_depth: DEFAULT_MAX_PROJECTION_DEPTH,
            classes: Arc::new(ClassRegistry::new()),
            cleaner: cleaner::global(),
        }
    }
}

impl SessionOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest stack limit
    pub fn with_stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    /// Set the deep projection bound
    pub fn with_max_projection_depth(mut self, depth: usize) -> Self {
        self.max_projection_depth = depth;
        self
    }

    /// Share a class registry
    pub fn with_classes(mut self, classes: Arc<ClassRegistry>) -> Self {
        self.classes = classes;
        self
    }

    /// Use a dedicated finalizer queue
    pub fn with_cleaner(mut self, cleaner: Arc<Cleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }
}
