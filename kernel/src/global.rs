//! The process-wide metadata registry.

use crate::metadata::MetadataRegistry;
use once_cell::sync::Lazy;
use std::sync::Arc;

// Created on first access. Every container built without an explicit
// registry reads its declarations from here.
static GLOBAL_REGISTRY: Lazy<Arc<MetadataRegistry>> = Lazy::new(|| Arc::new(MetadataRegistry::new()));

/// Provides the global registry that [`Declare::register`](crate::Declare::register)
/// writes to and that containers read from by default.
///
/// # Examples
///
/// ```
/// use fibre_kernel::{global_registry, Container, Declare};
///
/// struct Clock;
///
/// Declare::<Clock>::new("doc.Clock").construct(|_| Ok(Clock)).register();
///
/// let container = Container::new();
/// assert!(std::sync::Arc::ptr_eq(container.registry(), global_registry()));
/// assert!(container.resolve::<Clock>("doc.Clock").is_ok());
/// ```
pub fn global_registry() -> &'static Arc<MetadataRegistry> {
  &GLOBAL_REGISTRY
}
