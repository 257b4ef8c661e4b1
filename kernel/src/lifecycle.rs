//! The optional hooks a declaration can implement to take part in
//! container start-up and shutdown.

use crate::error::BoxError;
use crate::registration::Registration;
use async_trait::async_trait;

/// Lifecycle hooks, all optional.
///
/// Hooks receive the container's registrations in dependency order. A
/// declaration opts in with [`Declare::lifecycle`](crate::Declare::lifecycle).
///
/// ```
/// use fibre_kernel::{async_trait, BoxError, Lifecycle, Registration};
///
/// struct Pool;
///
/// #[async_trait]
/// impl Lifecycle for Pool {
///   async fn on_start(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
///     Ok(())
///   }
/// }
/// ```
#[async_trait]
pub trait Lifecycle: Send + Sync {
  /// Wiring pass run for every registration before any `on_start`.
  async fn on_configure(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    Ok(())
  }

  /// Called in dependency order; dependencies start first.
  async fn on_start(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    Ok(())
  }

  /// Called in reverse dependency order; dependents stop first.
  async fn on_stop(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    Ok(())
  }
}
