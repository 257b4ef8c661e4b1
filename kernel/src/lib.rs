//! # Fibre Kernel
//!
//! A dependency-resolution and lifecycle container.
//!
//! Types are described once with a [`Declare`] builder: how to construct
//! them, which fields to inject, which store keys back which fields and which
//! events their members listen to. A [`Container`] then builds instances on
//! demand, starts and stops them in dependency order, and can be forked into
//! child containers that share its state chain but not its instances.
//!
//! ## Core Concepts
//!
//! - **Declaration**: the wiring recipe for a type, kept in a [`MetadataRegistry`].
//! - **Registration**: one identity inside one container, with the
//!   implementation backing it. Implementations can be swapped until the
//!   singleton starts.
//! - **Store**: hierarchical key/value state. Forks read through to their
//!   parent and write to whichever level already holds a key.
//! - **EventBus**: topic-keyed listeners. Emission collects every listener's
//!   result, errors included, and never fails as a whole.
//! - **Lifecycle**: optional `on_configure` / `on_start` / `on_stop` hooks run
//!   in dependency order.
//!
//! ## Quick Start
//!
//! ```
//! use fibre_kernel::{Container, Declare, Env, Inject, MetadataRegistry};
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct Database {
//!   url: Env,
//! }
//!
//! #[derive(Default)]
//! struct Users {
//!   db: Inject<Database>,
//! }
//!
//! let registry = Arc::new(MetadataRegistry::new());
//! Declare::<Database>::new("Database")
//!   .default_construct()
//!   .env("url", "DATABASE_URL", None, |d: &Database| &d.url)
//!   .register_in(&registry);
//! Declare::<Users>::new("Users")
//!   .default_construct()
//!   .inject("db", "Database", |u: &Users| &u.db)
//!   .register_in(&registry);
//!
//! let container = Container::builder()
//!   .registry(registry)
//!   .state("DATABASE_URL", "postgres://${HOST}/app")
//!   .state("HOST", "localhost")
//!   .build();
//!
//! let users = container.resolve::<Users>("Users").unwrap();
//! let url = users.db.get().unwrap().url.get().unwrap();
//! assert_eq!(url, Some("postgres://localhost/app".into()));
//! ```

mod container;
mod core;
mod declare;
mod error;
mod event;
mod global;
pub mod graph;
mod identity;
mod inject;
mod lifecycle;
mod macros;
mod metadata;
mod registration;
mod store;

pub use async_trait::async_trait;

pub use crate::container::{Container, ContainerBuilder, Invocation, ResolveOptions, Target};
pub use crate::core::{Instance, Projection};
pub use crate::declare::{Arg, ArgResolver, Args, Declare, Definition};
pub use crate::error::{BoxError, Error, ListenerError, Result};
pub use crate::event::{EmitOptions, Emission, EventBus, HandlerResult, Observer, Outcome};
pub use crate::global::global_registry;
pub use crate::identity::{topic_name, Identity, InjectTarget};
pub use crate::inject::{Env, Inject, State};
pub use crate::lifecycle::Lifecycle;
pub use crate::metadata::{Merge, MetadataRegistry, Slot, BINDINGS, DEFINITION, PARAMS};
pub use crate::registration::{Provide, Registration};
pub use crate::store::{coerce, normalize_key, substitute, Coerce, Settled, StateMutation, Store, STATE_MUTATE};
