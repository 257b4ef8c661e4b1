//! Public macros for ergonomic resolution.

/// Resolves a dependency from a container, panicking if it cannot be built.
///
/// # Panics
///
/// Panics with the resolution error if the identity is unknown, its
/// construction fails or the instance is not of the requested type. For a
/// non-panicking version, use [`maybe_resolve!`] or `Container::resolve`.
///
/// # Examples
///
/// ```
/// use fibre_kernel::{resolve, Container, Declare, MetadataRegistry};
/// use std::sync::Arc;
///
/// struct Greeting(String);
///
/// let registry = Arc::new(MetadataRegistry::new());
/// Declare::<Greeting>::new("Greeting")
///   .construct(|_| Ok(Greeting("hello".into())))
///   .register_in(&registry);
/// let container = Container::builder().registry(registry).build();
///
/// // By identity
/// let greeting = resolve!(container, Greeting, "Greeting");
/// assert_eq!(greeting.0, "hello");
///
/// // By declared type
/// let same = resolve!(container, Greeting);
/// assert!(Arc::ptr_eq(&greeting, &same));
/// ```
#[macro_export]
macro_rules! resolve {
    // resolve!(container, MyService)
    ($container:expr, $type:ty) => {
        $container
            .get::<$type>()
            .unwrap_or_else(|err| {
                panic!(
                    "Failed to resolve required service {}: {}",
                    std::any::type_name::<$type>(),
                    err
                )
            })
    };

    // resolve!(container, MyService, "identity")
    ($container:expr, $type:ty, $identity:expr) => {
        $container
            .resolve::<$type>($identity)
            .unwrap_or_else(|err| {
                panic!(
                    "Failed to resolve required service '{}' as {}: {}",
                    $identity,
                    std::any::type_name::<$type>(),
                    err
                )
            })
    };
}

/// Like [`resolve!`], but yields an `Option` instead of panicking.
///
/// ```
/// use fibre_kernel::{maybe_resolve, Container, MetadataRegistry};
/// use std::sync::Arc;
///
/// let container = Container::builder().registry(Arc::new(MetadataRegistry::new())).build();
/// assert!(maybe_resolve!(container, String, "Missing").is_none());
/// ```
#[macro_export]
macro_rules! maybe_resolve {
    ($container:expr, $type:ty) => {
        $container.get::<$type>().ok()
    };

    ($container:expr, $type:ty, $identity:expr) => {
        $container.resolve::<$type>($identity).ok()
    };
}
