use fibre_kernel::{Coerce, Container, Declare, Env, Error, MetadataRegistry, State, StateMutation, STATE_MUTATE};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Test Fixtures ---

#[derive(Debug, Default)]
struct Settings {
  region: Env,
}

#[derive(Default)]
struct Session {
  count: State,
  scratch: State,
}

fn registry() -> Arc<MetadataRegistry> {
  let registry = Arc::new(MetadataRegistry::new());
  Declare::<Settings>::new("Settings")
    .default_construct()
    .env("region", "A", None, |s: &Settings| &s.region)
    .register_in(&registry);
  Declare::<Session>::new("Session")
    .default_construct()
    .state("count", "COUNT", |s: &Session| &s.count)
    .state("scratch", "SCRATCH", |s: &Session| &s.scratch)
    .register_in(&registry);
  registry
}

// --- Forks ---

#[tokio::test]
async fn test_fork_writes_through_to_keys_the_parent_holds() {
  let parent = Container::builder().registry(registry()).state("COUNT", 0).build();
  let fork = parent.fork();

  let session = fork.resolve::<Session>("Session").unwrap();
  session.count.set(5).unwrap().await;
  session.scratch.set("local").unwrap().await;

  assert_eq!(parent.state("COUNT"), Some(json!(5)));
  assert_eq!(parent.state("SCRATCH"), None);
  assert_eq!(fork.state("SCRATCH"), Some(json!("local")));
}

#[tokio::test]
async fn test_fork_reads_fall_back_to_the_parent() {
  let parent = Container::with_state([("GREETING", "hi")]);
  let fork = parent.fork_with([("LOCAL", 1)]);

  assert_eq!(fork.state("greeting"), Some(json!("hi")));
  assert_eq!(fork.state("LOCAL"), Some(json!(1)));
  assert_eq!(parent.state("LOCAL"), None);
}

#[test]
fn test_fork_ids_derive_from_the_parent() {
  let parent = Container::builder().id("app").build();
  let first = parent.fork();
  let second = parent.fork();

  assert_eq!(first.id(), "app.1");
  assert_eq!(second.id(), "app.2");
  assert_eq!(first.fork().id(), "app.1.1");
  assert_eq!(first.state("id"), Some(json!("app.1")));
}

#[tokio::test]
async fn test_fork_starts_with_an_empty_bus() {
  let parent = Container::new();
  let _observer = parent.on("ping", |_| async {});
  let fork = parent.fork();

  assert_eq!(parent.bus().listener_count("ping"), 1);
  assert_eq!(fork.bus().listener_count("ping"), 0);
  assert!(fork.emit("ping", Value::Null).await.is_empty());
}

// --- Mutations ---

#[tokio::test]
async fn test_equal_write_emits_a_single_mutation() {
  let container = Container::new();
  let hits = Arc::new(AtomicUsize::new(0));
  let seen = Arc::clone(&hits);
  let _observer = container.on(STATE_MUTATE, move |_| {
    let seen = Arc::clone(&seen);
    async move {
      seen.fetch_add(1, Ordering::SeqCst);
    }
  });

  let first = container.set_state("A", "B");
  assert!(first.changed());
  assert_eq!(first.await.len(), 1);

  let second = container.set_state("A", "B");
  assert!(!second.changed());
  assert!(second.await.is_empty());

  assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutation_listeners_run_when_settled_is_dropped() {
  let container = Container::new();
  let every = Arc::new(AtomicUsize::new(0));
  let first = Arc::new(AtomicUsize::new(0));
  let seen = Arc::clone(&every);
  let _on = container.on(STATE_MUTATE, move |_| {
    let seen = Arc::clone(&seen);
    async move {
      seen.fetch_add(1, Ordering::SeqCst);
    }
  });
  let seen = Arc::clone(&first);
  let _once = container.once(STATE_MUTATE, move |_| {
    let seen = Arc::clone(&seen);
    async move {
      seen.fetch_add(1, Ordering::SeqCst);
    }
  });

  let settled = container.set_state("A", "B");
  assert!(settled.changed());
  drop(settled);

  tokio::time::timeout(Duration::from_secs(1), async {
    while every.load(Ordering::SeqCst) == 0 || first.load(Ordering::SeqCst) == 0 {
      tokio::task::yield_now().await;
    }
  })
  .await
  .expect("mutation listeners never ran");

  assert_eq!(every.load(Ordering::SeqCst), 1);
  assert_eq!(first.load(Ordering::SeqCst), 1);
  assert_eq!(container.bus().listener_count(STATE_MUTATE), 1);
}

#[tokio::test]
async fn test_mutation_payload_describes_the_change() {
  let container = Container::with_state([("COLOR", "red")]);
  let observer = container.on(STATE_MUTATE, |data| async move { data });

  let outcomes = container.set_state("color", "blue").await;
  observer.free();

  let payload = outcomes.into_iter().next().unwrap().unwrap();
  let mutation: StateMutation = serde_json::from_value(payload).unwrap();
  assert_eq!(mutation.key, "COLOR");
  assert_eq!(mutation.old_value, Some(json!("red")));
  assert_eq!(mutation.new_value, Some(json!("blue")));
}

#[tokio::test]
async fn test_mutation_is_emitted_on_the_level_that_stores_the_key() {
  let parent = Container::with_state([("SHARED", 1)]);
  let fork = parent.fork();
  let parent_hits = Arc::new(AtomicUsize::new(0));
  let seen = Arc::clone(&parent_hits);
  let _observer = parent.on(STATE_MUTATE, move |_| {
    let seen = Arc::clone(&seen);
    async move {
      seen.fetch_add(1, Ordering::SeqCst);
    }
  });

  fork.set_state("SHARED", 2).await;
  fork.set_state("OWN", 1).await;

  assert_eq!(parent_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unset_removes_the_value() {
  let container = Container::with_state([("TOKEN", "abc")]);

  let settled = container.unset_state("token");
  assert!(settled.changed());
  settled.await;

  assert_eq!(container.state("TOKEN"), None);
  assert!(!container.unset_state("TOKEN").changed());
}

#[test]
fn test_keys_are_normalized() {
  let container = Container::with_state([("a.b", 1)]);

  assert_eq!(container.state("A_B"), Some(json!(1)));
  assert_eq!(container.state("a-b"), Some(json!(1)));
}

// --- Env ---

#[tokio::test]
async fn test_env_substitutes_placeholders() {
  let container = Container::with_state([("A", "1"), ("B", "2")]);

  container.set_state("X", "${A}.${B}").await;

  assert_eq!(container.env("X", None).unwrap(), Some(json!("1.2")));
  // The stored value itself is untouched.
  assert_eq!(container.state("X"), Some(json!("${A}.${B}")));
}

#[test]
fn test_env_coerces_values() {
  let container = Container::with_state([("PORT", "8080"), ("DEBUG", "yes"), ("HOSTS", "a, b")]);

  assert_eq!(container.env("PORT", Some(Coerce::Number)).unwrap(), Some(json!(8080)));
  assert_eq!(container.env("DEBUG", Some(Coerce::Boolean)).unwrap(), Some(json!(true)));
  assert_eq!(container.env("HOSTS", Some(Coerce::Array)).unwrap(), Some(json!(["a", "b"])));
  assert!(matches!(
    container.env("HOSTS", Some(Coerce::Number)),
    Err(Error::Coerce { .. })
  ));
  assert_eq!(container.env("MISSING", Some(Coerce::Number)).unwrap(), None);
}

#[test]
fn test_required_env_is_read_from_the_store() {
  let container = Container::builder().registry(registry()).state("A", "B").build();

  let settings = container.resolve::<Settings>("Settings").unwrap();

  assert_eq!(settings.region.get().unwrap(), Some(json!("B")));
  assert_eq!(settings.region.get_as::<String>().unwrap(), Some("B".to_owned()));
}

#[test]
fn test_missing_required_env_fails_resolution() {
  let container = Container::builder().registry(registry()).build();

  let err = container.resolve::<Settings>("Settings").unwrap_err();
  assert!(matches!(err, Error::MissingEnv(ref key) if key == "A"));
}

#[test]
fn test_optional_env_tolerates_absence() {
  #[derive(Default)]
  struct Tuning {
    level: Env,
  }

  let registry = Arc::new(MetadataRegistry::new());
  Declare::<Tuning>::new("Tuning")
    .default_construct()
    .optional_env("level", "LEVEL", Some(Coerce::Number), |t: &Tuning| &t.level)
    .register_in(&registry);
  let container = Container::builder().registry(registry).build();

  let tuning = container.resolve::<Tuning>("Tuning").unwrap();
  assert_eq!(tuning.level.get().unwrap(), None);
}

#[test]
#[serial]
fn test_builder_reads_the_process_environment() {
  std::env::set_var("FIBRE_KERNEL_TEST_FLAG", "on");

  let container = Container::builder()
    .state("FIBRE_KERNEL_TEST_FLAG", "off")
    .from_env()
    .build();
  let from_env = Container::builder().from_env().build();

  std::env::remove_var("FIBRE_KERNEL_TEST_FLAG");

  // Explicit entries win over the environment.
  assert_eq!(container.env("FIBRE_KERNEL_TEST_FLAG", Some(Coerce::Boolean)).unwrap(), Some(json!(false)));
  assert_eq!(from_env.env("fibre.kernel.test.flag", Some(Coerce::Boolean)).unwrap(), Some(json!(true)));
}
