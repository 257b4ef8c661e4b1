use fibre_kernel::{
  topic_name, Args, Container, Declare, EmitOptions, Error, EventBus, Inject, InjectTarget, Instance, ListenerError,
  MetadataRegistry,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::future::Ready;
use std::sync::Arc;
use std::time::Duration;

// --- Test Fixtures ---

#[derive(Debug, thiserror::Error)]
#[error("listener refused")]
struct Refused;

#[derive(Default)]
struct Auditor {
  seen: Mutex<Vec<Value>>,
}

fn audited() -> (Container, Arc<MetadataRegistry>) {
  let registry = Arc::new(MetadataRegistry::new());
  Declare::<Auditor>::new("Auditor")
    .default_construct()
    .method("record", |this: Arc<Auditor>, args: Args| async move {
      let data = args.value(0)?.clone();
      this.seen.lock().push(data.clone());
      Ok::<_, Error>(data)
    })
    .listen("record")
    .listen_on("audit", "record")
    .register_in(&registry);
  let container = Container::builder().registry(Arc::clone(&registry)).build();
  (container, registry)
}

// --- Emission ---

#[tokio::test]
async fn test_failing_listener_does_not_break_the_others() {
  let bus = EventBus::new();
  let _a = bus.on("topic", |_| async { json!(1) });
  let _b = bus.on("topic", |_| async { Err::<Value, _>(Refused) });
  let _c = bus.on("topic", |_| async { json!(3) });

  let results = bus.emit("topic", Value::Null).await;

  assert_eq!(results.len(), 3);
  assert_eq!(results[0].as_ref().unwrap(), &json!(1));
  assert!(results[1].as_ref().unwrap_err().downcast_ref::<Refused>().is_some());
  assert_eq!(results[2].as_ref().unwrap(), &json!(3));
}

async fn explode() {
  panic!("async kaboom")
}

#[tokio::test]
async fn test_panicking_listeners_are_contained() {
  let bus = EventBus::new();
  let _sync = bus.on("topic", |_: Value| -> Ready<()> { panic!("sync kaboom") });
  let _async = bus.on("topic", |_| explode());
  let _ok = bus.on("topic", |data| async move { data });

  let results = bus.emit("topic", json!("payload")).await;

  assert!(matches!(&results[0], Err(ListenerError::Panicked(msg)) if msg.contains("sync kaboom")));
  assert!(matches!(&results[1], Err(ListenerError::Panicked(msg)) if msg.contains("async kaboom")));
  assert_eq!(results[2].as_ref().unwrap(), &json!("payload"));
}

#[tokio::test]
async fn test_sequential_emission_awaits_in_order() {
  async fn run(options: EmitOptions) -> Vec<&'static str> {
    let bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let slow = Arc::clone(&order);
    let _slow = bus.on("work", move |_| {
      let slow = Arc::clone(&slow);
      async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        slow.lock().push("slow");
        json!("slow")
      }
    });
    let fast = Arc::clone(&order);
    let _fast = bus.on("work", move |_| {
      let fast = Arc::clone(&fast);
      async move {
        fast.lock().push("fast");
        json!("fast")
      }
    });

    let results = bus.emit_with("work", Value::Null, options).await;
    let values: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
    // Results always follow registration order.
    assert_eq!(values, vec![json!("slow"), json!("fast")]);
    let order = order.lock().clone();
    order
  }

  assert_eq!(run(EmitOptions::default().sequential()).await, vec!["slow", "fast"]);
  assert_eq!(run(EmitOptions::default()).await, vec!["fast", "slow"]);
}

#[tokio::test]
async fn test_once_listener_fires_a_single_time() {
  let bus = EventBus::new();
  let observer = bus.once("boot", |_| async { json!("booted") });
  assert_eq!(bus.listener_count("boot"), 1);

  let first = bus.emit("boot", Value::Null).await;
  let second = bus.emit("boot", Value::Null).await;

  assert_eq!(first.len(), 1);
  assert!(second.is_empty());
  assert!(!observer.is_active());
  assert_eq!(bus.listener_count("boot"), 0);
}

#[tokio::test]
async fn test_dropped_emission_still_reaches_one_shot_listeners() {
  let bus = EventBus::new();
  let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
  let slot = Mutex::new(Some(tx));
  let observer = bus.once("boot", move |data: Value| {
    let tx = slot.lock().take();
    async move {
      if let Some(tx) = tx {
        let _ = tx.send(data);
      }
    }
  });

  drop(bus.emit("boot", json!("now")));

  let delivered = tokio::time::timeout(Duration::from_secs(1), rx).await;
  assert_eq!(delivered.unwrap().unwrap(), json!("now"));
  assert!(!observer.is_active());
  assert_eq!(bus.listener_count("boot"), 0);
}

#[tokio::test]
async fn test_free_is_idempotent() {
  let bus = EventBus::new();
  let observer = bus.on("tick", |_| async {});

  observer.free();
  observer.free();

  assert!(!observer.is_active());
  assert!(bus.emit("tick", Value::Null).await.is_empty());
}

#[tokio::test]
async fn test_wait_resolves_with_the_next_emission() {
  let bus = EventBus::new();
  let observer = bus.on("ready", |_| async {});

  let waiting = tokio::spawn(observer.wait());
  let results = bus.emit("ready", json!("go")).await;

  assert_eq!(results.len(), 1);
  assert_eq!(waiting.await.unwrap(), Some(json!("go")));
  assert_eq!(bus.listener_count("ready"), 0);
  assert!(bus.emit("ready", json!("again")).await.is_empty());
}

#[tokio::test]
async fn test_wait_yields_none_when_the_bus_is_dropped() {
  let bus = EventBus::new();
  let waiting = bus.on("never", |_| async {}).wait();

  drop(bus);

  assert_eq!(waiting.await, None);
}

// --- Declared listeners ---

#[tokio::test]
async fn test_declared_members_listen_on_their_topics() {
  let (container, _registry) = audited();
  let auditor = container.resolve::<Auditor>("Auditor").unwrap();

  assert_eq!(topic_name("Auditor", "record"), "Auditor.record");
  container.emit("Auditor.record", json!(1)).await;
  container.emit("audit", json!(2)).await;

  assert_eq!(*auditor.seen.lock(), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_free_all_tears_down_instance_subscriptions() {
  let (container, _registry) = audited();
  let auditor: Instance = container.inject("Auditor", Default::default()).unwrap();

  assert_eq!(container.free_all(&auditor), 2);
  assert_eq!(container.free_all(&auditor), 0);
  assert!(container.emit("Auditor.record", json!(1)).await.is_empty());
}

#[tokio::test]
async fn test_invoke_appends_extra_arguments_after_resolved_ones() {
  struct Calculator {
    offset: i64,
  }

  let registry = Arc::new(MetadataRegistry::new());
  Declare::<Calculator>::new("Calculator")
    .construct(|_| Ok(Calculator { offset: 100 }))
    .method_param("scale", fibre_kernel::ArgResolver::state("FACTOR"))
    .method("scale", |this: Arc<Calculator>, args: Args| async move {
      let factor: i64 = args.value_as(0)?;
      let value: i64 = args.value_as(1)?;
      Ok::<_, Error>(json!(factor * value + this.offset))
    })
    .register_in(&registry);
  let container = Container::builder().registry(registry).state("FACTOR", 3).build();

  let by_identity = container.invoke("Calculator", "scale", vec![json!(2).into()]).unwrap().await.unwrap();
  assert_eq!(by_identity, json!(106));

  let instance: Instance = container.inject("Calculator", Default::default()).unwrap();
  let by_instance = container.invoke(instance, "scale", vec![json!(1).into()]).unwrap().await.unwrap();
  assert_eq!(by_instance, json!(103));

  assert!(matches!(
    container.invoke("Calculator", "missing", Vec::new()),
    Err(Error::NotAFunction(ref member)) if member == "Calculator.missing"
  ));
}

#[tokio::test]
async fn test_declaration_bound_listener_can_run_in_a_fork() {
  #[derive(Default)]
  struct Job {
    container: Inject<Container>,
  }

  let registry = Arc::new(MetadataRegistry::new());
  Declare::<Job>::new("Job")
    .default_construct()
    .inject("container", InjectTarget::Container, |j: &Job| &j.container)
    .method("run", |this: Arc<Job>, _args: Args| async move {
      let container = this.container.get()?;
      Ok::<_, Error>(json!(container.id()))
    })
    .register_in(&registry);
  let container = Container::builder().id("jobs").registry(registry).build();
  let _observer = container.on_declared("job", "Job", "run");

  let direct = container.emit("job", Value::Null).await;
  let forked = container
    .emit_with("job", Value::Null, EmitOptions::default().forked())
    .await;

  assert_eq!(direct[0].as_ref().unwrap(), &json!("jobs"));
  assert_eq!(forked[0].as_ref().unwrap(), &json!("jobs.1"));
}

#[tokio::test]
async fn test_declaration_bound_listener_without_a_container_is_detached() {
  let bus = EventBus::new();
  let _observer = bus.on_declared("job", "Job", "run");

  let results = bus.emit("job", Value::Null).await;

  assert!(matches!(results[0], Err(ListenerError::Detached)));
}
