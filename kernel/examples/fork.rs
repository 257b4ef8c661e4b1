use fibre_kernel::{Args, BoxError, Container, Declare, EmitOptions, Error, Inject, InjectTarget, State, STATE_MUTATE};
use serde_json::{json, Value};
use std::sync::Arc;

// One fork per request: each handler sees the shared configuration, keeps
// its own request-scoped values and writes shared counters back to the root.

#[derive(Default)]
struct Handler {
  container: Inject<Container>,
  served: State,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
  Declare::<Handler>::new("Handler")
    .default_construct()
    .inject("container", InjectTarget::Container, |h: &Handler| &h.container)
    .state("served", "SERVED", |h: &Handler| &h.served)
    .method("handle", |this: Arc<Handler>, args: Args| async move {
      let scope = this.container.get()?;
      let path = args.value(0)?.clone();
      let served = this.served.get_as::<u64>().unwrap_or(0) + 1;
      this.served.set(served)?.await;
      Ok::<_, Error>(json!({ "scope": scope.id(), "path": path, "served": served }))
    })
    .register();

  let root = Container::builder().id("server").state("SERVED", 0).build();
  let _audit = root.on(STATE_MUTATE, |change: Value| async move {
    println!("root state changed: {}", change);
  });
  let _route = root.on_declared("request", "Handler", "handle");

  for path in ["/", "/health", "/users"] {
    let results = root
      .emit_with("request", json!(path), EmitOptions::default().forked())
      .await;
    for result in results {
      println!("{}", result?);
    }
  }

  println!("served in total: {}", root.state("SERVED").unwrap_or(Value::Null));
  Ok(())
}
