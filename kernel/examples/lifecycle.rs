use fibre_kernel::{async_trait, BoxError, Container, Declare, Env, Inject, Lifecycle, Registration};
use std::sync::atomic::{AtomicBool, Ordering};

// A small service graph: Api -> Cache -> Database.

#[derive(Default)]
struct Database {
  url: Env,
  open: AtomicBool,
}

#[async_trait]
impl Lifecycle for Database {
  async fn on_start(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    let url = self.url.get_as::<String>()?.unwrap_or_default();
    println!("database: connecting to {}", url);
    self.open.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn on_stop(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    println!("database: closing");
    self.open.store(false, Ordering::SeqCst);
    Ok(())
  }
}

#[derive(Default)]
struct Cache {
  db: Inject<Database>,
}

#[async_trait]
impl Lifecycle for Cache {
  async fn on_start(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    println!("cache: warming (database open: {})", self.db.get()?.open.load(Ordering::SeqCst));
    Ok(())
  }

  async fn on_stop(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    println!("cache: flushing");
    Ok(())
  }
}

#[derive(Default)]
struct Api {
  cache: Inject<Cache>,
}

#[async_trait]
impl Lifecycle for Api {
  async fn on_configure(&self, registrations: &[Registration]) -> Result<(), BoxError> {
    let order: Vec<&str> = registrations.iter().map(|r| r.identity().as_str()).collect();
    println!("api: start order will be {:?}", order);
    Ok(())
  }

  async fn on_start(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    self.cache.get()?;
    println!("api: listening");
    Ok(())
  }

  async fn on_stop(&self, _registrations: &[Registration]) -> Result<(), BoxError> {
    println!("api: draining");
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
  Declare::<Database>::new("Database")
    .default_construct()
    .env("url", "DATABASE_URL", None, |d: &Database| &d.url)
    .lifecycle()
    .register();
  Declare::<Cache>::new("Cache")
    .default_construct()
    .inject("db", "Database", |c: &Cache| &c.db)
    .lifecycle()
    .register();
  Declare::<Api>::new("Api")
    .default_construct()
    .inject("cache", "Cache", |a: &Api| &a.cache)
    .lifecycle()
    .register();

  let container = Container::builder()
    .state("DATABASE_URL", "postgres://${DB_HOST}/app")
    .state("DB_HOST", "localhost")
    .build();
  container.with(["Api", "Cache", "Database"])?;

  container.start().await?;
  println!("--- running ---");
  container.stop().await?;
  Ok(())
}
