//! The caching worker: lifecycle state machine plus per-request routing.
//!
//! A worker is bound to one version of the app. Its lifecycle runs
//! `Installing → Waiting → Activating → Active`:
//! - `Install` fetches every shell asset and stores them together, or stores nothing
//! - `Activate` sweeps partitions left by other versions, then claims open pages
//! - a `SKIP_WAITING` message activates a waiting worker right away
//!
//! Until the worker is `Active`, fetches bypass the cache and go to the network.

mod strategy;

pub use strategy::{offline_response, Strategy, StrategyEngine, OFFLINE_BODY};

use futures::future::join_all;
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::network::Fetcher;

/// Lifecycle state of a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  /// Shell not cached yet (initial state, and after a failed install)
  Installing,
  /// Shell cached, waiting to take over
  Waiting,
  /// Sweeping outdated partitions
  Activating,
  /// Intercepting every request
  Active,
}

impl State {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
    }
  }
}

/// Control message sent by the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
  /// Take over without waiting for old pages to close
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
  #[serde(other)]
  Unknown,
}

impl Message {
  /// Decode a JSON payload; anything unrecognized becomes `Unknown`.
  pub fn from_json(value: serde_json::Value) -> Self {
    serde_json::from_value(value).unwrap_or(Message::Unknown)
  }
}

/// Events delivered to [`ServiceWorker::dispatch`].
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  Message(Message),
}

impl Event {
  fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch(_) => "fetch",
      Self::Message(_) => "message",
    }
  }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum Outcome {
  /// Shell cached; the worker is `Waiting` or, with skip-waiting, already `Active`
  Installed { assets: usize },
  /// Sweep done and pages claimed; lists the partitions removed
  Activated { retired: Vec<String> },
  /// Answer for an intercepted request
  Response(Response),
  /// Event accepted with nothing to report
  Acknowledged,
}

#[derive(Debug)]
struct Lifecycle {
  state: State,
  skip_waiting: bool,
  claimed: bool,
}

/// One version of the caching worker.
pub struct ServiceWorker {
  config: Arc<WorkerConfig>,
  origin: Url,
  store: CacheStore,
  fetcher: Arc<dyn Fetcher>,
  engine: StrategyEngine,
  lifecycle: Mutex<Lifecycle>,
}

impl ServiceWorker {
  /// Create a worker for `config.version`.
  ///
  /// A version whose shell partition already exists in the store was installed by an
  /// earlier run and starts `Active`, controlling pages; otherwise it starts `Installing`.
  pub fn new(
    config: WorkerConfig,
    origin: Url,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let fallback = config.fallback_payload()?;
    let config = Arc::new(config);
    let engine = StrategyEngine::new(
      Arc::clone(&config),
      fallback,
      store.clone(),
      Arc::clone(&fetcher),
    );

    let resumed = store.has(&config.shell_partition())?;
    let state = if resumed {
      State::Active
    } else {
      State::Installing
    };
    debug!(version = %config.version, state = state.as_str(), "Worker created");

    Ok(Self {
      lifecycle: Mutex::new(Lifecycle {
        state,
        skip_waiting: config.skip_waiting,
        claimed: resumed,
      }),
      config,
      origin,
      store,
      fetcher,
      engine,
    })
  }

  pub fn state(&self) -> Result<State> {
    Ok(self.lifecycle()?.state)
  }

  /// Whether open pages are routed through this worker.
  pub fn controls_pages(&self) -> Result<bool> {
    Ok(self.lifecycle()?.claimed)
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn engine(&self) -> &StrategyEngine {
    &self.engine
  }

  /// Single entry point for every lifecycle and request event.
  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    let state = self.state()?;
    debug!(event = event.name(), state = state.as_str(), "Dispatching event");

    match event {
      Event::Install => {
        if state != State::Installing {
          return Err(self.invalid("install", state));
        }
        let assets = self.install().await?;
        self.set_state(State::Waiting)?;
        let skip_waiting = self.lifecycle()?.skip_waiting;
        if skip_waiting {
          self.activate().await?;
        }
        Ok(Outcome::Installed { assets })
      }
      Event::Activate => match state {
        State::Waiting => self.activate().await,
        State::Active => Ok(Outcome::Acknowledged),
        other => Err(self.invalid("activate", other)),
      },
      Event::Fetch(request) => Ok(Outcome::Response(self.route(&request).await?)),
      Event::Message(Message::SkipWaiting) => {
        self.lifecycle()?.skip_waiting = true;
        info!(state = state.as_str(), "Skip waiting requested");
        if state == State::Waiting {
          self.activate().await
        } else {
          Ok(Outcome::Acknowledged)
        }
      }
      Event::Message(Message::Unknown) => {
        debug!("Ignoring unknown message");
        Ok(Outcome::Acknowledged)
      }
    }
  }

  /// Route one request and return its response.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    self.route(&request).await
  }

  async fn route(&self, request: &Request) -> Result<Response> {
    if self.controls_pages()? {
      self.engine.handle(request).await
    } else {
      debug!(url = %request.url(), "Not controlling pages yet, going to network");
      self.engine.passthrough(request).await
    }
  }

  /// Drive the worker to `Active`, installing first if needed.
  pub async fn ensure_active(&self) -> Result<()> {
    if self.state()? == State::Installing {
      self.dispatch(Event::Install).await?;
    }
    if self.state()? == State::Waiting {
      self.dispatch(Event::Activate).await?;
    }
    Ok(())
  }

  async fn install(&self) -> Result<usize> {
    let partition = self.config.shell_partition();
    info!(%partition, assets = self.config.shell_assets.len(), "Caching app shell");

    let requests = self
      .config
      .shell_assets
      .iter()
      .map(|path| Request::get_path(&self.origin, path))
      .collect::<Result<Vec<_>>>()?;

    let results = join_all(requests.iter().map(|r| self.fetcher.fetch(r))).await;

    let mut pairs = Vec::with_capacity(requests.len());
    let mut failed = Vec::new();
    for (request, result) in requests.into_iter().zip(results) {
      match result {
        Ok(response) if response.ok() => pairs.push((request, response)),
        Ok(response) => {
          warn!(url = %request.url(), status = response.status(), "Shell asset rejected");
          failed.push(format!("{} ({})", request.url().path(), response.status()));
        }
        Err(e) if e.is_network() => {
          warn!(url = %request.url(), error = %e, "Shell asset unreachable");
          failed.push(request.url().path().to_string());
        }
        Err(e) => return Err(e),
      }
    }

    if !failed.is_empty() {
      let err = Error::Install {
        partition,
        total: self.config.shell_assets.len(),
        failed,
      };
      error!(error = %err, "Install failed");
      return Err(err);
    }

    let assets = pairs.len();
    self.store.partition(&partition).put_all(pairs)?;
    info!(%partition, assets, "App shell cached");
    Ok(assets)
  }

  async fn activate(&self) -> Result<Outcome> {
    info!(version = %self.config.version, "Activating worker");
    self.set_state(State::Activating)?;

    let retired = match self
      .store
      .delete_partitions_not_in(&self.config.active_partitions())
    {
      Ok(retired) => retired,
      Err(e) => {
        self.set_state(State::Waiting)?;
        return Err(e);
      }
    };

    {
      let mut lifecycle = self.lifecycle()?;
      lifecycle.claimed = true;
      lifecycle.state = State::Active;
    }
    info!(version = %self.config.version, retired = retired.len(), "Worker active and controlling pages");
    Ok(Outcome::Activated { retired })
  }

  fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
    self
      .lifecycle
      .lock()
      .map_err(|e| Error::LockPoisoned(e.to_string()))
  }

  fn set_state(&self, state: State) -> Result<()> {
    self.lifecycle()?.state = state;
    Ok(())
  }

  fn invalid(&self, event: &'static str, state: State) -> Error {
    Error::InvalidTransition {
      event,
      state: state.as_str(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, CachedEntry, MemoryStorage};
  use crate::http::{RequestKey, ResponseSource, StoredResponse};
  use crate::tasks::Task;
  use crate::testing::{origin, MockFetcher};

  fn config(version: &str, skip_waiting: bool) -> WorkerConfig {
    WorkerConfig {
      version: version.to_string(),
      shell_assets: vec!["/".into(), "/styles.css".into(), "/app.js".into()],
      skip_waiting,
      ..WorkerConfig::default()
    }
  }

  fn online_fetcher() -> Arc<MockFetcher> {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.route("/", 200, "<html></html>");
    fetcher.route("/styles.css", 200, "body {}");
    fetcher.route("/app.js", 200, "main()");
    fetcher.route("/data.json", 200, r#"[{"id":1,"task":"a","completed":false,"priority":"high"}]"#);
    fetcher
  }

  fn worker(
    version: &str,
    skip_waiting: bool,
    store: &CacheStore,
    fetcher: &Arc<MockFetcher>,
  ) -> ServiceWorker {
    ServiceWorker::new(
      config(version, skip_waiting),
      origin(),
      store.clone(),
      fetcher.clone(),
    )
    .unwrap()
  }

  fn get(path: &str) -> Request {
    Request::get_path(&origin(), path).unwrap()
  }

  /// Memory storage whose bulk writes always fail.
  struct FullDisk(MemoryStorage);

  impl CacheStorage for FullDisk {
    fn create_partition(&self, name: &str) -> Result<()> {
      self.0.create_partition(name)
    }

    fn has_partition(&self, name: &str) -> Result<bool> {
      self.0.has_partition(name)
    }

    fn partition_names(&self) -> Result<Vec<String>> {
      self.0.partition_names()
    }

    fn delete_partition(&self, name: &str) -> Result<bool> {
      self.0.delete_partition(name)
    }

    fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
      self.0.get(partition, key)
    }

    fn put(&self, partition: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
      self.0.put(partition, key, response)
    }

    fn put_all(&self, _partition: &str, _entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
      Err(Error::Io(std::io::Error::other("disk full")))
    }

    fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
      self.0.entries(partition)
    }
  }

  #[tokio::test]
  async fn test_install_then_activate() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);
    assert_eq!(sw.state().unwrap(), State::Installing);

    let outcome = sw.dispatch(Event::Install).await.unwrap();
    assert!(matches!(outcome, Outcome::Installed { assets: 3 }));
    assert_eq!(sw.state().unwrap(), State::Waiting);
    assert!(!sw.controls_pages().unwrap());
    assert_eq!(store.partition("app-shell-v1").entries().unwrap().len(), 3);

    let outcome = sw.dispatch(Event::Activate).await.unwrap();
    assert!(matches!(outcome, Outcome::Activated { .. }));
    assert_eq!(sw.state().unwrap(), State::Active);
    assert!(sw.controls_pages().unwrap());
  }

  #[tokio::test]
  async fn test_skip_waiting_config_activates_after_install() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", true, &store, &fetcher);

    sw.dispatch(Event::Install).await.unwrap();
    assert_eq!(sw.state().unwrap(), State::Active);
  }

  #[tokio::test]
  async fn test_install_failure_stores_nothing_and_allows_retry() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    fetcher.unreachable("/app.js");
    let sw = worker("v1", true, &store, &fetcher);

    let err = sw.dispatch(Event::Install).await.unwrap_err();
    match err {
      Error::Install { failed, total, .. } => {
        assert_eq!(total, 3);
        assert_eq!(failed, vec!["/app.js"]);
      }
      other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sw.state().unwrap(), State::Installing);
    assert!(!store.has("app-shell-v1").unwrap());

    let err = sw.dispatch(Event::Activate).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    fetcher.restore("/app.js");
    sw.dispatch(Event::Install).await.unwrap();
    assert_eq!(sw.state().unwrap(), State::Active);
    assert_eq!(store.partition("app-shell-v1").entries().unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    fetcher.route("/styles.css", 404, "Not Found");
    let sw = worker("v1", true, &store, &fetcher);

    let err = sw.dispatch(Event::Install).await.unwrap_err();
    assert!(err.to_string().contains("/styles.css (404)"));
    assert!(store.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_twice_is_invalid() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);

    sw.dispatch(Event::Install).await.unwrap();
    let err = sw.dispatch(Event::Install).await.unwrap_err();
    assert!(matches!(
      err,
      Error::InvalidTransition {
        event: "install",
        state: "waiting"
      }
    ));
  }

  #[tokio::test]
  async fn test_shell_served_from_cache_after_install() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", true, &store, &fetcher);
    sw.dispatch(Event::Install).await.unwrap();
    let installs = fetcher.calls().len();

    fetcher.set_offline(true);
    let response = sw.fetch(get("/styles.css")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.source(), ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "body {}");
    assert_eq!(fetcher.calls().len(), installs);
  }

  #[tokio::test]
  async fn test_fetch_before_activation_bypasses_cache() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);
    sw.dispatch(Event::Install).await.unwrap();

    let response = sw.fetch(get("/styles.css")).await.unwrap();
    assert_eq!(response.source(), ResponseSource::Network);

    let response = sw.fetch(get("/data.json")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(!store.has("data-cache-v1").unwrap());

    fetcher.set_offline(true);
    let response = sw.fetch(get("/styles.css")).await.unwrap();
    assert_eq!(response.status(), 503);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_waiting_worker() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);
    sw.dispatch(Event::Install).await.unwrap();
    assert_eq!(sw.state().unwrap(), State::Waiting);

    let message = Message::from_json(serde_json::json!({ "type": "SKIP_WAITING" }));
    assert_eq!(message, Message::SkipWaiting);
    let outcome = sw.dispatch(Event::Message(message)).await.unwrap();
    assert!(matches!(outcome, Outcome::Activated { .. }));
    assert_eq!(sw.state().unwrap(), State::Active);
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_applies_later() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);

    let outcome = sw
      .dispatch(Event::Message(Message::SkipWaiting))
      .await
      .unwrap();
    assert!(matches!(outcome, Outcome::Acknowledged));
    assert_eq!(sw.state().unwrap(), State::Installing);

    sw.dispatch(Event::Install).await.unwrap();
    assert_eq!(sw.state().unwrap(), State::Active);
  }

  #[tokio::test]
  async fn test_unknown_message_ignored() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);

    for payload in [
      serde_json::json!({ "type": "REFRESH" }),
      serde_json::json!("SKIP_WAITING"),
      serde_json::json!(null),
    ] {
      let message = Message::from_json(payload);
      assert_eq!(message, Message::Unknown);
      let outcome = sw.dispatch(Event::Message(message)).await.unwrap();
      assert!(matches!(outcome, Outcome::Acknowledged));
    }
    assert_eq!(sw.state().unwrap(), State::Installing);
  }

  #[tokio::test]
  async fn test_upgrade_sweeps_old_partitions() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();

    let v1 = worker("v1", true, &store, &fetcher);
    v1.dispatch(Event::Install).await.unwrap();
    v1.fetch(get("/data.json")).await.unwrap();
    store.open("unrelated-cache").unwrap();
    assert!(store.has("data-cache-v1").unwrap());

    let v2 = worker("v2", false, &store, &fetcher);
    v2.dispatch(Event::Install).await.unwrap();
    // Old version keeps its caches while the new one waits.
    assert!(store.has("app-shell-v1").unwrap());

    let outcome = v2.dispatch(Event::Activate).await.unwrap();
    let Outcome::Activated { mut retired } = outcome else {
      panic!("expected activation");
    };
    retired.sort();
    assert_eq!(retired, vec!["app-shell-v1", "data-cache-v1", "unrelated-cache"]);

    for name in store.keys().unwrap() {
      assert!(name == "app-shell-v2" || name == "data-cache-v2", "leftover {name}");
    }
  }

  #[tokio::test]
  async fn test_installed_version_resumes_active() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    worker("v1", true, &store, &fetcher)
      .dispatch(Event::Install)
      .await
      .unwrap();

    fetcher.set_offline(true);
    let resumed = worker("v1", false, &store, &fetcher);
    assert_eq!(resumed.state().unwrap(), State::Active);
    assert!(resumed.controls_pages().unwrap());

    let response = resumed.fetch(get("/app.js")).await.unwrap();
    assert_eq!(response.source(), ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "main()");

    let outcome = resumed.dispatch(Event::Activate).await.unwrap();
    assert!(matches!(outcome, Outcome::Acknowledged));
  }

  #[tokio::test]
  async fn test_failed_shell_write_leaves_no_partition() {
    let store = CacheStore::new(FullDisk(MemoryStorage::new()));
    let fetcher = online_fetcher();
    let sw = worker("v1", true, &store, &fetcher);

    let err = sw.dispatch(Event::Install).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(sw.state().unwrap(), State::Installing);
    assert!(!store.has("app-shell-v1").unwrap());

    let restarted = worker("v1", true, &store, &fetcher);
    assert_eq!(restarted.state().unwrap(), State::Installing);
    assert!(!restarted.controls_pages().unwrap());
  }

  #[test]
  fn test_poisoned_lifecycle_is_reported() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", false, &store, &fetcher);

    std::thread::scope(|s| {
      let _ = s
        .spawn(|| {
          let _guard = sw.lifecycle.lock().unwrap();
          panic!("worker thread died holding the lifecycle lock");
        })
        .join();
    });

    assert!(matches!(sw.state(), Err(Error::LockPoisoned(_))));
    assert!(matches!(sw.controls_pages(), Err(Error::LockPoisoned(_))));
  }

  #[tokio::test]
  async fn test_offline_data_scenarios_through_dispatch() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let sw = worker("v1", true, &store, &fetcher);
    sw.ensure_active().await.unwrap();

    fetcher.set_offline(true);
    let tasks: Vec<Task> = sw.fetch(get("/data.json")).await.unwrap().json().unwrap();
    assert_eq!(tasks.len(), 6);

    fetcher.set_offline(false);
    sw.fetch(get("/data.json")).await.unwrap();
    fetcher.set_offline(true);
    let tasks: Vec<Task> = sw.fetch(get("/data.json")).await.unwrap().json().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, 1);
  }

  #[tokio::test]
  async fn test_custom_fallback_payload() {
    let store = CacheStore::new(MemoryStorage::new());
    let fetcher = online_fetcher();
    let mut config = config("v1", true);
    config.fallback_tasks = Some(vec![Task {
      id: 42,
      task: "Only task".into(),
      completed: false,
      priority: crate::tasks::Priority::Medium,
    }]);
    let sw = ServiceWorker::new(config, origin(), store, fetcher.clone()).unwrap();
    sw.ensure_active().await.unwrap();

    fetcher.set_offline(true);
    let tasks: Vec<Task> = sw.fetch(get("/data.json")).await.unwrap().json().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, 42);
  }
}
