use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum_server::Handle;
use forwarder::config::Config;
use forwarder::epoch::EpochManager;
use forwarder::error::fatal_exit;
use forwarder::registry::ConsumerRegistry;
use forwarder::store::Store;
use forwarder::supervisor::Supervisor;
use forwarder::webhook::WebhookClient;
use forwarder::{api, webhook};
use lazy_static::lazy_static;

lazy_static! {
  /// Every bound `axum_server::Handle`, so the signal handler can trigger
  /// graceful shutdown without threading a channel through `main`.
  static ref LISTENERS: Mutex<Vec<Handle>> = Mutex::new(Vec::new());
}

#[tokio::main]
async fn main() {
  env_logger::init();

  let config = match Config::from_env() {
    Ok(config) => config,
    Err(err) => fatal_exit("loading configuration", err),
  };

  let store = match Store::open(&config.db_path) {
    Ok(store) => Arc::new(store),
    Err(err) => fatal_exit("opening store", err),
  };

  let registry = ConsumerRegistry::new();
  let epoch = Arc::new(EpochManager::new());
  let webhook: Arc<dyn webhook::WebhookSender> = Arc::new(WebhookClient::new());

  let (handle, supervisor) =
    match Supervisor::bootstrap(&config, registry, store, epoch, webhook).await {
      Ok(pair) => pair,
      Err(err) => fatal_exit("connecting to the broker", err),
    };

  tokio::spawn(supervisor.run());

  let server_handle = Handle::new();
  LISTENERS.lock().unwrap().push(server_handle.clone());
  install_signal_handler();

  let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
  log::info!("listening on {addr}");

  let router = api::router(handle.clone());
  if let Err(err) = axum_server::bind(addr)
    .handle(server_handle)
    .serve(router.into_make_service())
    .await
  {
    log::error!("server error: {err}");
  }

  handle.shutdown().await;
  log::info!("shut down cleanly");
}

/// SIGINT/SIGTERM both trigger graceful shutdown of every registered axum
/// server handle (spec §5). `ctrlc`'s `termination` feature folds SIGTERM
/// into the same callback as SIGINT on unix.
fn install_signal_handler() {
  ctrlc::set_handler(move || {
    log::info!("shutdown signal received, draining connections");
    for handle in LISTENERS.lock().unwrap().iter() {
      handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    }
  })
  .expect("signal handler can only be installed once, at startup");
}
