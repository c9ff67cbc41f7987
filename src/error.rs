use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// `Store` and `Reconnect` variants are always fatal (see `fatal_exit`);
/// everything else is handled locally by the caller (API 4xx, nack+requeue,
/// log-and-continue).
#[derive(Error, Debug)]
pub enum ForwarderError {
  #[error("validation failed: {0}")]
  Validation(String),

  #[error("queue {0} is not being consumed")]
  NotFound(String),

  #[error("queue {0} is already being consumed")]
  AlreadyConsuming(String),

  #[error("queue {0} is already paused")]
  AlreadyPaused(String),

  #[error("queue {0} is not paused")]
  NotPaused(String),

  #[error("broker error: {0}")]
  Broker(#[from] lapin::Error),

  #[error("store open error: {0}")]
  Store(#[from] redb::DatabaseError),

  #[error("store transaction error: {0}")]
  StoreTransaction(#[from] redb::TransactionError),

  #[error("store table error: {0}")]
  StoreTable(#[from] redb::TableError),

  #[error("store storage error: {0}")]
  StoreStorage(#[from] redb::StorageError),

  #[error("store commit error: {0}")]
  StoreCommit(#[from] redb::CommitError),

  #[error("webhook transport error: {0}")]
  Webhook(#[from] reqwest::Error),

  #[error("payload decode error: {0}")]
  Decode(#[from] serde_json::Error),
}

impl ForwarderError {
  /// `true` for the fatal tier of the error-propagation policy: store I/O
  /// failures and exhausted reconnects. The caller is expected to log and
  /// call `std::process::exit`, not attempt further recovery.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      ForwarderError::Store(_)
        | ForwarderError::StoreTransaction(_)
        | ForwarderError::StoreTable(_)
        | ForwarderError::StoreStorage(_)
        | ForwarderError::StoreCommit(_)
    )
  }
}

/// Logs `err` and exits the process with a non-zero code.
///
/// This is the only recovery primitive for store failures and exhausted
/// reconnect attempts (spec §7): there is no middle tier of silent
/// degradation, so the process relies on its supervisor to restart it with
/// a clean snapshot.
pub fn fatal_exit(context: &str, err: impl std::fmt::Display) -> ! {
  log::error!("fatal: {context}: {err}");
  std::process::exit(1);
}
