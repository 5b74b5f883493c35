//! Keeps locally held data in step with database change streams.
//!
//! A view hands a [`TableWatcher`] the table it shows and the function that
//! refetches it. The watcher subscribes to the table's changes and reloads
//! (debounced, serialized, never after teardown). It can also poll as a
//! fallback and reports a [`WatchStatus`] for a connection badge.
//! [`TableSetWatcher`] does the same for a list of tables and aggregates their
//! connection status.
//!
//! Push delivery comes from [`realtime_change_stream`]; with the default
//! `socket` feature, [`RuntimeContext::from_env`] connects it to the hosted
//! provider over a websocket.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use realtime_sync::{ReloadError, RuntimeContext, SyncConfig, TableWatcher, WatchOptions};
//!
//! # async fn example() {
//! let ctx = RuntimeContext::from_env(SyncConfig::default());
//!
//! let watcher = TableWatcher::new(
//!     &ctx,
//!     "registros",
//!     || async {
//!         // refetch the records shown on screen
//!         Ok::<(), ReloadError>(())
//!     },
//!     WatchOptions::new()
//!         .debounce(Duration::from_millis(500))
//!         .poll_interval(Duration::from_secs(30)),
//! );
//!
//! let status = watcher.status();
//! println!("connected: {}, syncing: {}", status.connected, status.reconciling);
//! # }
//! ```

pub mod config;
pub mod context;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod notify;
pub mod polling;
pub mod presets;
pub mod reconcile;
pub mod status;
pub mod watcher;

pub use config::SyncConfig;
pub use context::RuntimeContext;
pub use coordinator::{MultiTableState, TableSetWatcher, TableState, TableSubscription, WatchSetOptions};
pub use debounce::Debouncer;
pub use error::{Error, ReloadError, Result};
pub use notify::{ChangeNotification, NotificationRules, NotificationWatcher};
pub use polling::PollingFallback;
pub use presets::TablePreset;
pub use reconcile::{ReconciliationState, Reconciler, Reloader, TriggerSource};
pub use status::{EventTally, MultiTableSummary, RealtimeDiagnostics, RecentEvent, StatusView, SyncIndicator};
pub use watcher::{TableWatcher, WatchOptions, WatchStatus};

pub use realtime_change_stream::{
   ChangeEvent, ChangeKind, EventKinds, FilterOp, LocalBroker, Predicate, SubscriptionHandle, SubscriptionSpec,
   SubscriptionStatus,
};
