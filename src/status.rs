//! Display-ready derivations of watcher state.
//!
//! Everything here is a pure function of a state snapshot: nothing is
//! cached between calls.

use std::collections::VecDeque;

use realtime_change_stream::{ChangeEvent, ChangeKind};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::context::RuntimeContext;
use crate::coordinator::MultiTableState;
use crate::watcher::WatchStatus;

/// Badge shown next to synchronized data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncIndicator {
   /// A reload is executing.
   Syncing,
   /// Subscribed and idle.
   Live,
   Offline,
}

impl SyncIndicator {
   /// Reconciling wins over connected.
   pub fn from_flags(connected: bool, reconciling: bool) -> Self {
      if reconciling {
         SyncIndicator::Syncing
      } else if connected {
         SyncIndicator::Live
      } else {
         SyncIndicator::Offline
      }
   }

   pub fn label(&self) -> &'static str {
      match self {
         SyncIndicator::Syncing => "Syncing",
         SyncIndicator::Live => "Live",
         SyncIndicator::Offline => "Offline",
      }
   }
}

impl std::fmt::Display for SyncIndicator {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(self.label())
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
   pub indicator: SyncIndicator,
   pub connected: bool,
   pub syncing: bool,
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_updated: Option<OffsetDateTime>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub error: Option<String>,
}

impl StatusView {
   pub fn from_state(status: &WatchStatus) -> Self {
      Self {
         indicator: SyncIndicator::from_flags(status.connected, status.reconciling),
         connected: status.connected,
         syncing: status.reconciling,
         last_updated: status.last_reconciled_at,
         error: status.error.clone(),
      }
   }

   /// Age of the last successful reload relative to `now`, such as
   /// `"12s ago"`. `"never"` before the first reload.
   pub fn last_updated_label(&self, now: OffsetDateTime) -> String {
      match self.last_updated {
         Some(at) => age_label(now - at),
         None => "never".to_string(),
      }
   }
}

fn age_label(age: Duration) -> String {
   let seconds = age.whole_seconds();
   if seconds < 5 {
      "just now".to_string()
   } else if seconds < 60 {
      format!("{seconds}s ago")
   } else if seconds < 3_600 {
      format!("{}m ago", seconds / 60)
   } else if seconds < 86_400 {
      format!("{}h ago", seconds / 3_600)
   } else {
      format!("{}d ago", seconds / 86_400)
   }
}

/// Roll-up of a [`MultiTableState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiTableSummary {
   pub total: usize,
   pub connected: usize,
   /// Tables reporting an error, with their first error.
   pub failed: Vec<(String, String)>,
   pub indicator: SyncIndicator,
}

impl MultiTableSummary {
   pub fn from_state(state: &MultiTableState) -> Self {
      let connected = state.iter().filter(|(_, table)| table.connected).count();
      let failed = state
         .iter()
         .filter_map(|(name, table)| table.error.clone().map(|error| (name.to_string(), error)))
         .collect();

      Self {
         total: state.len(),
         connected,
         failed,
         indicator: SyncIndicator::from_flags(state.all_connected(), false),
      }
   }

   /// For example `"2/3 tables live"`.
   pub fn label(&self) -> String {
      format!("{}/{} tables live", self.connected, self.total)
   }
}

/// Snapshot of the realtime layer for a diagnostics panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeDiagnostics {
   pub available: bool,
   /// Watchers holding at least one open subscription.
   pub active_owners: usize,
   #[serde(with = "time::serde::rfc3339")]
   pub checked_at: OffsetDateTime,
}

impl RealtimeDiagnostics {
   pub fn collect(ctx: &RuntimeContext) -> Self {
      Self {
         available: ctx.is_realtime_available(),
         active_owners: ctx.registry().owner_count(),
         checked_at: OffsetDateTime::now_utc(),
      }
   }
}

const RECENT_EVENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEvent {
   pub kind: ChangeKind,
   pub table: String,
   #[serde(with = "time::serde::rfc3339")]
   pub observed_at: OffsetDateTime,
}

/// Counts change events by kind and keeps the most recent ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTally {
   pub inserts: u64,
   pub updates: u64,
   pub deletes: u64,
   recent: VecDeque<RecentEvent>,
}

impl EventTally {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn record<T>(&mut self, event: &ChangeEvent<T>) {
      match event.kind() {
         ChangeKind::Insert => self.inserts += 1,
         ChangeKind::Update => self.updates += 1,
         ChangeKind::Delete => self.deletes += 1,
      }
      if self.recent.len() == RECENT_EVENTS {
         self.recent.pop_back();
      }
      self.recent.push_front(RecentEvent {
         kind: event.kind(),
         table: event.table().to_string(),
         observed_at: event.observed_at(),
      });
   }

   pub fn total(&self) -> u64 {
      self.inserts + self.updates + self.deletes
   }

   /// Newest first.
   pub fn recent(&self) -> impl Iterator<Item = &RecentEvent> {
      self.recent.iter()
   }

   pub fn clear(&mut self) {
      *self = Self::default();
   }
}
