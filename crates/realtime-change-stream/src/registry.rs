//! Owner-keyed bookkeeping of live subscription handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::handle::{HandleInner, SubscriptionHandle};

/// Identifies the logical owner of a set of subscriptions, typically one
/// watcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
   pub fn new() -> Self {
      Self(Uuid::new_v4())
   }
}

impl Default for OwnerId {
   fn default() -> Self {
      Self::new()
   }
}

impl fmt::Display for OwnerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0.simple())
   }
}

/// Tracks which owner opened which subscriptions so every subscribe can be
/// matched by a release, even across rapid remounts.
///
/// Only weak references are held: handles stay exclusively owned by their
/// creators, and a handle dropped by its owner simply disappears from the
/// registry on the next access.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry(Arc<Mutex<HashMap<OwnerId, Vec<Weak<HandleInner>>>>>);

impl SubscriptionRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Records `handle` as belonging to `owner`.
   pub fn register(&self, owner: OwnerId, handle: &SubscriptionHandle) {
      let mut owners = self.0.lock();
      let entries = owners.entry(owner).or_default();
      entries.retain(is_live);
      entries.push(handle.downgrade());
   }

   /// Removes `handle` from `owner`'s set without closing it.
   pub fn forget(&self, owner: OwnerId, handle: &SubscriptionHandle) {
      let target = handle.downgrade();
      let mut owners = self.0.lock();
      if let Some(entries) = owners.get_mut(&owner) {
         entries.retain(|entry| !Weak::ptr_eq(entry, &target) && is_live(entry));
         if entries.is_empty() {
            owners.remove(&owner);
         }
      }
   }

   /// Closes every live subscription registered to `owner` and forgets the
   /// owner. Returns how many subscriptions were closed by this call.
   pub fn release_all(&self, owner: OwnerId) -> usize {
      let entries = self.0.lock().remove(&owner).unwrap_or_default();

      let mut released = 0;
      for inner in entries.iter().filter_map(Weak::upgrade) {
         if !inner.is_closed() {
            inner.dispose();
            released += 1;
         }
      }

      if released > 0 {
         debug!(owner = %owner, released, "Released owner subscriptions");
      }
      released
   }

   /// Closes every registered subscription of every owner.
   pub fn release_everything(&self) -> usize {
      let owners: Vec<OwnerId> = self.0.lock().keys().copied().collect();
      owners.into_iter().map(|owner| self.release_all(owner)).sum()
   }

   /// Number of open subscriptions currently registered to `owner`.
   pub fn active_count(&self, owner: OwnerId) -> usize {
      self
         .0
         .lock()
         .get(&owner)
         .map(|entries| entries.iter().filter(|entry| is_live(entry)).count())
         .unwrap_or(0)
   }

   /// Number of owners with at least one open subscription.
   pub fn owner_count(&self) -> usize {
      self
         .0
         .lock()
         .values()
         .filter(|entries| entries.iter().any(is_live))
         .count()
   }
}

fn is_live(entry: &Weak<HandleInner>) -> bool {
   entry.upgrade().is_some_and(|inner| !inner.is_closed())
}

impl fmt::Debug for SubscriptionRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("SubscriptionRegistry")
         .field("owners", &self.0.lock().len())
         .finish()
   }
}
