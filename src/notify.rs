//! Per-event user notifications ("toasts") for a watched table.

use realtime_change_stream::{
   ChangeEvent, ChangeKind, ChangeStreamClient, EventKinds, OwnerId, SubscriptionHandle, SubscriptionSpec,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::RuntimeContext;

/// Which change kinds produce a notification, and with which message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRules {
   enabled: bool,
   insert: Option<String>,
   update: Option<String>,
   delete: Option<String>,
}

impl Default for NotificationRules {
   fn default() -> Self {
      Self {
         enabled: true,
         insert: Some("New record added".to_string()),
         update: Some("Record updated".to_string()),
         delete: Some("Record deleted".to_string()),
      }
   }
}

impl NotificationRules {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn enabled(mut self, enabled: bool) -> Self {
      self.enabled = enabled;
      self
   }

   /// Notifies `kind` with `message`.
   pub fn with_message(mut self, kind: ChangeKind, message: impl Into<String>) -> Self {
      *self.slot(kind) = Some(message.into());
      self
   }

   /// Stops notifying `kind`.
   pub fn without(mut self, kind: ChangeKind) -> Self {
      *self.slot(kind) = None;
      self
   }

   pub fn message_for(&self, kind: ChangeKind) -> Option<&str> {
      match kind {
         ChangeKind::Insert => self.insert.as_deref(),
         ChangeKind::Update => self.update.as_deref(),
         ChangeKind::Delete => self.delete.as_deref(),
      }
   }

   /// Kinds that produce a notification. Empty when disabled.
   pub fn kinds(&self) -> EventKinds {
      if !self.enabled {
         return EventKinds::none();
      }
      ChangeKind::ALL
         .into_iter()
         .filter(|kind| self.message_for(*kind).is_some())
         .collect()
   }

   /// The notification for `event`, if its kind is notified.
   pub fn notification(&self, event: ChangeEvent) -> Option<ChangeNotification> {
      if !self.enabled {
         return None;
      }
      let message = self.message_for(event.kind())?.to_string();
      Some(ChangeNotification { message, event })
   }

   fn slot(&mut self, kind: ChangeKind) -> &mut Option<String> {
      match kind {
         ChangeKind::Insert => &mut self.insert,
         ChangeKind::Update => &mut self.update,
         ChangeKind::Delete => &mut self.delete,
      }
   }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
   pub message: String,
   pub event: ChangeEvent,
}

/// Subscribes to a table and turns its change events into
/// [`ChangeNotification`]s.
///
/// Only the notified kinds are subscribed to, so rules that notify nothing
/// open no subscription. Dropping the watcher releases the subscription.
pub struct NotificationWatcher {
   client: ChangeStreamClient,
   owner: OwnerId,
   handle: Option<SubscriptionHandle>,
}

impl NotificationWatcher {
   pub fn new<F>(ctx: &RuntimeContext, table: impl Into<String>, rules: NotificationRules, on_notification: F) -> Self
   where
      F: Fn(ChangeNotification) + Send + Sync + 'static,
   {
      let client = ctx.client().clone();
      let owner = OwnerId::new();
      let table = table.into();
      let kinds = rules.kinds();

      let handle = if kinds.is_empty() {
         debug!(table = %table, "No notified change kinds, not subscribing");
         None
      } else {
         let spec = SubscriptionSpec::new(table.as_str()).with_events(kinds);
         let subscribed = client.subscribe_for(owner, spec, move |event| {
            if let Some(notification) = rules.notification(event) {
               on_notification(notification);
            }
         });
         match subscribed {
            Ok(handle) => Some(handle),
            Err(e) => {
               warn!(table = %table, error = %e, "Notifications unavailable");
               None
            }
         }
      };

      Self { client, owner, handle }
   }

   pub fn subscription(&self) -> Option<&SubscriptionHandle> {
      self.handle.as_ref()
   }

   pub fn is_connected(&self) -> bool {
      self.handle.as_ref().is_some_and(|handle| handle.status().is_open())
   }

   /// Releases the subscription. Idempotent; also run on drop.
   pub fn close(&mut self) {
      if let Some(handle) = self.handle.take() {
         handle.dispose();
      }
      self.client.release_all(self.owner);
   }
}

impl Drop for NotificationWatcher {
   fn drop(&mut self) {
      self.close();
   }
}

impl std::fmt::Debug for NotificationWatcher {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("NotificationWatcher")
         .field("owner", &self.owner)
         .field("subscription", &self.handle)
         .finish()
   }
}
