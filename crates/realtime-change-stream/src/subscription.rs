use crate::change::{ChangeEvent, ChangeKind};
use crate::error::Error;
use crate::filter::Predicate;

/// Schema used when a subscription does not name one.
pub const DEFAULT_SCHEMA: &str = "public";

/// Set of change kinds a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKinds {
   insert: bool,
   update: bool,
   delete: bool,
}

impl Default for EventKinds {
   fn default() -> Self {
      Self::all()
   }
}

impl EventKinds {
   pub const fn all() -> Self {
      Self {
         insert: true,
         update: true,
         delete: true,
      }
   }

   pub const fn none() -> Self {
      Self {
         insert: false,
         update: false,
         delete: false,
      }
   }

   pub const fn only(kind: ChangeKind) -> Self {
      Self::none().with(kind)
   }

   pub const fn with(mut self, kind: ChangeKind) -> Self {
      match kind {
         ChangeKind::Insert => self.insert = true,
         ChangeKind::Update => self.update = true,
         ChangeKind::Delete => self.delete = true,
      }
      self
   }

   pub fn contains(&self, kind: ChangeKind) -> bool {
      match kind {
         ChangeKind::Insert => self.insert,
         ChangeKind::Update => self.update,
         ChangeKind::Delete => self.delete,
      }
   }

   pub fn is_all(&self) -> bool {
      self.insert && self.update && self.delete
   }

   pub fn is_empty(&self) -> bool {
      !(self.insert || self.update || self.delete)
   }

   pub fn iter(&self) -> impl Iterator<Item = ChangeKind> + '_ {
      ChangeKind::ALL.into_iter().filter(|kind| self.contains(*kind))
   }
}

impl FromIterator<ChangeKind> for EventKinds {
   fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
      iter.into_iter().fold(Self::none(), Self::with)
   }
}

/// What a single subscription watches: one table, optionally narrowed by a
/// column predicate and a subset of change kinds.
///
/// Two specs are equal when they would receive exactly the same events, which
/// is what callers use to decide whether a subscription must be reopened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSpec {
   table: String,
   schema: String,
   predicate: Option<Predicate>,
   events: EventKinds,
}

impl SubscriptionSpec {
   pub fn new(table: impl Into<String>) -> Self {
      Self {
         table: table.into(),
         schema: DEFAULT_SCHEMA.to_string(),
         predicate: None,
         events: EventKinds::all(),
      }
   }

   pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
      self.schema = schema.into();
      self
   }

   pub fn with_predicate(mut self, predicate: impl Into<Option<Predicate>>) -> Self {
      self.predicate = predicate.into();
      self
   }

   pub fn with_events(mut self, events: EventKinds) -> Self {
      self.events = events;
      self
   }

   pub fn table(&self) -> &str {
      &self.table
   }

   pub fn schema(&self) -> &str {
      &self.schema
   }

   pub fn predicate(&self) -> Option<&Predicate> {
      self.predicate.as_ref()
   }

   pub fn events(&self) -> EventKinds {
      self.events
   }

   pub(crate) fn validate(&self) -> crate::Result<()> {
      if self.table.trim().is_empty() {
         return Err(Error::EmptyTable);
      }
      Ok(())
   }

   /// Whether this subscription would receive `event`.
   ///
   /// Predicates are checked against the new row image for inserts and
   /// updates, and against the old image for deletes.
   pub fn accepts(&self, event: &ChangeEvent) -> bool {
      if event.table() != self.table || !self.events.contains(event.kind()) {
         return false;
      }

      let Some(predicate) = &self.predicate else {
         return true;
      };

      let image = match event.kind() {
         ChangeKind::Insert | ChangeKind::Update => event.after(),
         ChangeKind::Delete => event.before(),
      };
      image.is_some_and(|row| predicate.matches(row))
   }
}

#[cfg(test)]
mod tests {
   use serde_json::{Value, json};

   use super::*;
   use crate::change::RowImage;

   fn row(value: Value) -> RowImage {
      match value {
         Value::Object(map) => map,
         _ => RowImage::new(),
      }
   }

   #[test]
   fn test_event_kinds_defaults_to_all() {
      let kinds = EventKinds::default();
      assert!(kinds.is_all());
      assert_eq!(kinds.iter().count(), 3);
      assert!(EventKinds::none().is_empty());
   }

   #[test]
   fn test_event_kinds_from_iterator() {
      let kinds: EventKinds = [ChangeKind::Insert, ChangeKind::Delete].into_iter().collect();
      assert!(kinds.contains(ChangeKind::Insert));
      assert!(!kinds.contains(ChangeKind::Update));
      assert!(kinds.contains(ChangeKind::Delete));
   }

   #[test]
   fn test_accepts_checks_table_kind_and_predicate() {
      let spec = SubscriptionSpec::new("registros")
         .with_predicate(Predicate::eq("proyecto_id", 5).unwrap())
         .with_events(EventKinds::only(ChangeKind::Insert).with(ChangeKind::Delete));

      let matching = ChangeEvent::insert("registros", row(json!({"proyecto_id": 5})));
      let other_value = ChangeEvent::insert("registros", row(json!({"proyecto_id": 6})));
      let other_table = ChangeEvent::insert("personas", row(json!({"proyecto_id": 5})));
      let update = ChangeEvent::update(
         "registros",
         row(json!({"proyecto_id": 5})),
         row(json!({"proyecto_id": 5})),
      );
      let delete = ChangeEvent::delete("registros", row(json!({"proyecto_id": 5})));

      assert!(spec.accepts(&matching));
      assert!(!spec.accepts(&other_value));
      assert!(!spec.accepts(&other_table));
      assert!(!spec.accepts(&update));
      assert!(spec.accepts(&delete));
   }

   #[test]
   fn test_validate_rejects_blank_table() {
      assert!(matches!(SubscriptionSpec::new("  ").validate(), Err(Error::EmptyTable)));
      assert!(SubscriptionSpec::new("personas").validate().is_ok());
   }
}
