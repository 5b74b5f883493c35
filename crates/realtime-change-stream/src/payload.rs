//! Normalization of provider change payloads.
//!
//! The provider delivers changes in two shapes: the client-library shape
//! `{eventType, new, old}` and the wire shape `{type, record, old_record}`.
//! Both deserialize into [`RawChange`], which is then checked and converted
//! into a [`ChangeEvent`].

use serde::Deserialize;
use serde_json::Value;

use crate::change::{ChangeEvent, ChangeKind, RowImage};
use crate::error::Error;

/// A change payload as received from the provider, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawChange {
   #[serde(rename = "eventType", alias = "type")]
   pub event_type: String,
   #[serde(default, alias = "record")]
   pub new: Option<Value>,
   #[serde(default, alias = "old_record")]
   pub old: Option<Value>,
   #[serde(default)]
   pub table: Option<String>,
   #[serde(default)]
   pub schema: Option<String>,
   #[serde(default)]
   pub commit_timestamp: Option<String>,
}

impl RawChange {
   /// Converts the payload into a [`ChangeEvent`].
   ///
   /// `fallback_table` names the subscribed table for payloads that omit it.
   /// Empty row objects count as absent. The provider sends `old: {}` for
   /// inserts and `new: {}` for deletes, and only primary-key columns in
   /// `old` for updates on tables without full replica identity, so an
   /// update with no old image gets an empty one.
   pub fn into_event(self, fallback_table: &str) -> crate::Result<ChangeEvent> {
      let table = self
         .table
         .filter(|t| !t.is_empty())
         .unwrap_or_else(|| fallback_table.to_string());
      let kind =
         ChangeKind::parse(&self.event_type).ok_or(Error::UnknownEventType(self.event_type))?;

      let malformed = |reason: &str| Error::MalformedEvent {
         table: table.clone(),
         kind: kind.to_string(),
         reason: reason.to_string(),
      };

      let new = image(self.new).map_err(|_| malformed("new row image is not an object"))?;
      let old = image(self.old).map_err(|_| malformed("old row image is not an object"))?;

      match kind {
         ChangeKind::Insert => {
            let after = new.ok_or_else(|| malformed("missing new row image"))?;
            Ok(ChangeEvent::insert(table, after))
         }
         ChangeKind::Update => {
            let after = new.ok_or_else(|| malformed("missing new row image"))?;
            Ok(ChangeEvent::update(table, old.unwrap_or_default(), after))
         }
         ChangeKind::Delete => {
            let before = old.ok_or_else(|| malformed("missing old row image"))?;
            Ok(ChangeEvent::delete(table, before))
         }
      }
   }
}

fn image(value: Option<Value>) -> Result<Option<RowImage>, ()> {
   match value {
      None | Some(Value::Null) => Ok(None),
      Some(Value::Object(map)) if map.is_empty() => Ok(None),
      Some(Value::Object(map)) => Ok(Some(map)),
      Some(_) => Err(()),
   }
}
