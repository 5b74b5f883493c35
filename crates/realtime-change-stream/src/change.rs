use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::Error;

/// Opaque row image: column name to value.
///
/// This crate never interprets row contents beyond predicate evaluation in
/// the in-process broker; images are forwarded as received.
pub type RowImage = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
   Insert,
   Update,
   Delete,
}

impl ChangeKind {
   pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

   /// Wire name of the kind (`INSERT`, `UPDATE`, `DELETE`).
   pub fn as_str(&self) -> &'static str {
      match self {
         ChangeKind::Insert => "INSERT",
         ChangeKind::Update => "UPDATE",
         ChangeKind::Delete => "DELETE",
      }
   }

   /// Parses a wire name, ignoring ASCII case.
   pub fn parse(value: &str) -> Option<Self> {
      Self::ALL
         .into_iter()
         .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
   }
}

impl fmt::Display for ChangeKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Notification of a single row change on a subscribed table.
///
/// The row images follow the kind: an `Insert` carries only `after`, a
/// `Delete` carries only `before`, and an `Update` carries both. The
/// constructors enforce this, so a `ChangeEvent` in hand is always well formed.
///
/// `T` is the row shape. Events arrive from transports as `ChangeEvent<RowImage>`
/// and can be turned into a per-table type with [`ChangeEvent::decode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent<T = RowImage> {
   kind: ChangeKind,
   table: String,
   #[serde(skip_serializing_if = "Option::is_none")]
   before: Option<T>,
   #[serde(skip_serializing_if = "Option::is_none")]
   after: Option<T>,
   #[serde(with = "time::serde::rfc3339")]
   observed_at: OffsetDateTime,
}

impl<T> ChangeEvent<T> {
   pub fn insert(table: impl Into<String>, after: T) -> Self {
      Self::assemble(ChangeKind::Insert, table.into(), None, Some(after))
   }

   pub fn update(table: impl Into<String>, before: T, after: T) -> Self {
      Self::assemble(ChangeKind::Update, table.into(), Some(before), Some(after))
   }

   pub fn delete(table: impl Into<String>, before: T) -> Self {
      Self::assemble(ChangeKind::Delete, table.into(), Some(before), None)
   }

   /// Builds an event from loose parts, rejecting combinations that violate
   /// the image rules for `kind`.
   pub fn from_parts(
      kind: ChangeKind,
      table: impl Into<String>,
      before: Option<T>,
      after: Option<T>,
   ) -> crate::Result<Self> {
      let table = table.into();
      let reason = match (kind, before.is_some(), after.is_some()) {
         (ChangeKind::Insert, false, true)
         | (ChangeKind::Update, true, true)
         | (ChangeKind::Delete, true, false) => None,
         (ChangeKind::Insert, _, _) => Some("insert must carry only the new row image"),
         (ChangeKind::Update, _, _) => Some("update must carry both row images"),
         (ChangeKind::Delete, _, _) => Some("delete must carry only the old row image"),
      };

      if let Some(reason) = reason {
         return Err(Error::MalformedEvent {
            table,
            kind: kind.to_string(),
            reason: reason.to_string(),
         });
      }

      Ok(Self::assemble(kind, table, before, after))
   }

   fn assemble(kind: ChangeKind, table: String, before: Option<T>, after: Option<T>) -> Self {
      Self {
         kind,
         table,
         before,
         after,
         observed_at: OffsetDateTime::now_utc(),
      }
   }

   /// Overrides the observation timestamp.
   pub fn with_observed_at(mut self, observed_at: OffsetDateTime) -> Self {
      self.observed_at = observed_at;
      self
   }

   pub fn kind(&self) -> ChangeKind {
      self.kind
   }

   pub fn table(&self) -> &str {
      &self.table
   }

   /// Row image before the change (UPDATE and DELETE).
   pub fn before(&self) -> Option<&T> {
      self.before.as_ref()
   }

   /// Row image after the change (INSERT and UPDATE).
   pub fn after(&self) -> Option<&T> {
      self.after.as_ref()
   }

   /// The image describing the affected row: `after` when present, otherwise
   /// `before` (deletes).
   pub fn row(&self) -> Option<&T> {
      self.after.as_ref().or(self.before.as_ref())
   }

   pub fn observed_at(&self) -> OffsetDateTime {
      self.observed_at
   }

   /// Converts both images with `f`, keeping kind, table and timestamp.
   pub fn map_rows<U>(self, mut f: impl FnMut(T) -> U) -> ChangeEvent<U> {
      ChangeEvent {
         kind: self.kind,
         table: self.table,
         before: self.before.map(&mut f),
         after: self.after.map(&mut f),
         observed_at: self.observed_at,
      }
   }

   /// Fallible variant of [`map_rows`](Self::map_rows).
   pub fn try_map_rows<U, E>(
      self,
      mut f: impl FnMut(T) -> Result<U, E>,
   ) -> Result<ChangeEvent<U>, E> {
      Ok(ChangeEvent {
         kind: self.kind,
         table: self.table,
         before: self.before.map(&mut f).transpose()?,
         after: self.after.map(&mut f).transpose()?,
         observed_at: self.observed_at,
      })
   }
}

impl ChangeEvent<RowImage> {
   /// Decodes the opaque row images into a typed row.
   ///
   /// ```
   /// use realtime_change_stream::{ChangeEvent, RowImage};
   /// use serde::Deserialize;
   ///
   /// #[derive(Deserialize)]
   /// struct Persona {
   ///     id: i64,
   ///     nombre: String,
   /// }
   ///
   /// let mut row = RowImage::new();
   /// row.insert("id".into(), 7.into());
   /// row.insert("nombre".into(), "Ana".into());
   ///
   /// let event = ChangeEvent::insert("personas", row).decode::<Persona>().unwrap();
   /// assert_eq!(event.after().map(|p| p.id), Some(7));
   /// ```
   pub fn decode<U: DeserializeOwned>(self) -> crate::Result<ChangeEvent<U>> {
      self
         .try_map_rows(|row| serde_json::from_value(Value::Object(row)))
         .map_err(Error::from)
   }
}

#[cfg(test)]
mod tests {
   use serde_json::json;

   use super::*;

   fn row(value: Value) -> RowImage {
      match value {
         Value::Object(map) => map,
         _ => RowImage::new(),
      }
   }

   #[test]
   fn test_kind_parse_is_case_insensitive() {
      assert_eq!(ChangeKind::parse("insert"), Some(ChangeKind::Insert));
      assert_eq!(ChangeKind::parse(" UPDATE "), Some(ChangeKind::Update));
      assert_eq!(ChangeKind::parse("Delete"), Some(ChangeKind::Delete));
      assert_eq!(ChangeKind::parse("TRUNCATE"), None);
   }

   #[test]
   fn test_from_parts_enforces_image_rules() {
      let image = row(json!({"id": 1}));

      assert!(ChangeEvent::from_parts(ChangeKind::Insert, "t", None, Some(image.clone())).is_ok());
      assert!(
         ChangeEvent::from_parts(ChangeKind::Insert, "t", Some(image.clone()), Some(image.clone()))
            .is_err()
      );
      assert!(ChangeEvent::from_parts(ChangeKind::Update, "t", None, Some(image.clone())).is_err());
      assert!(ChangeEvent::from_parts(ChangeKind::Delete, "t", Some(image.clone()), None).is_ok());
      assert!(ChangeEvent::<RowImage>::from_parts(ChangeKind::Delete, "t", None, None).is_err());
   }

   #[test]
   fn test_row_prefers_new_image() {
      let update = ChangeEvent::update("t", row(json!({"v": 1})), row(json!({"v": 2})));
      assert_eq!(update.row().and_then(|r| r.get("v")), Some(&json!(2)));

      let delete = ChangeEvent::delete("t", row(json!({"v": 1})));
      assert_eq!(delete.row().and_then(|r| r.get("v")), Some(&json!(1)));
   }

   #[test]
   fn test_decode_reports_shape_mismatch() {
      #[derive(Debug, Deserialize)]
      #[allow(dead_code)]
      struct Strict {
         id: i64,
      }

      let event = ChangeEvent::insert("t", row(json!({"id": "not a number"})));
      assert!(matches!(event.decode::<Strict>(), Err(Error::Decode(_))));
   }

   #[test]
   fn test_serializes_camel_case_without_missing_images() {
      let event = ChangeEvent::insert("registros", row(json!({"id": 3})));
      let value = serde_json::to_value(&event).unwrap();

      assert_eq!(value["kind"], json!("INSERT"));
      assert_eq!(value["table"], json!("registros"));
      assert!(value.get("before").is_none());
      assert!(value.get("observedAt").is_some());
   }
}
