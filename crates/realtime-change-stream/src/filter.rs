//! Column predicates in the provider's `column=op.value` filter grammar.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::change::RowImage;
use crate::error::Error;

static FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(eq|neq|gt|gte|lt|lte|in)\.(.+)$")
      .expect("filter pattern is valid")
});

static COLUMN_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("column pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
   Eq,
   Neq,
   Gt,
   Gte,
   Lt,
   Lte,
   /// Membership in a parenthesized list, e.g. `status=in.(open,closed)`.
   In,
}

impl FilterOp {
   pub fn as_str(&self) -> &'static str {
      match self {
         FilterOp::Eq => "eq",
         FilterOp::Neq => "neq",
         FilterOp::Gt => "gt",
         FilterOp::Gte => "gte",
         FilterOp::Lt => "lt",
         FilterOp::Lte => "lte",
         FilterOp::In => "in",
      }
   }

   fn parse(value: &str) -> Option<Self> {
      Some(match value {
         "eq" => FilterOp::Eq,
         "neq" => FilterOp::Neq,
         "gt" => FilterOp::Gt,
         "gte" => FilterOp::Gte,
         "lt" => FilterOp::Lt,
         "lte" => FilterOp::Lte,
         "in" => FilterOp::In,
         _ => return None,
      })
   }
}

/// A single-column condition narrowing which row changes a subscription
/// receives, such as `project_id=eq.5`.
///
/// Predicates are forwarded verbatim to the transport. [`Predicate::matches`]
/// evaluates one locally against a row image, which the in-process broker
/// uses to emulate server-side filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Predicate {
   column: String,
   op: FilterOp,
   value: String,
}

impl Predicate {
   pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> crate::Result<Self> {
      let column = column.into();
      let value = value.into();

      if !COLUMN_RE.is_match(&column) || value.is_empty() {
         return Err(Error::InvalidPredicate(format!("{column}={}.{value}", op.as_str())));
      }
      if op == FilterOp::In && !(value.starts_with('(') && value.ends_with(')')) {
         return Err(Error::InvalidPredicate(format!("{column}=in.{value}")));
      }

      Ok(Self { column, op, value })
   }

   pub fn eq(column: impl Into<String>, value: impl ToString) -> crate::Result<Self> {
      Self::new(column, FilterOp::Eq, value.to_string())
   }

   pub fn neq(column: impl Into<String>, value: impl ToString) -> crate::Result<Self> {
      Self::new(column, FilterOp::Neq, value.to_string())
   }

   pub fn gt(column: impl Into<String>, value: impl ToString) -> crate::Result<Self> {
      Self::new(column, FilterOp::Gt, value.to_string())
   }

   pub fn lt(column: impl Into<String>, value: impl ToString) -> crate::Result<Self> {
      Self::new(column, FilterOp::Lt, value.to_string())
   }

   /// Builds an `in` predicate from a list of values.
   pub fn one_of<I, S>(column: impl Into<String>, values: I) -> crate::Result<Self>
   where
      I: IntoIterator<Item = S>,
      S: ToString,
   {
      let joined = values
         .into_iter()
         .map(|v| v.to_string())
         .collect::<Vec<_>>()
         .join(",");
      Self::new(column, FilterOp::In, format!("({joined})"))
   }

   pub fn column(&self) -> &str {
      &self.column
   }

   pub fn op(&self) -> FilterOp {
      self.op
   }

   pub fn value(&self) -> &str {
      &self.value
   }

   /// Evaluates the predicate against a row image.
   ///
   /// Follows SQL comparison semantics: a missing column, `null`, or a value
   /// that cannot be compared with the operand never matches, not even `neq`.
   pub fn matches(&self, row: &RowImage) -> bool {
      let Some(actual) = row.get(&self.column) else {
         return false;
      };

      match self.op {
         FilterOp::Eq => compare(actual, &self.value) == Some(Ordering::Equal),
         FilterOp::Neq => matches!(compare(actual, &self.value), Some(o) if o != Ordering::Equal),
         FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
         FilterOp::Gte => matches!(compare(actual, &self.value), Some(o) if o != Ordering::Less),
         FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
         FilterOp::Lte => matches!(compare(actual, &self.value), Some(o) if o != Ordering::Greater),
         FilterOp::In => self
            .list_values()
            .any(|candidate| compare(actual, candidate) == Some(Ordering::Equal)),
      }
   }

   fn list_values(&self) -> impl Iterator<Item = &str> {
      self
         .value
         .trim_start_matches('(')
         .trim_end_matches(')')
         .split(',')
         .map(|v| v.trim().trim_matches('"'))
         .filter(|v| !v.is_empty())
   }
}

fn compare(actual: &Value, operand: &str) -> Option<Ordering> {
   match actual {
      Value::Number(n) => {
         let lhs = n.as_f64()?;
         let rhs: f64 = operand.parse().ok()?;
         lhs.partial_cmp(&rhs)
      }
      Value::String(s) => Some(s.as_str().cmp(operand)),
      Value::Bool(b) => operand.parse::<bool>().ok().map(|rhs| b.cmp(&rhs)),
      Value::Null | Value::Array(_) | Value::Object(_) => None,
   }
}

impl fmt::Display for Predicate {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
   }
}

impl FromStr for Predicate {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let captures = FILTER_RE
         .captures(s.trim())
         .ok_or_else(|| Error::InvalidPredicate(s.to_string()))?;
      let op = FilterOp::parse(&captures[2]).ok_or_else(|| Error::InvalidPredicate(s.to_string()))?;
      Predicate::new(&captures[1], op, &captures[3])
   }
}

impl Serialize for Predicate {
   fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Predicate {
   fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
   where
      D: Deserializer<'de>,
   {
      let raw = String::deserialize(deserializer)?;
      raw.parse().map_err(serde::de::Error::custom)
   }
}
