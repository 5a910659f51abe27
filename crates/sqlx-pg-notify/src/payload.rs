//! Notification envelope codec.
//!
//! Trigger functions publish a JSON document per mutated row:
//!
//! ```text
//! {"operation": "INSERT", "timestamp": "2024-05-01T10:00:00.123456+00:00", "data": {"id": 1, ...}}
//! ```
//!
//! `data` is the row after the change for INSERT and UPDATE, and the row before
//! the change for DELETE.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tracing::warn;

use crate::{Error, Result};

/// Largest payload PostgreSQL accepts in a single `NOTIFY` (8000 bytes, exclusive).
///
/// Encoding does not enforce this. Wide rows, or rows with large text/json columns,
/// produce envelopes that the server rejects when the trigger fires.
pub const MAX_PAYLOAD_BYTES: usize = 7999;

/// A row snapshot: column name to dynamically typed value, in column order.
pub type RowData = IndexMap<String, JsonValue>;

/// Row mutation kind, matching PostgreSQL's `TG_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
   Insert,
   Update,
   Delete,
}

impl Operation {
   /// All operations, in declaration order.
   pub const ALL: [Operation; 3] = [Operation::Insert, Operation::Update, Operation::Delete];

   /// The SQL keyword for this operation.
   pub fn as_str(&self) -> &'static str {
      match self {
         Operation::Insert => "INSERT",
         Operation::Update => "UPDATE",
         Operation::Delete => "DELETE",
      }
   }

   /// Whether the row snapshot comes from `OLD` (pre-image) rather than `NEW`.
   pub fn uses_old_row(&self) -> bool {
      matches!(self, Operation::Delete)
   }
}

impl fmt::Display for Operation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for Operation {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.to_ascii_uppercase().as_str() {
         "INSERT" => Ok(Operation::Insert),
         "UPDATE" => Ok(Operation::Update),
         "DELETE" => Ok(Operation::Delete),
         other => Err(Error::MalformedPayload(format!("unknown operation: {other}"))),
      }
   }
}

/// A decoded row-change notification.
///
/// Shared read-only between every handler registered on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
   pub operation: Operation,
   #[serde(with = "time::serde::rfc3339")]
   pub timestamp: OffsetDateTime,
   pub data: RowData,
}

impl NotificationPayload {
   /// Returns the value of a single column, if present.
   pub fn get(&self, column: &str) -> Option<&JsonValue> {
      self.data.get(column)
   }

   /// Converts the row snapshot into an application type.
   ///
   /// ```
   /// use serde::Deserialize;
   /// use sqlx_pg_notify::payload::decode;
   ///
   /// #[derive(Deserialize)]
   /// struct Item {
   ///     id: i64,
   ///     name: String,
   /// }
   ///
   /// let payload = decode(
   ///     r#"{"operation":"INSERT","timestamp":"2024-05-01T10:00:00+00:00","data":{"id":7,"name":"lamp"}}"#,
   /// )
   /// .unwrap();
   /// let item: Item = payload.data_as().unwrap();
   /// assert_eq!((item.id, item.name.as_str()), (7, "lamp"));
   /// ```
   pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
      let value = serde_json::to_value(&self.data)?;
      Ok(serde_json::from_value(value)?)
   }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
   operation: Operation,
   #[serde(with = "time::serde::rfc3339")]
   timestamp: OffsetDateTime,
   data: &'a RowData,
}

/// Encodes a row change into the envelope text published by trigger functions.
pub fn encode(operation: Operation, timestamp: OffsetDateTime, row: &RowData) -> Result<String> {
   let text = serde_json::to_string(&EnvelopeRef {
      operation,
      timestamp,
      data: row,
   })?;

   if text.len() > MAX_PAYLOAD_BYTES {
      warn!(
         size = text.len(),
         limit = MAX_PAYLOAD_BYTES,
         "Encoded payload exceeds the NOTIFY size limit"
      );
   }

   Ok(text)
}

/// Decodes envelope text received from a `NOTIFY`.
///
/// Returns [`Error::MalformedPayload`] when the text is not a JSON object with an
/// `operation`, an RFC 3339 `timestamp` and an object-valued `data`.
pub fn decode(text: &str) -> Result<NotificationPayload> {
   serde_json::from_str(text).map_err(|e| Error::MalformedPayload(e.to_string()))
}
