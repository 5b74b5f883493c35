//! Channel protocol frames.
//!
//! Every frame is a JSON object `{topic, event, payload, ref}`. Channel
//! topics are `realtime:<channel>`; heartbeats travel on the `phoenix`
//! topic.

use realtime_change_stream::{RawChange, SubscriptionSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const TOPIC_PREFIX: &str = "realtime:";
pub const HEARTBEAT_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_SYSTEM: &str = "system";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

/// One protocol frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
   pub topic: String,
   pub event: String,
   #[serde(default)]
   pub payload: Value,
   #[serde(rename = "ref", default)]
   pub msg_ref: Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub join_ref: Option<String>,
}

/// One entry of the `postgres_changes` join configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresChangesFilter {
   pub event: String,
   pub schema: String,
   pub table: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub filter: Option<String>,
}

impl PostgresChangesFilter {
   /// Filters for `spec`: a single `*` entry when every kind is wanted,
   /// otherwise one entry per kind.
   pub fn for_spec(spec: &SubscriptionSpec) -> Vec<Self> {
      let entry = |event: &str| Self {
         event: event.to_string(),
         schema: spec.schema().to_string(),
         table: spec.table().to_string(),
         filter: spec.predicate().map(ToString::to_string),
      };

      if spec.events().is_all() {
         vec![entry("*")]
      } else {
         spec.events().iter().map(|kind| entry(kind.as_str())).collect()
      }
   }
}

pub fn topic_for(channel: &str) -> String {
   format!("{TOPIC_PREFIX}{channel}")
}

/// The channel name of a `realtime:` topic.
pub fn channel_of(topic: &str) -> Option<&str> {
   topic.strip_prefix(TOPIC_PREFIX)
}

impl Frame {
   pub fn join(channel: &str, spec: &SubscriptionSpec, access_token: &str, msg_ref: String) -> Self {
      let payload = json!({
         "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": PostgresChangesFilter::for_spec(spec),
            "private": false,
         },
         "access_token": access_token,
      });
      Self {
         topic: topic_for(channel),
         event: EVENT_JOIN.to_string(),
         payload,
         join_ref: Some(msg_ref.clone()),
         msg_ref: Some(msg_ref),
      }
   }

   pub fn leave(channel: &str, msg_ref: String) -> Self {
      Self {
         topic: topic_for(channel),
         event: EVENT_LEAVE.to_string(),
         payload: json!({}),
         msg_ref: Some(msg_ref),
         join_ref: None,
      }
   }

   pub fn heartbeat(msg_ref: String) -> Self {
      Self {
         topic: HEARTBEAT_TOPIC.to_string(),
         event: EVENT_HEARTBEAT.to_string(),
         payload: json!({}),
         msg_ref: Some(msg_ref),
         join_ref: None,
      }
   }

   pub fn to_text(&self) -> crate::Result<String> {
      Ok(serde_json::to_string(self)?)
   }
}

/// Outcome carried by a `phx_reply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
   Ok,
   Error(String),
}

/// An inbound frame, classified.
#[derive(Debug, Clone)]
pub enum Inbound {
   Reply {
      topic: String,
      msg_ref: Option<String>,
      status: ReplyStatus,
   },
   /// Server-side notice about a channel extension, such as the result of
   /// setting up the change feed.
   System {
      topic: String,
      ok: bool,
      message: String,
   },
   Change {
      topic: String,
      change: RawChange,
   },
   ChannelError {
      topic: String,
   },
   ChannelClosed {
      topic: String,
   },
   /// Frames this client has no use for (presence, broadcasts, token
   /// refresh acks).
   Ignored {
      topic: String,
      event: String,
   },
}

impl Inbound {
   pub fn parse(text: &str) -> crate::Result<Self> {
      let frame: Frame = serde_json::from_str(text)?;
      let Frame {
         topic,
         event,
         payload,
         msg_ref,
         ..
      } = frame;

      let parsed = match event.as_str() {
         EVENT_REPLY => Inbound::Reply {
            topic,
            msg_ref,
            status: reply_status(&payload),
         },
         EVENT_SYSTEM => {
            let ok = payload.get("status").and_then(Value::as_str) == Some("ok");
            let message = payload
               .get("message")
               .and_then(Value::as_str)
               .unwrap_or_default()
               .to_string();
            Inbound::System { topic, ok, message }
         }
         EVENT_POSTGRES_CHANGES => {
            let data = payload
               .get("data")
               .cloned()
               .ok_or_else(|| crate::Error::Protocol("postgres_changes frame without data".into()))?;
            Inbound::Change {
               topic,
               change: serde_json::from_value(data)?,
            }
         }
         EVENT_ERROR => Inbound::ChannelError { topic },
         EVENT_CLOSE => Inbound::ChannelClosed { topic },
         _ => Inbound::Ignored { topic, event },
      };
      Ok(parsed)
   }
}

fn reply_status(payload: &Value) -> ReplyStatus {
   if payload.get("status").and_then(Value::as_str) == Some("ok") {
      return ReplyStatus::Ok;
   }
   let response = payload.get("response");
   let reason = response
      .and_then(|r| r.get("reason").or_else(|| r.get("message")))
      .and_then(Value::as_str)
      .map(str::to_string)
      .or_else(|| response.filter(|r| !r.is_null()).map(Value::to_string))
      .unwrap_or_else(|| "join rejected".to_string());
   ReplyStatus::Error(reason)
}
