//! Shared websocket connection for realtime channels.
//!
//! One connection task owns the websocket and every channel joined over it:
//!
//! - Channel joins and leaves are queued as commands, so opening never blocks
//! - Frames are routed to channels by topic
//! - Heartbeats run on a fixed interval; an unanswered heartbeat drops the connection
//! - Lost connections are retried on the configured backoff schedule and every
//!   open channel is rejoined afterwards

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use realtime_change_stream::{
   ChangeTransport, ChannelRequest, EventSink, SubscriptionSpec, SubscriptionStatus, TransportEvent,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::SocketConfig;
use crate::error::Error;
use crate::message::{Frame, HEARTBEAT_TOPIC, Inbound, ReplyStatus, channel_of};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
   Open(ChannelRequest),
   Close {
      channel: String,
      done: oneshot::Sender<()>,
   },
   Shutdown,
}

/// A [`ChangeTransport`] over the provider's websocket channel protocol.
///
/// All channels share one connection. The handle is cheap to hold; the
/// connection task stops when the socket is dropped or
/// [`shutdown`](Self::shutdown) is called.
pub struct RealtimeSocket {
   commands: mpsc::UnboundedSender<Command>,
   connected: Arc<AtomicBool>,
}

impl RealtimeSocket {
   /// Validates `config` and starts the connection task.
   ///
   /// Returns as soon as the task is running; connecting happens in the
   /// background. Must be called inside a tokio runtime.
   pub fn spawn(config: SocketConfig) -> crate::Result<Arc<Self>> {
      let url = config.websocket_url()?;
      let (commands, command_rx) = mpsc::unbounded_channel();
      let connected = Arc::new(AtomicBool::new(false));

      let task = ConnectionTask {
         config,
         url,
         channels: HashMap::new(),
         next_ref: 0,
         last_error: None,
         connected: Arc::clone(&connected),
      };
      tokio::spawn(task.run(command_rx));

      Ok(Arc::new(Self {
         commands,
         connected,
      }))
   }

   /// Whether the websocket is currently established.
   pub fn is_connected(&self) -> bool {
      self.connected.load(Ordering::Acquire)
   }

   /// Leaves every channel and closes the connection.
   pub fn shutdown(&self) {
      let _ = self.commands.send(Command::Shutdown);
   }
}

impl Drop for RealtimeSocket {
   fn drop(&mut self) {
      let _ = self.commands.send(Command::Shutdown);
   }
}

impl ChangeTransport for RealtimeSocket {
   fn open(&self, request: ChannelRequest) -> realtime_change_stream::Result<()> {
      self
         .commands
         .send(Command::Open(request))
         .map_err(|_| realtime_change_stream::Error::from(Error::Shutdown))
   }

   fn close(&self, channel: &str) -> BoxFuture<'static, realtime_change_stream::Result<()>> {
      let (done, finished) = oneshot::channel();
      let queued = self
         .commands
         .send(Command::Close {
            channel: channel.to_string(),
            done,
         })
         .is_ok();

      async move {
         // A stopped task has nothing left to release.
         if queued {
            let _ = finished.await;
         }
         Ok(())
      }
      .boxed()
   }
}

impl std::fmt::Debug for RealtimeSocket {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("RealtimeSocket")
         .field("connected", &self.is_connected())
         .finish()
   }
}

// ── Connection task ─────────────────────────────────────────────────────────

struct ChannelEntry {
   spec: SubscriptionSpec,
   sink: EventSink,
   /// Ref of the join in flight or acknowledged; `None` while not joined.
   join_ref: Option<String>,
   joined: bool,
}

impl ChannelEntry {
   fn report(&self, status: SubscriptionStatus) {
      let _ = self.sink.send(TransportEvent::Status(status));
   }

   fn reset(&mut self) {
      self.join_ref = None;
      self.joined = false;
   }
}

struct Live {
   ws: WsStream,
   heartbeat: Interval,
   pending_heartbeat: Option<String>,
}

enum Step {
   Continue,
   Disconnected(String),
   Shutdown,
}

struct ConnectionTask {
   config: SocketConfig,
   url: Url,
   channels: HashMap<String, ChannelEntry>,
   next_ref: u64,
   last_error: Option<String>,
   connected: Arc<AtomicBool>,
}

impl ConnectionTask {
   async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
      let mut live: Option<Live> = None;
      let mut attempt = 0usize;

      loop {
         let step = match live.as_mut() {
            Some(conn) => {
               tokio::select! {
                  biased;

                  command = commands.recv() => match command {
                     Some(Command::Shutdown) | None => Step::Shutdown,
                     Some(command) => self.handle_command(conn, command).await,
                  },

                  _ = conn.heartbeat.tick() => self.heartbeat(conn).await,

                  frame = conn.ws.next() => self.handle_frame(conn, frame),
               }
            }
            None => {
               if attempt > 0 {
                  let delay = self.config.backoff_for(attempt - 1);
                  debug!(attempt, ?delay, "Waiting before reconnect");
                  if !self.wait_offline(&mut commands, delay).await {
                     self.connected.store(false, Ordering::Release);
                     return;
                  }
               }
               attempt += 1;

               match self.connect().await {
                  Ok(mut conn) => {
                     info!(endpoint = %self.config.endpoint, "Realtime socket connected");
                     attempt = 0;
                     self.last_error = None;
                     self.connected.store(true, Ordering::Release);
                     match self.rejoin_all(&mut conn).await {
                        Ok(()) => {
                           live = Some(conn);
                           Step::Continue
                        }
                        Err(e) => Step::Disconnected(e.to_string()),
                     }
                  }
                  Err(e) => {
                     warn!(endpoint = %self.config.endpoint, attempt, error = %e, "Realtime connection failed");
                     self.mark_disconnected(&e.to_string());
                     Step::Continue
                  }
               }
            }
         };

         match step {
            Step::Continue => {}
            Step::Disconnected(reason) => {
               warn!(reason = %reason, "Realtime socket disconnected");
               live = None;
               attempt = attempt.max(1);
               self.mark_disconnected(&reason);
            }
            Step::Shutdown => {
               if let Some(conn) = live.as_mut() {
                  self.leave_all(conn).await;
                  let _ = conn.ws.close(None).await;
               }
               self.connected.store(false, Ordering::Release);
               debug!(channels = self.channels.len(), "Realtime socket shut down");
               return;
            }
         }
      }
   }

   fn next_ref(&mut self) -> String {
      self.next_ref += 1;
      self.next_ref.to_string()
   }

   async fn connect(&self) -> crate::Result<Live> {
      let timeout = self.config.connect_timeout();
      let (ws, _response) =
         tokio::time::timeout(timeout, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))??;

      let period = self.config.heartbeat_interval();
      let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
      heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

      Ok(Live {
         ws,
         heartbeat,
         pending_heartbeat: None,
      })
   }

   /// Reports the lost connection on every channel; they rejoin once a new
   /// connection is up.
   fn mark_disconnected(&mut self, reason: &str) {
      self.connected.store(false, Ordering::Release);
      let status = SubscriptionStatus::Error(format!("connection lost: {reason}"));
      for entry in self.channels.values_mut() {
         entry.reset();
         entry.report(status.clone());
      }
      self.last_error = Some(reason.to_string());
   }

   /// Serves commands until `delay` elapses. Returns false on shutdown.
   async fn wait_offline(
      &mut self,
      commands: &mut mpsc::UnboundedReceiver<Command>,
      delay: std::time::Duration,
   ) -> bool {
      let sleep = tokio::time::sleep(delay);
      tokio::pin!(sleep);

      loop {
         tokio::select! {
            biased;

            command = commands.recv() => match command {
               Some(Command::Open(request)) => {
                  let lost = self.last_error.as_ref().map(|reason| format!("connection lost: {reason}"));
                  let entry = self.register(request);
                  if let Some(reason) = lost {
                     entry.report(SubscriptionStatus::Error(reason));
                  }
               }
               Some(Command::Close { channel, done }) => {
                  self.channels.remove(&channel);
                  let _ = done.send(());
               }
               Some(Command::Shutdown) | None => return false,
            },

            () = &mut sleep => return true,
         }
      }
   }

   fn register(&mut self, request: ChannelRequest) -> &mut ChannelEntry {
      let ChannelRequest {
         channel,
         spec,
         sink,
      } = request;
      debug!(channel = %channel, table = %spec.table(), "Registering channel");
      let entry = ChannelEntry {
         spec,
         sink,
         join_ref: None,
         joined: false,
      };
      match self.channels.entry(channel) {
         Entry::Occupied(mut slot) => {
            slot.insert(entry);
            slot.into_mut()
         }
         Entry::Vacant(slot) => slot.insert(entry),
      }
   }

   async fn handle_command(&mut self, conn: &mut Live, command: Command) -> Step {
      match command {
         Command::Open(request) => {
            let channel = request.channel.clone();
            self.register(request);
            match self.join(conn, &channel).await {
               Ok(()) => Step::Continue,
               Err(e) => Step::Disconnected(e.to_string()),
            }
         }
         Command::Close { channel, done } => {
            let result = match self.channels.remove(&channel) {
               Some(entry) if entry.join_ref.is_some() => {
                  let frame = Frame::leave(&channel, self.next_ref());
                  send(&mut conn.ws, &frame).await
               }
               _ => Ok(()),
            };
            debug!(channel = %channel, "Left channel");
            let _ = done.send(());
            match result {
               Ok(()) => Step::Continue,
               Err(e) => Step::Disconnected(e.to_string()),
            }
         }
         Command::Shutdown => Step::Shutdown,
      }
   }

   async fn join(&mut self, conn: &mut Live, channel: &str) -> crate::Result<()> {
      let msg_ref = self.next_ref();
      let Some(entry) = self.channels.get_mut(channel) else {
         return Ok(());
      };
      entry.join_ref = Some(msg_ref.clone());
      entry.joined = false;
      entry.report(SubscriptionStatus::Connecting);

      let frame = Frame::join(channel, &entry.spec, self.config.join_token(), msg_ref);
      trace!(channel = %channel, "Joining channel");
      send(&mut conn.ws, &frame).await
   }

   async fn rejoin_all(&mut self, conn: &mut Live) -> crate::Result<()> {
      let channels: Vec<String> = self.channels.keys().cloned().collect();
      if !channels.is_empty() {
         info!(channels = channels.len(), "Rejoining channels");
      }
      for channel in channels {
         self.join(conn, &channel).await?;
      }
      Ok(())
   }

   /// Retries channels whose join was rejected or errored, then sends the
   /// next heartbeat.
   async fn heartbeat(&mut self, conn: &mut Live) -> Step {
      if conn.pending_heartbeat.is_some() {
         return Step::Disconnected("heartbeat timeout".to_string());
      }

      let idle: Vec<String> = self
         .channels
         .iter()
         .filter(|(_, entry)| entry.join_ref.is_none())
         .map(|(name, _)| name.clone())
         .collect();
      for channel in idle {
         if let Err(e) = self.join(conn, &channel).await {
            return Step::Disconnected(e.to_string());
         }
      }

      let msg_ref = self.next_ref();
      if let Err(e) = send(&mut conn.ws, &Frame::heartbeat(msg_ref.clone())).await {
         return Step::Disconnected(e.to_string());
      }
      conn.pending_heartbeat = Some(msg_ref);
      Step::Continue
   }

   async fn leave_all(&mut self, conn: &mut Live) {
      let joined: Vec<String> = self
         .channels
         .iter()
         .filter(|(_, entry)| entry.join_ref.is_some())
         .map(|(name, _)| name.clone())
         .collect();
      for channel in joined {
         let frame = Frame::leave(&channel, self.next_ref());
         if send(&mut conn.ws, &frame).await.is_err() {
            break;
         }
      }
   }

   fn handle_frame(
      &mut self,
      conn: &mut Live,
      frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
   ) -> Step {
      match frame {
         Some(Ok(Message::Text(text))) => {
            match Inbound::parse(&text) {
               Ok(inbound) => self.route(conn, inbound),
               Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
            Step::Continue
         }
         Some(Ok(Message::Close(close))) => Step::Disconnected(match close {
            Some(close) if !close.reason.is_empty() => close.reason.to_string(),
            _ => "server closed the connection".to_string(),
         }),
         Some(Ok(Message::Binary(_))) => {
            debug!("Ignoring binary frame");
            Step::Continue
         }
         Some(Ok(_)) => Step::Continue,
         Some(Err(e)) => Step::Disconnected(e.to_string()),
         None => Step::Disconnected("websocket stream ended".to_string()),
      }
   }

   fn route(&mut self, conn: &mut Live, inbound: Inbound) {
      match inbound {
         Inbound::Reply { topic, msg_ref, .. } if topic == HEARTBEAT_TOPIC => {
            if msg_ref.is_some() && conn.pending_heartbeat == msg_ref {
               trace!(?msg_ref, "Heartbeat acknowledged");
               conn.pending_heartbeat = None;
            }
         }
         Inbound::Reply {
            topic,
            msg_ref,
            status,
         } => {
            let Some((channel, entry)) = self.entry_for(&topic) else {
               return;
            };
            if entry.joined || msg_ref.is_none() || entry.join_ref != msg_ref {
               return;
            }
            match status {
               ReplyStatus::Ok => {
                  entry.joined = true;
                  debug!(channel = %channel, "Channel joined");
                  entry.report(SubscriptionStatus::Open);
               }
               ReplyStatus::Error(reason) => {
                  entry.reset();
                  warn!(channel = %channel, reason = %reason, "Channel join rejected");
                  entry.report(SubscriptionStatus::Error(reason));
               }
            }
         }
         Inbound::System { topic, ok, message } => {
            let Some((channel, entry)) = self.entry_for(&topic) else {
               return;
            };
            if ok {
               debug!(channel = %channel, message = %message, "Channel system notice");
            } else {
               warn!(channel = %channel, message = %message, "Channel change feed failed");
               entry.report(SubscriptionStatus::Error(message));
            }
         }
         Inbound::Change { topic, change } => {
            let Some((channel, entry)) = self.entry_for(&topic) else {
               trace!(topic = %topic, "Change for unknown channel");
               return;
            };
            match change.into_event(entry.spec.table()) {
               Ok(event) => {
                  trace!(channel = %channel, kind = %event.kind(), "Routing change");
                  let _ = entry.sink.send(TransportEvent::Change(event));
               }
               Err(realtime_change_stream::Error::UnknownEventType(kind)) => {
                  warn!(channel = %channel, kind = %kind, "Dropping change with unknown event type");
               }
               Err(e) => {
                  error!(channel = %channel, error = %e, "Failed to convert change payload");
               }
            }
         }
         Inbound::ChannelError { topic } => {
            if let Some((channel, entry)) = self.entry_for(&topic) {
               entry.reset();
               warn!(channel = %channel, "Server reported a channel error");
               entry.report(SubscriptionStatus::Error("channel error".to_string()));
            }
         }
         Inbound::ChannelClosed { topic } => {
            if let Some((channel, entry)) = self.entry_for(&topic) {
               entry.reset();
               debug!(channel = %channel, "Server closed the channel");
               entry.report(SubscriptionStatus::Closed);
            }
         }
         Inbound::Ignored { topic, event } => {
            trace!(topic = %topic, event = %event, "Ignoring frame");
         }
      }
   }

   fn entry_for<'a>(&'a mut self, topic: &'a str) -> Option<(&'a str, &'a mut ChannelEntry)> {
      let channel = channel_of(topic)?;
      self.channels.get_mut(channel).map(|entry| (channel, entry))
   }
}

async fn send(ws: &mut WsStream, frame: &Frame) -> crate::Result<()> {
   ws.send(Message::Text(frame.to_text()?.into())).await?;
   Ok(())
}
