//! Explicit runtime context handed to every watcher.

use std::sync::Arc;

use realtime_change_stream::{ChangeStreamClient, ChangeTransport, SubscriptionRegistry};
#[cfg(feature = "socket")]
use tracing::{info, warn};

use crate::config::SyncConfig;

/// Everything a watcher needs from its environment: the change stream client
/// (or its absence) and the default watch settings.
///
/// Cloning is cheap and clones share the client and its registry.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
   client: ChangeStreamClient,
   config: SyncConfig,
}

impl RuntimeContext {
   pub fn new(client: ChangeStreamClient) -> Self {
      Self {
         client,
         config: SyncConfig::default(),
      }
   }

   /// A context over `transport` with `config`'s client settings.
   pub fn with_transport(transport: Arc<dyn ChangeTransport>, config: SyncConfig) -> Self {
      let client = ChangeStreamClient::new(transport, config.client.clone());
      Self { client, config }
   }

   /// A context without realtime: watchers report `connected: false` and
   /// rely on polling or manual refresh.
   pub fn unavailable() -> Self {
      Self::new(ChangeStreamClient::unavailable(Default::default()))
   }

   /// Connects to the hosted provider using `SUPABASE_URL` and
   /// `SUPABASE_ANON_KEY`.
   ///
   /// Missing or invalid credentials yield an unavailable context with a
   /// logged warning; this never fails. Must be called inside a tokio
   /// runtime.
   #[cfg(feature = "socket")]
   pub fn from_env(config: SyncConfig) -> Self {
      let socket = realtime_socket::SocketConfig::from_env().and_then(realtime_socket::RealtimeSocket::spawn);
      match socket {
         Ok(socket) => {
            info!("Realtime transport initialized");
            Self::with_transport(socket, config)
         }
         Err(e) => {
            warn!(error = %e, "Realtime transport unavailable");
            Self::unavailable().with_config(config)
         }
      }
   }

   /// Replaces the default watch settings. The client is kept as is.
   pub fn with_config(mut self, config: SyncConfig) -> Self {
      self.config = config;
      self
   }

   /// Whether the change stream transport is initialized.
   pub fn is_realtime_available(&self) -> bool {
      self.client.is_available()
   }

   pub fn client(&self) -> &ChangeStreamClient {
      &self.client
   }

   pub fn registry(&self) -> &SubscriptionRegistry {
      self.client.registry()
   }

   pub fn config(&self) -> &SyncConfig {
      &self.config
   }

   /// Closes every subscription opened through this context, such as on
   /// sign-out. Watchers stay alive and report `connected: false`; returns
   /// the number of subscriptions closed.
   pub fn release_all(&self) -> usize {
      self.client.registry().release_everything()
   }
}
