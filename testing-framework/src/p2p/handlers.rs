// Per-command message handlers of a peer connection.
//
// A handler runs on the receive task after the message has been logged. It
// cannot block; anything it wants to send goes into `Replies` and is written
// in order right after it returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regtest_common::p2p::NetworkMessage;

pub type Handler = Arc<dyn Fn(&NetworkMessage, &mut Replies) + Send + Sync>;

/// Messages queued by a handler.
#[derive(Debug, Default)]
pub struct Replies {
    messages: Vec<NetworkMessage>,
}

impl Replies {
    pub fn send(&mut self, message: NetworkMessage) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<NetworkMessage> {
        self.messages
    }
}

/// Flags shared between a connection and its default handlers.
#[derive(Debug)]
pub struct PeerFlags {
    pub auto_pong: AtomicBool,
    pub verack_received: AtomicBool,
}

impl PeerFlags {
    pub fn new(auto_pong: bool) -> Self {
        Self {
            auto_pong: AtomicBool::new(auto_pong),
            verack_received: AtomicBool::new(false),
        }
    }
}

pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Handshake and liveness handlers every connection starts with:
    /// `version` is acknowledged, `verack` completes the handshake and `ping`
    /// is answered while `auto_pong` is set.
    pub fn with_defaults(flags: Arc<PeerFlags>) -> Self {
        let mut registry = Self::empty();

        registry.set("version", |_, replies| replies.send(NetworkMessage::Verack));

        let verack_flags = flags.clone();
        registry.set("verack", move |_, _| {
            verack_flags.verack_received.store(true, Ordering::SeqCst);
        });

        registry.set("ping", move |message, replies| {
            if let NetworkMessage::Ping(nonce) = message {
                if flags.auto_pong.load(Ordering::SeqCst) {
                    replies.send(NetworkMessage::Pong(*nonce));
                }
            }
        });

        registry
    }

    /// Install `handler` for `command`, returning the one it replaces.
    pub fn set<F>(&mut self, command: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&NetworkMessage, &mut Replies) + Send + Sync + 'static,
    {
        self.handlers.insert(command.to_string(), Arc::new(handler))
    }

    pub fn remove(&mut self, command: &str) -> Option<Handler> {
        self.handlers.remove(command)
    }

    pub fn get(&self, command: &str) -> Option<Handler> {
        self.handlers.get(command).cloned()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

/// Run the handler of `message`'s command, if any, and collect its replies.
pub fn dispatch(handler: Option<Handler>, message: &NetworkMessage) -> Vec<NetworkMessage> {
    let mut replies = Replies::default();
    if let Some(handler) = handler {
        handler(message, &mut replies);
    }
    replies.into_messages()
}
