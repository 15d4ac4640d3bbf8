//! # Listener Registry
//!
//! Per-endpoint handlers keyed by what an inbound message is: its kind, or
//! for events, the tag of the event payload. Each topic holds at most one
//! plain handler and at most one replying handler; registering replaces.
//! A replying handler's reply is sent back on the same endpoint.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::RwLock;

use linkwire::Message;
use linkwire::MessageKind;
use linkwire::Payload;
use linkwire::PayloadType;
use tracing::error;
use tracing::warn;

use crate::endpoint::Outbox;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every message of a kind. `Kind(MessageKind::Event)` sees all events.
    Kind(MessageKind),
    /// Events whose payload carries this tag.
    Event(String),
}

impl Topic {
    /// The most specific topic of `message`.
    pub fn of(message: &Message) -> Self {
        match message.event_tag() {
            Some(tag) => Self::Event(tag.to_string()),
            None => Self::Kind(message.kind()),
        }
    }

    pub fn event<T: PayloadType>() -> Self {
        Self::Event(T::TAG.to_string())
    }
}

impl From<MessageKind> for Topic {
    fn from(kind: MessageKind) -> Self {
        Self::Kind(kind)
    }
}

type StaticFn = Arc<dyn Fn(&Message) + Send + Sync>;
type ReplyFn = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

pub struct Listeners {
    outbox: Arc<Outbox>,
    statics: RwLock<HashMap<Topic, StaticFn>>,
    replies: RwLock<HashMap<Topic, ReplyFn>>,
}

impl Listeners {
    pub(crate) fn new(outbox: Arc<Outbox>) -> Self {
        Self {
            outbox,
            statics: RwLock::new(HashMap::new()),
            replies: RwLock::new(HashMap::new()),
        }
    }

    pub fn on<F>(&self, topic: impl Into<Topic>, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        write(&self.statics).insert(topic.into(), Arc::new(handler));
    }

    pub fn on_reply<F>(&self, topic: impl Into<Topic>, handler: F)
    where
        F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    {
        write(&self.replies).insert(topic.into(), Arc::new(handler));
    }

    /// Listens for events carrying `T`. Events that fail to decode are
    /// logged and skipped.
    pub fn on_event<T, F>(&self, handler: F)
    where
        T: PayloadType,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on(Topic::event::<T>(), move |message| {
            if let Some(body) = event_body::<T>(message) {
                handler(body);
            }
        });
    }

    /// Listens for events carrying `T` and answers with an event carrying `R`.
    pub fn on_event_reply<T, R, F>(&self, handler: F)
    where
        T: PayloadType,
        R: PayloadType,
        F: Fn(T) -> Option<R> + Send + Sync + 'static,
    {
        self.on_reply(Topic::event::<T>(), move |message| {
            let reply = handler(event_body::<T>(message)?)?;
            match Payload::pack(&reply) {
                Ok(payload) => Some(Message::Event(payload)),
                Err(e) => {
                    warn!(tag = R::TAG, error = %e, "failed to encode event reply");
                    None
                }
            }
        });
    }

    /// Removes both handlers of `topic`. Returns true if any was registered.
    pub fn unregister(&self, topic: &Topic) -> bool {
        let had_static = write(&self.statics).remove(topic).is_some();
        let had_reply = write(&self.replies).remove(topic).is_some();
        had_static || had_reply
    }

    pub fn len(&self) -> usize {
        read(&self.statics).len() + read(&self.replies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        write(&self.statics).clear();
        write(&self.replies).clear();
    }

    pub(crate) fn dispatch(&self, message: &Message) {
        let topic = Topic::of(message);
        self.deliver(&topic, message);
        if matches!(topic, Topic::Event(_)) {
            self.deliver(&Topic::Kind(MessageKind::Event), message);
        }
    }

    fn deliver(&self, topic: &Topic, message: &Message) {
        let token = self.outbox.token();

        let reply = read(&self.replies).get(topic).cloned();
        if let Some(reply) = reply {
            match std::panic::catch_unwind(AssertUnwindSafe(|| reply(message))) {
                Ok(Some(answer)) => {
                    if let Err(e) = self.outbox.send(&answer) {
                        warn!(token = %token, topic = ?topic, error = %e, "failed to send listener reply");
                    }
                }
                Ok(None) => {}
                Err(_) => error!(token = %token, topic = ?topic, "reply listener panicked"),
            }
        }

        let handler = read(&self.statics).get(topic).cloned();
        if let Some(handler) = handler {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(token = %token, topic = ?topic, "listener panicked");
            }
        }
    }
}

fn event_body<T: PayloadType>(message: &Message) -> Option<T> {
    let Message::Event(payload) = message else {
        return None;
    };
    match payload.unpack::<T>() {
        Ok(body) => Some(body),
        Err(e) => {
            warn!(tag = T::TAG, error = %e, "dropping undecodable event");
            None
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}
