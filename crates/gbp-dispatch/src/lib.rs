//! A named-event dispatcher.
//!
//! Grounded on the original Python project's use of `pydispatch.Dispatcher`
//! (a fixed `_events_` list plus `bind`/`emit`/`unbind`), reworked as a
//! generic pub/sub bus over a single payload type `E` so a consumer (e.g.
//! `gbp-core`) can define one `Event` enum covering every event it emits.
//!
//! Seven core events are registered automatically: `prepull`, `postpull`,
//! `published`, `predelete`, `postdelete`, `tagged`, `untagged`. Additional
//! events can be registered at runtime via [`Dispatcher::register_event`].

use std::collections::HashMap;

use thiserror::Error;

/// The fixed set of events every [`Dispatcher`] starts out with.
pub const CORE_EVENTS: &[&str] = &[
    "prepull",
    "postpull",
    "published",
    "predelete",
    "postdelete",
    "tagged",
    "untagged",
];

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("event {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("event {0:?} is not registered")]
    UnknownEvent(String),

    #[error("a subscriber to event {0:?} failed")]
    SubscriberFailed(String, #[source] BoxError),
}

/// A handle returned by [`Dispatcher::subscribe`], used to [`Dispatcher::unbind`] later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler<E> = Box<dyn FnMut(&E) -> Result<(), BoxError> + Send>;

/// A synchronous, in-process event bus keyed by event name.
pub struct Dispatcher<E> {
    subscribers: HashMap<String, Vec<(SubscriptionId, Handler<E>)>>,
    next_id: u64,
}

impl<E> Dispatcher<E> {
    /// A dispatcher with [`CORE_EVENTS`] pre-registered and no subscribers.
    pub fn new() -> Self {
        let subscribers = CORE_EVENTS
            .iter()
            .map(|&name| (name.to_string(), Vec::new()))
            .collect();
        Self {
            subscribers,
            next_id: 0,
        }
    }

    /// Register a non-core event name. Fails if it's already registered
    /// (core or previously user-registered).
    pub fn register_event(&mut self, name: impl Into<String>) -> Result<(), Error> {
        let name = name.into();
        if self.subscribers.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        self.subscribers.insert(name, Vec::new());
        Ok(())
    }

    /// Subscribe `handler` to `event`. Fails if `event` isn't registered.
    pub fn subscribe<F>(&mut self, event: &str, handler: F) -> Result<SubscriptionId, Error>
    where
        F: FnMut(&E) -> Result<(), BoxError> + Send + 'static,
    {
        let subs = self
            .subscribers
            .get_mut(event)
            .ok_or_else(|| Error::UnknownEvent(event.to_string()))?;
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        subs.push((id, Box::new(handler)));
        Ok(id)
    }

    /// Remove a subscriber if present. No-op if the event or subscription
    /// isn't found.
    pub fn unbind(&mut self, event: &str, id: SubscriptionId) {
        if let Some(subs) = self.subscribers.get_mut(event) {
            subs.retain(|(sid, _)| *sid != id);
        }
    }

    /// Deliver `payload` to every subscriber of `event`, in subscription
    /// order. All subscribers run even if one fails; the first failure is
    /// surfaced after delivery completes.
    pub fn emit(&mut self, event: &str, payload: &E) -> Result<(), Error> {
        let subs = self
            .subscribers
            .get_mut(event)
            .ok_or_else(|| Error::UnknownEvent(event.to_string()))?;

        let mut first_err = None;
        for (_, handler) in subs.iter_mut() {
            if let Err(err) = handler(payload) {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(Error::SubscriberFailed(event.to_string(), err)),
            None => Ok(()),
        }
    }

    /// Whether `event` is registered (core or user-added).
    pub fn is_registered(&self, event: &str) -> bool {
        self.subscribers.contains_key(event)
    }
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}
