//! Callback registries for connection lifecycle and message delivery.
//!
//! Handlers are registered at any time, stored behind mutexes and invoked
//! synchronously by whichever task observes the event. Lifecycle events fire
//! at most once per connection; the connection state machine guarantees that
//! by emitting only on a winning state transition.

use std::sync::Mutex;

use crate::message::Message;

type Handler = Box<dyn Fn() + Send + Sync + 'static>;
type MessageHandler = Box<dyn Fn(&Message) + Send + Sync + 'static>;

/// Event handler registry shared between the facade and the lifecycle tasks.
#[derive(Default)]
pub(crate) struct Events {
    connected: Mutex<Vec<Handler>>,
    closing: Mutex<Vec<Handler>>,
    closed: Mutex<Vec<Handler>>,
    message: Mutex<Vec<MessageHandler>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.connected.lock().unwrap().push(Box::new(handler));
    }

    pub fn on_closing(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.closing.lock().unwrap().push(Box::new(handler));
    }

    pub fn on_closed(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.closed.lock().unwrap().push(Box::new(handler));
    }

    pub fn on_message(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.message.lock().unwrap().push(Box::new(handler));
    }

    pub fn emit_connected(&self) {
        for handler in self.connected.lock().unwrap().iter() {
            handler();
        }
    }

    pub fn emit_closing(&self) {
        for handler in self.closing.lock().unwrap().iter() {
            handler();
        }
    }

    pub fn emit_closed(&self) {
        for handler in self.closed.lock().unwrap().iter() {
            handler();
        }
    }

    pub fn emit_message(&self, message: &Message) {
        for handler in self.message.lock().unwrap().iter() {
            handler(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let events = Events::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let log = log.clone();
            events.on_connected(move || log.lock().unwrap().push(id));
        }

        events.emit_connected();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_events_are_independent() {
        let events = Events::new();
        let closing = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        {
            let closing = closing.clone();
            events.on_closing(move || {
                closing.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let closed = closed.clone();
            events.on_closed(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }

        events.emit_closing();
        assert_eq!(closing.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_message_handler_sees_payload() {
        let events = Events::new();
        let seen = Arc::new(Mutex::new(None));

        {
            let seen = seen.clone();
            events.on_message(move |message| {
                *seen.lock().unwrap() = Some(message.clone());
            });
        }

        events.emit_message(&Message::text("ping me"));
        assert_eq!(*seen.lock().unwrap(), Some(Message::text("ping me")));
    }

    #[test]
    fn test_emit_with_no_handlers_is_noop() {
        let events = Events::new();
        events.emit_connected();
        events.emit_closing();
        events.emit_closed();
        events.emit_message(&Message::text("unheard"));
    }
}
