//! State-change notification fan-out.
//!
//! A subscriber is a closure `(State) -> void`, held in an ordered list
//! behind its own read/write lock, deliberately distinct from the
//! Controller's own mutex: subscribers are invoked with that lock held for
//! reading only, never with the controller mutex held, so a subscriber that
//! calls back into the controller cannot deadlock it.

use std::sync::RwLock;

use crate::state::StateEvent;

pub type Subscriber = Box<dyn Fn(&StateEvent) + Send + Sync>;

#[derive(Default)]
pub struct Notifier {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier { subscribers: RwLock::new(Vec::new()) }
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    /// Invokes every subscriber once, in subscription order. Must never be
    /// called while the controller's own mutex is held.
    pub fn notify(&self, event: &StateEvent) {
        let subscribers = self.subscribers.read().unwrap();
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Code, State};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn every_subscriber_is_invoked_once_per_notify() {
        let notifier = Notifier::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let (a, b) = (count_a.clone(), count_b.clone());
        notifier.subscribe(Box::new(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        notifier.subscribe(Box::new(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        }));

        let event = StateEvent::from_state(&State::clean(), None);
        notifier.notify(&event);
        notifier.notify(&event);

        assert_eq!(count_a.load(Ordering::SeqCst), 2);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fresh_notifier_has_no_subscribers() {
        assert!(Notifier::new().is_empty());
        let _ = Code::Clean;
    }
}
