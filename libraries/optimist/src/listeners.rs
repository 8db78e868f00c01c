use std::rc::Rc;

use slotmap::SlotMap;

slotmap::new_key_type! {
    /// Handle returned when registering a listener; pass it back to unregister.
    pub struct ListenerKey;
}

/// A set of callbacks notified with a borrowed argument.
///
/// Callbacks are cloned out before being called, so a listener may register or
/// unregister other listeners without tripping a `RefCell` borrow on its owner.
pub struct Listeners<A: ?Sized> {
    callbacks: SlotMap<ListenerKey, Rc<dyn Fn(&A)>>,
}

impl<A: ?Sized> Default for Listeners<A> {
    fn default() -> Self {
        Self {
            callbacks: SlotMap::with_key(),
        }
    }
}

impl<A: ?Sized> Listeners<A> {
    pub fn register(&mut self, callback: impl Fn(&A) + 'static) -> ListenerKey {
        self.callbacks.insert(Rc::new(callback))
    }

    pub fn unregister(&mut self, key: ListenerKey) -> bool {
        self.callbacks.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Clone the current callbacks so they can be invoked after the owner's borrow ends.
    pub fn snapshot(&self) -> Vec<Rc<dyn Fn(&A)>> {
        self.callbacks.values().cloned().collect()
    }
}

pub fn notify_all<A: ?Sized>(callbacks: Vec<Rc<dyn Fn(&A)>>, arg: &A) {
    for callback in callbacks {
        callback(arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn unregistered_listener_is_not_called() {
        let hits = Rc::new(Cell::new(0));
        let mut listeners: Listeners<u32> = Listeners::default();

        let first = {
            let hits = hits.clone();
            listeners.register(move |n| hits.set(hits.get() + n))
        };
        {
            let hits = hits.clone();
            listeners.register(move |n| hits.set(hits.get() + n * 10));
        }

        notify_all(listeners.snapshot(), &1);
        assert_eq!(hits.get(), 11);

        assert!(listeners.unregister(first));
        assert!(!listeners.unregister(first));
        notify_all(listeners.snapshot(), &1);
        assert_eq!(hits.get(), 21);
        assert_eq!(listeners.len(), 1);
    }
}
