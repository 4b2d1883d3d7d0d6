//! Synchronous subscriber lists, invoked on the tick thread in emit order.

use std::fmt;

/// Handle returned by [`Listeners::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

pub struct Listeners<E> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<E>)>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, callback) in &mut self.entries {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
