//! Single-slot mailbox between one producer task and one consumer tick.
//!
//! The slot holds zero or one item. The producer never waits: an empty slot
//! takes the item as is, an occupied slot is replaced by `merge(occupant,
//! incoming)` with a compare-and-swap against the occupant it started from.
//! If the consumer drained the slot in between, the merged value is thrown
//! away and the offer starts over on the now empty slot. With exactly one
//! consumer this takes at most two attempts.

use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;

type MergeFn<T> = dyn Fn(&mut T, &T) + Send + Sync;

/// What an offer did with the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    /// The slot was empty and now holds the item.
    Stored,
    /// The item was folded into the waiting occupant.
    Merged,
}

pub struct MergeBuffer<T> {
    slot: ArcSwapOption<T>,
    merge: Box<MergeFn<T>>,
}

impl<T: Clone> MergeBuffer<T> {
    /// `merge(existing, incoming)` folds a newer item into an older one in place.
    pub fn new<F>(merge: F) -> Self
    where
        F: Fn(&mut T, &T) + Send + Sync + 'static,
    {
        Self {
            slot: ArcSwapOption::empty(),
            merge: Box::new(merge),
        }
    }

    /// Producer side. Never blocks and never drops `item`.
    pub fn offer(&self, item: T) -> Offered {
        let incoming = Arc::new(item);
        loop {
            let current = self.slot.load_full();
            let (replacement, outcome) = match &current {
                None => (Arc::clone(&incoming), Offered::Stored),
                Some(occupant) => {
                    let mut combined = T::clone(occupant);
                    (self.merge)(&mut combined, &incoming);
                    (Arc::new(combined), Offered::Merged)
                }
            };

            let previous = self.slot.compare_and_swap(&current, Some(replacement));
            let unchanged = match (&*previous, &current) {
                (None, None) => true,
                (Some(seen), Some(expected)) => Arc::ptr_eq(seen, expected),
                _ => false,
            };
            if unchanged {
                return outcome;
            }
        }
    }

    /// Consumer side. Empties the slot and hands out what was in it.
    pub fn take_if_present(&self) -> Option<T> {
        self.slot
            .swap(None)
            .map(|item| Arc::try_unwrap(item).unwrap_or_else(|shared| T::clone(&shared)))
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }
}

impl<T> fmt::Debug for MergeBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeBuffer")
            .field("occupied", &self.slot.load().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn concat() -> MergeBuffer<Vec<u32>> {
        MergeBuffer::new(|existing: &mut Vec<u32>, incoming: &Vec<u32>| {
            existing.extend_from_slice(incoming)
        })
    }

    #[test]
    fn empty_take_is_none() {
        let buffer = concat();
        assert!(buffer.is_empty());
        assert_eq!(buffer.take_if_present(), None);
    }

    #[test]
    fn second_offer_merges_into_occupant() {
        let buffer = concat();
        assert_eq!(buffer.offer(vec![1]), Offered::Stored);
        assert_eq!(buffer.offer(vec![2, 3]), Offered::Merged);

        assert_eq!(buffer.take_if_present(), Some(vec![1, 2, 3]));
        assert!(buffer.is_empty());
        assert_eq!(buffer.offer(vec![4]), Offered::Stored);
        assert_eq!(buffer.take_if_present(), Some(vec![4]));
    }

    #[test]
    fn no_offer_is_lost_under_contention() {
        const OFFERS: u32 = 20_000;

        let buffer = Arc::new(concat());
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..OFFERS {
                    buffer.offer(vec![i]);
                }
            })
        };

        let mut seen = Vec::with_capacity(OFFERS as usize);
        while !producer.is_finished() {
            if let Some(batch) = buffer.take_if_present() {
                seen.extend(batch);
            }
        }
        producer.join().unwrap();
        if let Some(batch) = buffer.take_if_present() {
            seen.extend(batch);
        }

        // Every offer shows up exactly once and in producer order.
        assert_eq!(seen, (0..OFFERS).collect::<Vec<_>>());
    }

    #[test]
    fn sums_survive_racing_consumer() {
        let buffer = Arc::new(MergeBuffer::new(|a: &mut u64, b: &u64| *a += *b));
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 1..=10_000u64 {
                    buffer.offer(i);
                }
            })
        };

        let mut total = 0u64;
        while !producer.is_finished() {
            total += buffer.take_if_present().unwrap_or(0);
        }
        producer.join().unwrap();
        total += buffer.take_if_present().unwrap_or(0);

        assert_eq!(total, 10_000 * 10_001 / 2);
    }
}
