use std::sync::Mutex;

use crate::entry::{Entry, IndexTimestamp};
use crate::error::{Error, Result};

use super::{resolve_range, Persister, PersisterIter};

struct State<E> {
    entries: Vec<Entry<E>>,
    head_us: i64,
}

/// In-memory persister: entries held in a growable vector behind a mutex.
///
/// Timestamps may repeat between adjacent entries (`us[i] <= us[i+1]`),
/// unlike the file variant which requires strict increase. Nothing
/// survives the process; re-opening a fresh `MemoryPersister` always
/// starts at `size() == 0`.
pub struct MemoryPersister<E> {
    state: Mutex<State<E>>,
}

impl<E> Default for MemoryPersister<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> MemoryPersister<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: Vec::new(),
                head_us: 0,
            }),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> Persister<E> for MemoryPersister<E> {
    fn publish(&self, payload: E, us: i64) -> Result<IndexTimestamp> {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.entries.last() {
            if us < last.idxts.us {
                return Err(Error::InconsistentTimestamp);
            }
        }
        let index = state.entries.len() as u64;
        let idxts = IndexTimestamp::new(index, us);
        state.entries.push(Entry::new(idxts, payload));
        if us > state.head_us {
            state.head_us = us;
        }
        Ok(idxts)
    }

    fn update_head(&self, us: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let last_us = state.entries.last().map(|e| e.idxts.us).unwrap_or(i64::MIN);
        if us <= last_us || us <= state.head_us {
            return Err(Error::InconsistentTimestamp);
        }
        state.head_us = us;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().unwrap().entries.len() as u64
    }

    fn head(&self) -> i64 {
        self.state.lock().unwrap().head_us
    }

    fn last_idxts(&self) -> IndexTimestamp {
        self.state
            .lock()
            .unwrap()
            .entries
            .last()
            .map(|e| e.idxts)
            .unwrap_or_default()
    }

    fn iterate(&self, begin: u64, end: u64) -> Result<PersisterIter<E>> {
        let state = self.state.lock().unwrap();
        let (begin, end) = resolve_range(begin, end, state.entries.len() as u64)?;
        let snapshot: Vec<Entry<E>> = state.entries[begin as usize..end as usize].to_vec();
        drop(state);
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_iterate_s1() {
        let p: MemoryPersister<String> = MemoryPersister::new();
        p.publish("foo".into(), 100).unwrap();
        p.publish("bar".into(), 200).unwrap();
        p.publish("meh".into(), 300).unwrap();

        let got: Vec<_> = p.iterate(0, 3).unwrap().collect::<Result<_>>().unwrap();
        let want = vec![
            Entry::new(IndexTimestamp::new(0, 100), "foo".to_string()),
            Entry::new(IndexTimestamp::new(1, 200), "bar".to_string()),
            Entry::new(IndexTimestamp::new(2, 300), "meh".to_string()),
        ];
        assert_eq!(got, want);
        assert_eq!(p.size(), 3);
    }

    #[test]
    fn fresh_memory_persister_is_empty() {
        let p: MemoryPersister<String> = MemoryPersister::new();
        assert_eq!(p.size(), 0);
    }

    #[test]
    fn equal_timestamps_allowed_in_memory() {
        let p: MemoryPersister<i32> = MemoryPersister::new();
        p.publish(1, 150).unwrap();
        p.publish(2, 150).unwrap();
        assert_eq!(p.size(), 2);
    }

    #[test]
    fn out_of_order_publish_rejected() {
        let p: MemoryPersister<i32> = MemoryPersister::new();
        p.publish(1, 200).unwrap();
        assert!(matches!(
            p.publish(2, 100),
            Err(Error::InconsistentTimestamp)
        ));
        assert_eq!(p.size(), 1);
    }

    #[test]
    fn update_head_idempotent_only_once() {
        let p: MemoryPersister<i32> = MemoryPersister::new();
        p.publish(1, 100).unwrap();
        p.update_head(150).unwrap();
        assert_eq!(p.head(), 150);
        assert!(matches!(
            p.update_head(150),
            Err(Error::InconsistentTimestamp)
        ));
    }

    #[test]
    fn invalid_range_rejected() {
        let p: MemoryPersister<i32> = MemoryPersister::new();
        p.publish(1, 100).unwrap();
        assert!(matches!(p.iterate(0, 5), Err(Error::InvalidRange)));
        assert!(matches!(p.iterate(2, 1), Err(Error::InvalidRange)));
        let empty: Vec<_> = p.iterate(1, 1).unwrap().collect();
        assert!(empty.is_empty());
    }
}
