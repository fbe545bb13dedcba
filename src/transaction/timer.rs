use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// A polled timer wheel. Entries are ordered by deadline in a BTreeMap;
/// the endpoint polls it on a fixed interval and dispatches expired
/// values. Cancellation goes through the id returned by `timeout`.
pub struct Timer<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            entries: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((deadline, id), value);
        }
        if let Ok(mut deadlines) = self.deadlines.write() {
            deadlines.insert(id, deadline);
        }
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.deadlines.write().ok()?.remove(&id)?;
        self.entries.write().ok()?.remove(&(deadline, id))
    }

    /// Removes and returns every entry whose deadline is at or before
    /// `now`, in deadline order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        let expired_keys: Vec<(Instant, u64)> = {
            let entries = match self.entries.read() {
                Ok(entries) => entries,
                Err(_) => return expired,
            };
            entries
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect()
        };
        if expired_keys.is_empty() {
            return expired;
        }

        if let (Ok(mut entries), Ok(mut deadlines)) =
            (self.entries.write(), self.deadlines.write())
        {
            for key in expired_keys {
                if let Some(value) = entries.remove(&key) {
                    deadlines.remove(&key.1);
                    expired.push(value);
                }
            }
        }
        expired
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Timer::new()
    }
}

#[test]
fn test_timer_wheel() {
    let timer = Timer::new();
    let now = Instant::now();

    let id = timer.timeout_at(now, "first");
    assert_eq!(timer.cancel(id), Some("first"));
    assert_eq!(timer.cancel(id), None);

    timer.timeout_at(now, "second");
    timer.timeout_at(now + Duration::from_millis(50), "third");
    timer.timeout_at(now + Duration::from_secs(60), "later");

    let expired = timer.poll(now + Duration::from_millis(100));
    assert_eq!(expired, vec!["second", "third"]);
    assert_eq!(timer.len(), 1);

    assert!(timer.poll(now + Duration::from_millis(200)).is_empty());
}
