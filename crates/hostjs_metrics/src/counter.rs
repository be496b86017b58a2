//! Named counters for tracking event loop activity
//!
//! Counter names are static strings and the set is small, so a flat list
//! kept in first-use order beats hashing on every tick.

#[derive(Debug, Clone, Default)]
pub struct Counter {
    slots: Vec<(&'static str, usize)>,
}

impl Counter {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn increment(&mut self, name: &'static str, value: usize) {
        match self.slots.iter_mut().find(|(slot, _)| *slot == name) {
            Some((_, count)) => *count = count.saturating_add(value),
            None => self.slots.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> usize {
        self.slots
            .iter()
            .find(|(slot, _)| *slot == name)
            .map_or(0, |&(_, count)| count)
    }

    /// Current values in first-use order.
    pub fn snapshot(&self) -> Vec<(&'static str, usize)> {
        self.slots.clone()
    }

    pub fn reset_all(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_reset() {
        let mut counter = Counter::new();
        counter.increment("units", 1);
        counter.increment("units", 2);
        assert_eq!(counter.get("units"), 3);
        assert_eq!(counter.get("missing"), 0);

        counter.reset_all();
        assert_eq!(counter.get("units"), 0);
        assert!(counter.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_keeps_first_use_order() {
        let mut counter = Counter::new();
        counter.increment("ticks", 1);
        counter.increment("uncaught", 1);
        counter.increment("ticks", 4);
        assert_eq!(counter.snapshot(), vec![("ticks", 5), ("uncaught", 1)]);
    }

    #[test]
    fn test_saturates() {
        let mut counter = Counter::new();
        counter.increment("units", usize::MAX);
        counter.increment("units", 1);
        assert_eq!(counter.get("units"), usize::MAX);
    }
}
