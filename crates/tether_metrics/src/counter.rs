//! Named counters for tracking engine events

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Counter {
    counters: HashMap<String, usize>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    pub fn increment(&mut self, name: &str, value: usize) {
        if let Some(slot) = self.counters.get_mut(name) {
            *slot += value;
        } else {
            self.counters.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> usize {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Sorted copy of every counter, for reporting off the engine thread.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut entries: Vec<_> = self
            .counters
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        entries.sort();
        entries
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_sorted_by_name() {
        let mut counter = Counter::new();
        counter.increment("references.released", 3);
        counter.increment("modules.compiled", 1);
        counter.increment("references.released", 1);

        assert_eq!(
            counter.snapshot(),
            vec![
                ("modules.compiled".to_string(), 1),
                ("references.released".to_string(), 4),
            ]
        );
    }
}
