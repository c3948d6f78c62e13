use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Completion count and cumulative run time for one work type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkStats {
    pub completed: u64,
    pub time: Duration,
}

/// Per work type completion counters, shared by the performers of one node.
#[derive(Debug, Default)]
pub struct WorkMetrics {
    stats: Mutex<HashMap<String, WorkStats>>,
}

impl WorkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, work_type: &str, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(work_type.to_string()).or_default();
        entry.completed += 1;
        entry.time += elapsed;
    }

    pub fn stats(&self, work_type: &str) -> WorkStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(work_type)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_completed(&self) -> u64 {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.completed)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_type() {
        let metrics = WorkMetrics::new();
        metrics.record("A", Duration::from_millis(10));
        metrics.record("A", Duration::from_millis(5));
        metrics.record("B", Duration::from_millis(1));

        assert_eq!(
            metrics.stats("A"),
            WorkStats {
                completed: 2,
                time: Duration::from_millis(15)
            }
        );
        assert_eq!(metrics.stats("C"), WorkStats::default());
        assert_eq!(metrics.total_completed(), 3);
    }
}
