use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::scheduler::work::WorkItem;

/// Maps `workType` strings to their handlers. Populated once at startup.
#[derive(Default, Clone)]
pub struct WorkRegistry {
    items: HashMap<String, Arc<dyn WorkItem>>,
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("work_types", &self.work_types())
            .finish()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any earlier one for the same type.
    pub fn register(&mut self, item: impl WorkItem) -> &mut Self {
        let work_type = item.work_type().to_string();
        tracing::debug!(work_type = %work_type, "Work type registered");
        self.items.insert(work_type, Arc::new(item));
        self
    }

    pub fn with(mut self, item: impl WorkItem) -> Self {
        self.register(item);
        self
    }

    pub fn get(&self, work_type: &str) -> Result<Arc<dyn WorkItem>> {
        self.items
            .get(work_type)
            .cloned()
            .ok_or_else(|| QueueError::UnknownWorkType(work_type.to_string()))
    }

    /// Registered work types, sorted.
    pub fn work_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.items.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::scheduler::work::{WorkContext, WorkPolicy, WorkRecord};

    struct Noop(&'static str);

    #[async_trait]
    impl WorkItem for Noop {
        fn work_type(&self) -> &str {
            self.0
        }

        fn policy(&self) -> WorkPolicy {
            WorkPolicy::Singleton
        }

        async fn do_work(&self, _ctx: &mut WorkContext<'_>, _work: &WorkRecord) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_type() {
        let registry = WorkRegistry::new().with(Noop("B_WORK")).with(Noop("A_WORK"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.work_types(), vec!["A_WORK", "B_WORK"]);
        assert_eq!(registry.get("A_WORK").unwrap().policy(), WorkPolicy::Singleton);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = WorkRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("MISSING"),
            Err(QueueError::UnknownWorkType(t)) if t == "MISSING"
        ));
    }
}
