use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use strata_core::traits::Navigator;
use strata_core::types::Routine;

use crate::native::NativeNavigator;
use crate::sequential::SequentialNavigator;

/// Navigators keyed by the graph type they interpret.
#[derive(Clone, Default)]
pub struct NavigatorRegistry {
    navigators: HashMap<String, Arc<dyn Navigator>>,
}

impl NavigatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `native` and `sequential` navigators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(NativeNavigator::new());
        registry.register(SequentialNavigator::new());
        registry
    }

    pub fn register(&mut self, navigator: impl Navigator) {
        self.register_arc(Arc::new(navigator));
    }

    pub fn register_arc(&mut self, navigator: Arc<dyn Navigator>) {
        let graph_type = navigator.graph_type().to_string();
        debug!(%graph_type, "Registered navigator");
        self.navigators.insert(graph_type, navigator);
    }

    pub fn get(&self, graph_type: &str) -> Option<Arc<dyn Navigator>> {
        self.navigators.get(graph_type).cloned()
    }

    /// Navigator able to walk `routine`, or `None` when the graph type is
    /// unknown or the navigator rejects the definition.
    pub fn resolve(&self, routine: &Routine) -> Option<Arc<dyn Navigator>> {
        let Some(navigator) = self.get(&routine.graph_type) else {
            warn!(
                routine_id = %routine.id,
                graph_type = %routine.graph_type,
                "No navigator registered for graph type"
            );
            return None;
        };
        if !navigator.can_navigate(routine) {
            warn!(
                routine_id = %routine.id,
                graph_type = %routine.graph_type,
                "Navigator cannot walk routine definition"
            );
            return None;
        }
        Some(navigator)
    }

    /// Registered graph types, sorted.
    pub fn graph_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.navigators.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::fixtures;

    #[test]
    fn resolves_by_graph_type() {
        let registry = NavigatorRegistry::with_defaults();
        assert_eq!(registry.graph_types(), vec!["native", "sequential"]);

        let nav = registry.resolve(&fixtures::parallel_routine()).unwrap();
        assert_eq!(nav.graph_type(), "native");
        let nav = registry.resolve(&fixtures::sequential_routine()).unwrap();
        assert_eq!(nav.graph_type(), "sequential");
    }

    #[test]
    fn unknown_or_malformed_routines_do_not_resolve() {
        let registry = NavigatorRegistry::with_defaults();
        assert!(registry.resolve(&fixtures::opaque_routine()).is_none());

        let mut broken = fixtures::parallel_routine();
        broken.definition = serde_json::json!({"nodes": "nope"});
        assert!(registry.resolve(&broken).is_none());
    }
}
