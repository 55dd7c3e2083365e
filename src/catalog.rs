//! Read-only test catalog contract.
//!
//! The engine never parses test definition files itself; a separately
//! reloadable repository watcher supplies resolved test metadata through
//! this interface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Actor requirement declared by a test definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestActorInfo {
    pub actor_type: String,
    /// Tag predicate expressions a matching actor must satisfy.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Segment indices this actor definition declares.
    #[serde(default)]
    pub segments: Vec<usize>,
}

/// Resolved metadata for one test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestInfo {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub data_driven: bool,
    pub actors: Vec<TestActorInfo>,
}

impl TestInfo {
    /// Highest segment index declared across this test's actor definitions.
    pub fn max_segment_index(&self) -> usize {
        self.actors
            .iter()
            .flat_map(|actor| actor.segments.iter().copied())
            .max()
            .unwrap_or(0)
    }

    /// Union of declared segment indices, sorted.
    pub fn segments(&self) -> Vec<usize> {
        let mut segments: Vec<usize> = self
            .actors
            .iter()
            .flat_map(|actor| actor.segments.iter().copied())
            .collect();
        segments.sort_unstable();
        segments.dedup();
        segments
    }
}

/// Resolver over the current test repository snapshot.
#[async_trait]
pub trait TestCatalog: Send + Sync {
    /// Resolve a selected `{name, path}` pair, `None` when absent.
    async fn resolve_test(&self, name: &str, path: &str) -> Option<TestInfo>;
}

/// Catalog backed by a fixed in-memory map, for tests and embedders that
/// manage their own reloading.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    tests: Arc<Mutex<HashMap<(String, String), TestInfo>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, test: TestInfo) {
        let mut guard = self.tests.lock().expect("catalog poisoned");
        guard.insert((test.name.clone(), test.path.clone()), test);
    }
}

#[async_trait]
impl TestCatalog for StaticCatalog {
    async fn resolve_test(&self, name: &str, path: &str) -> Option<TestInfo> {
        let guard = self.tests.lock().expect("catalog poisoned");
        guard.get(&(name.to_string(), path.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_segment_index_spans_actor_definitions() {
        let test = TestInfo {
            name: "login".to_string(),
            path: "suite/auth".to_string(),
            tags: vec![],
            data_driven: false,
            actors: vec![
                TestActorInfo {
                    actor_type: "web".to_string(),
                    tags: vec![],
                    segments: vec![0, 1],
                },
                TestActorInfo {
                    actor_type: "api".to_string(),
                    tags: vec![],
                    segments: vec![0, 1, 2, 3],
                },
            ],
        };
        assert_eq!(test.max_segment_index(), 3);
        assert_eq!(test.segments(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn static_catalog_resolves_by_name_and_path() {
        let catalog = StaticCatalog::new();
        catalog.insert(TestInfo {
            name: "login".to_string(),
            path: "suite/auth".to_string(),
            tags: vec![],
            data_driven: false,
            actors: vec![],
        });

        assert!(catalog.resolve_test("login", "suite/auth").await.is_some());
        assert!(catalog.resolve_test("login", "suite/other").await.is_none());
        assert!(catalog.resolve_test("logout", "suite/auth").await.is_none());
    }
}
