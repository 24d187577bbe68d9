//! In-process subscription graph and listener table.
//!
//! Edges point from child to parent: a notification published at a parent
//! also reaches every child, recursively. The graph may contain cycles and
//! self-loops; traversals visit each key once.
//!
//! Nothing here does I/O or awaits. The service keeps the registry behind a
//! synchronous mutex.

use std::collections::{HashMap, HashSet, VecDeque};

use super::listener::{ListenerId, ListenerSink};
use super::types::Notification;

#[derive(Debug, Default)]
pub struct SourceRegistry {
    /// source key -> sinks registered directly at that key
    listeners: HashMap<String, Vec<ListenerSink>>,
    /// child -> parents
    parents: HashMap<String, HashSet<String>>,
    /// parent -> children
    children: HashMap<String, HashSet<String>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, source: &str, sink: ListenerSink) {
        self.listeners.entry(source.to_string()).or_default().push(sink);
    }

    /// Remove a listener; returns whether it was registered at `source`.
    pub fn remove_listener(&mut self, source: &str, listener_id: ListenerId) -> bool {
        let Some(sinks) = self.listeners.get_mut(source) else {
            return false;
        };

        let before = sinks.len();
        sinks.retain(|s| s.id() != listener_id);
        let removed = sinks.len() != before;

        if sinks.is_empty() {
            self.listeners.remove(source);
        }
        removed
    }

    pub fn has_listeners(&self, source: &str) -> bool {
        self.listeners.get(source).is_some_and(|s| !s.is_empty())
    }

    /// Total sinks across all keys
    pub fn listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    /// Add `child -> parent`. Returns false if the edge already existed.
    pub fn subscribe(&mut self, child: &str, parent: &str) -> bool {
        let inserted = self
            .parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        inserted
    }

    /// Remove `child -> parent`. Returns false if there was no such edge.
    pub fn unsubscribe(&mut self, child: &str, parent: &str) -> bool {
        let removed = remove_edge(&mut self.parents, child, parent);
        remove_edge(&mut self.children, parent, child);
        removed
    }

    /// Remove every upstream edge of `child`; returns how many were removed.
    pub fn unsubscribe_all(&mut self, child: &str) -> usize {
        let Some(parents) = self.parents.remove(child) else {
            return 0;
        };
        for parent in &parents {
            remove_edge(&mut self.children, parent, child);
        }
        parents.len()
    }

    /// All keys a notification at `source` reaches, including `source`.
    pub fn resolve_downstream(&self, source: &str) -> HashSet<String> {
        let mut visited = traverse(&self.children, source);
        visited.insert(source.to_string());
        visited
    }

    /// All keys whose notifications reach `source`, excluding `source`
    /// itself unless a cycle leads back to it.
    pub fn resolve_upstream(&self, source: &str) -> HashSet<String> {
        traverse(&self.parents, source)
    }

    /// Enqueue `notification` into every listener downstream of `source`.
    ///
    /// Returns the number of successful enqueues. Sinks whose queue has
    /// been dropped are pruned.
    pub fn push(&mut self, source: &str, notification: &Notification) -> usize {
        let mut delivered = 0;

        for key in self.resolve_downstream(source) {
            let Some(sinks) = self.listeners.get_mut(&key) else {
                continue;
            };
            sinks.retain(|sink| {
                if sink.push(notification) {
                    delivered += 1;
                    true
                } else {
                    tracing::debug!(listener_id = %sink.id(), source_key = %key, "Pruning closed listener");
                    false
                }
            });
            if sinks.is_empty() {
                self.listeners.remove(&key);
            }
        }

        delivered
    }
}

fn remove_edge(index: &mut HashMap<String, HashSet<String>>, from: &str, to: &str) -> bool {
    let Some(set) = index.get_mut(from) else {
        return false;
    };
    let removed = set.remove(to);
    if set.is_empty() {
        index.remove(from);
    }
    removed
}

/// Breadth-first walk over `edges` starting at `origin`. The origin is only
/// included when reached again through an edge.
fn traverse(edges: &HashMap<String, HashSet<String>>, origin: &str) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([origin.to_string()]);

    while let Some(key) = queue.pop_front() {
        let Some(next) = edges.get(&key) else {
            continue;
        };
        for n in next {
            if visited.insert(n.clone()) {
                queue.push_back(n.clone());
            }
        }
    }

    visited
}
