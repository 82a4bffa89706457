//! Event coalescing
//!
//! A burst of raw change events is folded into one invalidation per
//! distinct path. Hierarchy invalidations subsume everything below them.

use std::collections::BTreeSet;

use super::events::{ChangeEvent, ChangeKind};
use crate::cache::path;

/// A single invalidation to apply to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Exact(String),
    Hierarchy(String),
}

/// Pending invalidations collected during one debounce window
#[derive(Debug, Default)]
pub struct Batch {
    exact: BTreeSet<String>,
    hierarchy: BTreeSet<String>,
    events: usize,
}

impl Batch {
    /// Fold a change event into the batch
    pub fn add_event(&mut self, event: &ChangeEvent) {
        self.events += 1;

        match event.kind {
            ChangeKind::Modified => self.add_exact(&event.path),
            ChangeKind::Created => {
                self.add_exact(&event.path);
                self.add_parent(&event.path);
            }
            ChangeKind::Deleted => {
                self.add_hierarchy(&event.path);
                self.add_parent(&event.path);
            }
            ChangeKind::Renamed => {
                self.add_hierarchy(&event.path);
                self.add_parent(&event.path);
                if let Some(old_path) = &event.old_path {
                    self.add_hierarchy(old_path);
                    self.add_parent(old_path);
                }
            }
        }
    }

    pub fn add_exact(&mut self, raw: &str) {
        self.exact.insert(path::normalize(raw));
    }

    pub fn add_hierarchy(&mut self, raw: &str) {
        self.hierarchy.insert(path::normalize(raw));
    }

    /// The parent listing changes when a child appears or disappears
    fn add_parent(&mut self, raw: &str) {
        let normalized = path::normalize(raw);
        if let Some(parent) = path::parent(&normalized) {
            self.exact.insert(parent.to_string());
        }
    }

    /// Distinct paths pending
    pub fn len(&self) -> usize {
        self.exact.len() + self.hierarchy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.hierarchy.is_empty()
    }

    /// Raw events folded in since the last drain
    pub fn event_count(&self) -> usize {
        self.events
    }

    pub fn discard(&mut self) {
        *self = Self::default();
    }

    /// Reduce to the minimal invalidation plan and reset the batch
    ///
    /// Hierarchy roots come first, in path order. A root below another root
    /// is dropped, as is any exact path at or below a root.
    pub fn drain(&mut self) -> Vec<Invalidation> {
        let batch = std::mem::take(self);

        let covered = |p: &str| -> bool {
            let mut current = Some(p);
            while let Some(candidate) = current {
                if batch.hierarchy.contains(candidate) {
                    return true;
                }
                current = path::parent(candidate);
            }
            false
        };

        let mut plan = Vec::with_capacity(batch.len());
        for root in &batch.hierarchy {
            let shadowed = path::parent(root).map(|parent| covered(parent)).unwrap_or(false);
            if !shadowed {
                plan.push(Invalidation::Hierarchy(root.clone()));
            }
        }
        for exact in &batch.exact {
            if !covered(exact) {
                plan.push(Invalidation::Exact(exact.clone()));
            }
        }
        plan
    }
}
