// Key Hierarchy
//
// Parent/child key relations with bounded depth and fanout. Relations are
// stored in id-keyed maps; traversals walk ids, never pointers. Removing a
// relation removes the whole subtree beneath it.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRelation {
    pub child_key: String,
    pub parent_key: String,
    /// Maximum credits the child may consume. Zero means unlimited up to
    /// the parent's actual balance.
    pub credit_ceiling: u64,
    pub credits_used: u64,
    pub inherit_scopes: bool,
    pub inherit_acl: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub max_depth: usize,
    pub max_children: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_children: 50,
        }
    }
}

pub struct KeyHierarchyManager {
    /// child key -> relation. A child has exactly one parent.
    relations: RwLock<HashMap<String, KeyRelation>>,
    config: HierarchyConfig,
    clock: SharedClock,
}

impl KeyHierarchyManager {
    pub fn new(config: HierarchyConfig, clock: SharedClock) -> Self {
        Self {
            relations: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn create_relation(
        &self,
        child_key: &str,
        parent_key: &str,
        credit_ceiling: u64,
        inherit_scopes: bool,
        inherit_acl: bool,
    ) -> Result<KeyRelation> {
        if child_key == parent_key {
            return Err(GateError::Validation(
                "a key cannot be its own parent".to_string(),
            ));
        }

        let mut relations = self.relations.write();
        if relations.contains_key(child_key) {
            return Err(GateError::AlreadyExists(
                "key already has a parent".to_string(),
            ));
        }

        let parent_depth = Self::depth_of(&relations, parent_key);
        if parent_depth + 1 > self.config.max_depth {
            return Err(GateError::CapacityExceeded(format!(
                "hierarchy depth limit {} reached",
                self.config.max_depth
            )));
        }

        let child_count = relations
            .values()
            .filter(|r| r.parent_key == parent_key)
            .count();
        if child_count >= self.config.max_children {
            return Err(GateError::CapacityExceeded(format!(
                "parent already has {} children",
                child_count
            )));
        }

        // Cycle guard: the parent must not descend from the child.
        if Self::ancestors_of(&relations, parent_key)
            .iter()
            .any(|a| a == child_key)
        {
            return Err(GateError::Validation(
                "relation would create a cycle".to_string(),
            ));
        }

        let relation = KeyRelation {
            child_key: child_key.to_string(),
            parent_key: parent_key.to_string(),
            credit_ceiling,
            credits_used: 0,
            inherit_scopes,
            inherit_acl,
            created_at: self.clock.now_ms(),
        };
        relations.insert(child_key.to_string(), relation.clone());
        debug!(child = child_key, parent = parent_key, "created key relation");
        Ok(relation)
    }

    /// Remove a child relation and, recursively, every relation in the
    /// subtree rooted at the child. Returns the removed child keys.
    pub fn remove_relation(&self, child_key: &str) -> Result<Vec<String>> {
        let mut relations = self.relations.write();
        if !relations.contains_key(child_key) {
            return Err(GateError::NotFound(format!("relation for {}", child_key)));
        }

        let mut removed = Vec::new();
        let mut stack = vec![child_key.to_string()];
        while let Some(key) = stack.pop() {
            relations.remove(&key);
            removed.push(key.clone());
            let children: Vec<String> = relations
                .values()
                .filter(|r| r.parent_key == key)
                .map(|r| r.child_key.clone())
                .collect();
            stack.extend(children);
        }
        Ok(removed)
    }

    pub fn get_relation(&self, child_key: &str) -> Option<KeyRelation> {
        self.relations.read().get(child_key).cloned()
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn get_ancestors(&self, key: &str) -> Vec<String> {
        Self::ancestors_of(&self.relations.read(), key)
    }

    /// Every key in the subtree below the given key.
    pub fn get_descendants(&self, key: &str) -> Vec<String> {
        let relations = self.relations.read();
        let mut result = Vec::new();
        let mut stack = vec![key.to_string()];
        while let Some(current) = stack.pop() {
            for relation in relations.values() {
                if relation.parent_key == current {
                    result.push(relation.child_key.clone());
                    stack.push(relation.child_key.clone());
                }
            }
        }
        result
    }

    pub fn get_children(&self, parent_key: &str) -> Vec<String> {
        self.relations
            .read()
            .values()
            .filter(|r| r.parent_key == parent_key)
            .map(|r| r.child_key.clone())
            .collect()
    }

    pub fn depth(&self, key: &str) -> usize {
        Self::depth_of(&self.relations.read(), key)
    }

    /// Check whether a child may spend `amount` more credits. A zero
    /// ceiling defers to the parent's live balance, supplied by the caller.
    pub fn check_credit<F>(&self, child_key: &str, amount: u64, parent_balance: F) -> Result<()>
    where
        F: Fn(&str) -> Option<u64>,
    {
        let relations = self.relations.read();
        let relation = match relations.get(child_key) {
            Some(r) => r,
            // Keys outside the hierarchy are unconstrained here.
            None => return Ok(()),
        };

        if relation.credit_ceiling > 0 {
            if relation.credits_used + amount > relation.credit_ceiling {
                return Err(GateError::PolicyDenied(format!(
                    "credit ceiling {} reached ({} used)",
                    relation.credit_ceiling, relation.credits_used
                )));
            }
        } else {
            let balance = parent_balance(&relation.parent_key).unwrap_or(0);
            if amount > balance {
                return Err(GateError::PolicyDenied(format!(
                    "parent balance {} cannot cover {}",
                    balance, amount
                )));
            }
        }
        Ok(())
    }

    /// Record credits actually consumed by a child.
    pub fn record_usage(&self, child_key: &str, amount: u64) {
        if let Some(relation) = self.relations.write().get_mut(child_key) {
            relation.credits_used += amount;
        }
    }

    pub fn relation_count(&self) -> usize {
        self.relations.read().len()
    }

    fn ancestors_of(relations: &HashMap<String, KeyRelation>, key: &str) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = key.to_string();
        while let Some(relation) = relations.get(&current) {
            ancestors.push(relation.parent_key.clone());
            current = relation.parent_key.clone();
            // Relations are cycle-free by construction; the bound is a
            // hard stop against corrupted state.
            if ancestors.len() > relations.len() {
                break;
            }
        }
        ancestors
    }

    fn depth_of(relations: &HashMap<String, KeyRelation>, key: &str) -> usize {
        Self::ancestors_of(relations, key).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager(max_depth: usize, max_children: usize) -> KeyHierarchyManager {
        KeyHierarchyManager::new(
            HierarchyConfig {
                max_depth,
                max_children,
            },
            ManualClock::shared(1_000),
        )
    }

    #[test]
    fn test_create_and_walk() {
        let mgr = manager(5, 10);
        mgr.create_relation("b", "a", 0, true, false).unwrap();
        mgr.create_relation("c", "b", 0, true, false).unwrap();

        assert_eq!(mgr.get_ancestors("c"), vec!["b", "a"]);
        assert_eq!(mgr.depth("c"), 2);
        let mut descendants = mgr.get_descendants("a");
        descendants.sort();
        assert_eq!(descendants, vec!["b", "c"]);
    }

    #[test]
    fn test_self_parent_rejected() {
        let mgr = manager(5, 10);
        assert!(mgr.create_relation("a", "a", 0, false, false).is_err());
    }

    #[test]
    fn test_duplicate_child_rejected() {
        let mgr = manager(5, 10);
        mgr.create_relation("b", "a", 0, false, false).unwrap();
        assert!(matches!(
            mgr.create_relation("b", "x", 0, false, false),
            Err(GateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mgr = manager(2, 10);
        mgr.create_relation("b", "a", 0, false, false).unwrap();
        mgr.create_relation("c", "b", 0, false, false).unwrap();
        assert!(matches!(
            mgr.create_relation("d", "c", 0, false, false),
            Err(GateError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_fanout_limit() {
        let mgr = manager(5, 2);
        mgr.create_relation("b", "a", 0, false, false).unwrap();
        mgr.create_relation("c", "a", 0, false, false).unwrap();
        assert!(matches!(
            mgr.create_relation("d", "a", 0, false, false),
            Err(GateError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_cycle_guard() {
        let mgr = manager(5, 10);
        mgr.create_relation("b", "a", 0, false, false).unwrap();
        mgr.create_relation("c", "b", 0, false, false).unwrap();
        // "a" descends from nothing, but making "a" a child of "c" would
        // close the loop a -> b -> c -> a.
        assert!(mgr.create_relation("a", "c", 0, false, false).is_err());
    }

    #[test]
    fn test_cascading_removal() {
        let mgr = manager(5, 10);
        mgr.create_relation("b", "a", 0, false, false).unwrap();
        mgr.create_relation("c", "b", 0, false, false).unwrap();
        mgr.create_relation("d", "c", 0, false, false).unwrap();

        let mut removed = mgr.remove_relation("b").unwrap();
        removed.sort();
        assert_eq!(removed, vec!["b", "c", "d"]);
        assert_eq!(mgr.relation_count(), 0);
    }

    #[test]
    fn test_ceiling_enforcement() {
        let mgr = manager(5, 10);
        mgr.create_relation("b", "a", 100, false, false).unwrap();

        assert!(mgr.check_credit("b", 60, |_| None).is_ok());
        mgr.record_usage("b", 60);
        assert!(mgr.check_credit("b", 40, |_| None).is_ok());
        assert!(mgr.check_credit("b", 41, |_| None).is_err());
    }

    #[test]
    fn test_zero_ceiling_uses_parent_balance() {
        let mgr = manager(5, 10);
        mgr.create_relation("b", "a", 0, false, false).unwrap();

        assert!(mgr.check_credit("b", 50, |_| Some(100)).is_ok());
        assert!(mgr.check_credit("b", 150, |_| Some(100)).is_err());
        // Keys outside the hierarchy are not constrained.
        assert!(mgr.check_credit("z", 1_000, |_| Some(0)).is_ok());
    }
}
