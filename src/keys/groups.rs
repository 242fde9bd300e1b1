// Key Groups
//
// Groups carry shared policy defaults applied to member keys at admission
// time. Membership is a key -> group assignment; a key belongs to at most
// one group.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use crate::persist::{GroupsSnapshot, StateFile};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: u64,
    /// Overrides the global per-key rate limit for members when set.
    #[serde(default)]
    pub default_rate_limit: Option<u32>,
    #[serde(default)]
    pub default_allowed_tools: Vec<String>,
    #[serde(default)]
    pub default_scopes: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

pub struct KeyGroupManager {
    groups: RwLock<HashMap<String, KeyGroup>>,
    assignments: RwLock<HashMap<String, String>>,
    clock: SharedClock,
    persist: Option<Arc<StateFile>>,
}

impl KeyGroupManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            clock,
            persist: None,
        }
    }

    pub fn with_persistence(mut self, persist: Arc<StateFile>) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn create_group(
        &self,
        name: &str,
        description: &str,
        default_rate_limit: Option<u32>,
        default_allowed_tools: Vec<String>,
        default_scopes: Vec<String>,
    ) -> KeyGroup {
        let group = KeyGroup {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: self.clock.now_ms(),
            default_rate_limit,
            default_allowed_tools,
            default_scopes,
            metadata: HashMap::new(),
        };
        self.groups.write().insert(group.id.clone(), group.clone());
        info!(group = %group.id, name = %group.name, "created key group");
        self.save();
        group
    }

    pub fn get_group(&self, group_id: &str) -> Option<KeyGroup> {
        self.groups.read().get(group_id).cloned()
    }

    pub fn list_groups(&self) -> Vec<KeyGroup> {
        self.groups.read().values().cloned().collect()
    }

    /// Delete a group and drop every membership that referenced it.
    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        let removed = self.groups.write().remove(group_id).is_some();
        if !removed {
            return Err(GateError::NotFound(format!("group {}", group_id)));
        }
        self.assignments.write().retain(|_, g| g != group_id);
        self.save();
        Ok(())
    }

    /// Assign a key to a group, replacing any previous assignment.
    pub fn assign_key(&self, key: &str, group_id: &str) -> Result<()> {
        if !self.groups.read().contains_key(group_id) {
            return Err(GateError::NotFound(format!("group {}", group_id)));
        }
        self.assignments
            .write()
            .insert(key.to_string(), group_id.to_string());
        self.save();
        Ok(())
    }

    pub fn unassign_key(&self, key: &str) -> bool {
        let removed = self.assignments.write().remove(key).is_some();
        if removed {
            self.save();
        }
        removed
    }

    /// The group a key belongs to, if any.
    pub fn group_of(&self, key: &str) -> Option<KeyGroup> {
        let group_id = self.assignments.read().get(key).cloned()?;
        self.get_group(&group_id)
    }

    pub fn members(&self, group_id: &str) -> Vec<String> {
        self.assignments
            .read()
            .iter()
            .filter(|(_, g)| g.as_str() == group_id)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Persisted layout: `{groups: [...], assignments: [[key, groupId], ...]}`.
    pub fn snapshot(&self) -> GroupsSnapshot {
        GroupsSnapshot {
            groups: self.groups.read().values().cloned().collect(),
            assignments: self
                .assignments
                .read()
                .iter()
                .map(|(k, g)| (k.clone(), g.clone()))
                .collect(),
        }
    }

    pub fn load_snapshot(&self, snapshot: GroupsSnapshot) {
        let mut groups = self.groups.write();
        let mut assignments = self.assignments.write();
        groups.clear();
        assignments.clear();
        for group in snapshot.groups {
            groups.insert(group.id.clone(), group);
        }
        for (key, group_id) in snapshot.assignments {
            assignments.insert(key, group_id);
        }
    }

    fn save(&self) {
        if let Some(persist) = &self.persist {
            persist.save_groups(&self.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> KeyGroupManager {
        KeyGroupManager::new(ManualClock::shared(1_000))
    }

    #[test]
    fn test_create_and_assign() {
        let mgr = manager();
        let group = mgr.create_group("pro", "paid tier", Some(100), vec![], vec!["tools".into()]);

        mgr.assign_key("tg_a", &group.id).unwrap();
        mgr.assign_key("tg_b", &group.id).unwrap();

        assert_eq!(mgr.group_of("tg_a").unwrap().name, "pro");
        let mut members = mgr.members(&group.id);
        members.sort();
        assert_eq!(members, vec!["tg_a", "tg_b"]);
    }

    #[test]
    fn test_assign_unknown_group() {
        let mgr = manager();
        assert!(matches!(
            mgr.assign_key("tg_a", "missing"),
            Err(GateError::NotFound(_))
        ));
    }

    #[test]
    fn test_reassignment_replaces() {
        let mgr = manager();
        let g1 = mgr.create_group("a", "", None, vec![], vec![]);
        let g2 = mgr.create_group("b", "", None, vec![], vec![]);
        mgr.assign_key("tg_a", &g1.id).unwrap();
        mgr.assign_key("tg_a", &g2.id).unwrap();
        assert_eq!(mgr.group_of("tg_a").unwrap().id, g2.id);
        assert!(mgr.members(&g1.id).is_empty());
    }

    #[test]
    fn test_delete_group_drops_members() {
        let mgr = manager();
        let group = mgr.create_group("a", "", None, vec![], vec![]);
        mgr.assign_key("tg_a", &group.id).unwrap();
        mgr.delete_group(&group.id).unwrap();
        assert!(mgr.group_of("tg_a").is_none());
        assert!(matches!(mgr.delete_group(&group.id), Err(GateError::NotFound(_))));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mgr = manager();
        let group = mgr.create_group("a", "d", Some(5), vec!["t".into()], vec![]);
        mgr.assign_key("tg_a", &group.id).unwrap();

        let snapshot = mgr.snapshot();
        let restored = manager();
        restored.load_snapshot(snapshot);
        assert_eq!(restored.list_groups().len(), 1);
        assert_eq!(restored.group_of("tg_a").unwrap().id, group.id);
    }
}
