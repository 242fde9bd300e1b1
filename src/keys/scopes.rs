// Scope Management
//
// Scopes form an include graph that may contain cycles; resolution is a
// depth-first expansion with a visited set. Keys hold permanent scopes plus
// temporary grants with a hard expiry. Tool requirements are a disjunction:
// holding any one required scope grants access.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Wildcard scope granting access to every scoped tool.
pub const WILDCARD_SCOPE: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Scopes transitively granted by this one.
    #[serde(default)]
    pub includes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct KeyScopes {
    permanent: HashSet<String>,
    /// scope -> expiry timestamp (ms). Expired entries are dropped lazily.
    temporary: HashMap<String, u64>,
}

/// Access decision with a human-readable reason.
#[derive(Debug, Clone, Serialize)]
pub struct ToolAccess {
    pub allowed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Whether tools with no required scopes are open to any key.
    pub allow_unscoped_tools: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            allow_unscoped_tools: true,
        }
    }
}

pub struct KeyScopeManager {
    definitions: RwLock<HashMap<String, ScopeDefinition>>,
    key_scopes: RwLock<HashMap<String, KeyScopes>>,
    tool_scopes: RwLock<HashMap<String, Vec<String>>>,
    config: ScopeConfig,
    clock: SharedClock,
}

impl KeyScopeManager {
    pub fn new(config: ScopeConfig, clock: SharedClock) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            key_scopes: RwLock::new(HashMap::new()),
            tool_scopes: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn define_scope(&self, name: &str, description: &str, includes: Vec<String>) -> Result<()> {
        if name.is_empty() {
            return Err(GateError::Validation("scope name is required".to_string()));
        }
        self.definitions.write().insert(
            name.to_string(),
            ScopeDefinition {
                name: name.to_string(),
                description: description.to_string(),
                includes,
            },
        );
        Ok(())
    }

    pub fn remove_scope(&self, name: &str) -> bool {
        self.definitions.write().remove(name).is_some()
    }

    pub fn list_scopes(&self) -> Vec<ScopeDefinition> {
        self.definitions.read().values().cloned().collect()
    }

    /// Grant a permanent scope to a key.
    pub fn grant(&self, key: &str, scope: &str) {
        self.key_scopes
            .write()
            .entry(key.to_string())
            .or_default()
            .permanent
            .insert(scope.to_string());
    }

    /// Grant a scope that expires at the given timestamp.
    pub fn grant_temporary(&self, key: &str, scope: &str, expires_at: u64) -> Result<()> {
        if expires_at <= self.clock.now_ms() {
            return Err(GateError::Validation(
                "temporary grant must expire in the future".to_string(),
            ));
        }
        self.key_scopes
            .write()
            .entry(key.to_string())
            .or_default()
            .temporary
            .insert(scope.to_string(), expires_at);
        Ok(())
    }

    pub fn revoke(&self, key: &str, scope: &str) {
        if let Some(scopes) = self.key_scopes.write().get_mut(key) {
            scopes.permanent.remove(scope);
            scopes.temporary.remove(scope);
        }
    }

    /// Required scopes for a tool (disjunction). An empty list makes the
    /// tool unscoped.
    pub fn set_tool_scopes(&self, tool: &str, scopes: Vec<String>) {
        if scopes.is_empty() {
            self.tool_scopes.write().remove(tool);
        } else {
            self.tool_scopes.write().insert(tool.to_string(), scopes);
        }
    }

    pub fn tool_scopes(&self, tool: &str) -> Vec<String> {
        self.tool_scopes.read().get(tool).cloned().unwrap_or_default()
    }

    /// Directly-held scopes after dropping expired temporary grants.
    pub fn direct_scopes(&self, key: &str) -> HashSet<String> {
        let now = self.clock.now_ms();
        let mut key_scopes = self.key_scopes.write();
        let scopes = match key_scopes.get_mut(key) {
            Some(s) => s,
            None => return HashSet::new(),
        };
        scopes.temporary.retain(|_, expires| *expires > now);

        let mut direct: HashSet<String> = scopes.permanent.clone();
        direct.extend(scopes.temporary.keys().cloned());
        direct
    }

    /// Effective scopes: direct scopes expanded through the include graph.
    /// Cycles are broken by the visited set.
    pub fn effective_scopes(&self, key: &str) -> HashSet<String> {
        let direct = self.direct_scopes(key);
        let definitions = self.definitions.read();

        let mut resolved = HashSet::new();
        let mut stack: Vec<String> = direct.into_iter().collect();
        while let Some(scope) = stack.pop() {
            if !resolved.insert(scope.clone()) {
                continue;
            }
            if let Some(def) = definitions.get(&scope) {
                for included in &def.includes {
                    if !resolved.contains(included) {
                        stack.push(included.clone());
                    }
                }
            }
        }
        resolved
    }

    /// Scope gate for one tool call.
    pub fn check_tool_access(&self, key: &str, tool: &str) -> ToolAccess {
        let required = self.tool_scopes(tool);
        if required.is_empty() {
            return if self.config.allow_unscoped_tools {
                ToolAccess {
                    allowed: true,
                    reason: "tool has no required scopes".to_string(),
                }
            } else {
                ToolAccess {
                    allowed: false,
                    reason: "unscoped tools are disabled".to_string(),
                }
            };
        }

        let effective = self.effective_scopes(key);
        if effective.contains(WILDCARD_SCOPE) {
            return ToolAccess {
                allowed: true,
                reason: "wildcard scope".to_string(),
            };
        }
        if let Some(matched) = required.iter().find(|s| effective.contains(*s)) {
            return ToolAccess {
                allowed: true,
                reason: format!("scope {}", matched),
            };
        }
        ToolAccess {
            allowed: false,
            reason: format!("requires one of: {}", required.join(", ")),
        }
    }

    pub fn ensure_tool_access(&self, key: &str, tool: &str) -> Result<()> {
        let access = self.check_tool_access(key, tool);
        if access.allowed {
            Ok(())
        } else {
            Err(GateError::PolicyDenied(format!(
                "tool {}: {}",
                tool, access.reason
            )))
        }
    }
}
