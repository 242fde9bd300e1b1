// Request Validation
//
// Envelope-level checks on incoming JSON-RPC requests plus pluggable
// per-method rules. Errors accumulate; any failing rule makes the request
// invalid.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Enforce exact `jsonrpc: "2.0"` and string `method`.
    pub strict: bool,
    pub max_payload_bytes: usize,
    /// When set, only these methods are accepted.
    pub allowed_methods: Option<Vec<String>>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            strict: true,
            max_payload_bytes: 1_048_576,
            allowed_methods: None,
        }
    }
}

/// A custom validation rule. Returns `None` on pass or an error string.
type RuleCheck = Box<dyn Fn(&Value) -> Option<String> + Send + Sync>;

struct CustomRule {
    name: String,
    /// Method this rule is scoped to; `None` runs it for every method.
    method: Option<String>,
    enabled: bool,
    check: RuleCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub struct RequestValidator {
    rules: RwLock<Vec<CustomRule>>,
    config: ValidatorConfig,
}

impl RequestValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn add_rule<F>(&self, name: &str, method: Option<&str>, check: F)
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.rules.write().push(CustomRule {
            name: name.to_string(),
            method: method.map(|m| m.to_string()),
            enabled: true,
            check: Box::new(check),
        });
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        let mut found = false;
        for rule in rules.iter_mut().filter(|r| r.name == name) {
            rule.enabled = enabled;
            found = true;
        }
        found
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn validate(&self, request: &Value) -> ValidationOutcome {
        let mut errors = Vec::new();

        let obj = match request.as_object() {
            Some(obj) => obj,
            None => {
                return ValidationOutcome {
                    valid: false,
                    errors: vec!["expected JSON object".to_string()],
                };
            }
        };

        if self.config.strict {
            match obj.get("jsonrpc") {
                Some(Value::String(v)) if v == "2.0" => {}
                _ => errors.push("jsonrpc must be the exact string \"2.0\"".to_string()),
            }
            match obj.get("method") {
                Some(Value::String(_)) => {}
                _ => errors.push("method must be a string".to_string()),
            }
        }

        // id, when present, must be a string, number or null.
        if let Some(id) = obj.get("id") {
            if !(id.is_string() || id.is_number() || id.is_null()) {
                errors.push("id must be a string, number or null".to_string());
            }
        }

        let size = serde_json::to_vec(request).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > self.config.max_payload_bytes {
            errors.push(format!(
                "payload of {} bytes exceeds limit of {}",
                size, self.config.max_payload_bytes
            ));
        }

        let method = obj.get("method").and_then(|m| m.as_str()).unwrap_or("");
        if let Some(allowed) = &self.config.allowed_methods {
            if !method.is_empty() && !allowed.iter().any(|m| m == method) {
                errors.push(format!("method {} is not allowed", method));
            }
        }

        for rule in self.rules.read().iter() {
            if !rule.enabled {
                continue;
            }
            if let Some(scope) = &rule.method {
                if scope != method {
                    continue;
                }
            }
            if let Some(message) = (rule.check)(request) {
                errors.push(format!("{}: {}", rule.name, message));
            }
        }

        ValidationOutcome {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> RequestValidator {
        RequestValidator::new(ValidatorConfig::default())
    }

    fn valid_request() -> Value {
        json!({"jsonrpc": "2.0", "method": "tools/call", "id": 1, "params": {}})
    }

    #[test]
    fn test_accepts_well_formed() {
        let outcome = validator().validate(&valid_request());
        assert!(outcome.valid, "{:?}", outcome.errors);
    }

    #[test]
    fn test_rejects_non_object() {
        let outcome = validator().validate(&json!([1, 2]));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors, vec!["expected JSON object"]);
    }

    #[test]
    fn test_strict_envelope_checks() {
        let v = validator();
        let outcome = v.validate(&json!({"jsonrpc": "1.0", "method": "m"}));
        assert!(!outcome.valid);

        let outcome = v.validate(&json!({"jsonrpc": "2.0", "method": 5}));
        assert!(!outcome.valid);

        // Errors accumulate rather than short-circuiting.
        let outcome = v.validate(&json!({"id": {"bad": true}}));
        assert!(outcome.errors.len() >= 3);
    }

    #[test]
    fn test_non_strict_skips_envelope() {
        let v = RequestValidator::new(ValidatorConfig {
            strict: false,
            ..Default::default()
        });
        let outcome = v.validate(&json!({"method": "m"}));
        assert!(outcome.valid);
    }

    #[test]
    fn test_id_forms() {
        let v = validator();
        for id in [json!("abc"), json!(7), json!(null)] {
            let mut req = valid_request();
            req["id"] = id;
            assert!(v.validate(&req).valid);
        }
        let mut req = valid_request();
        req["id"] = json!([1]);
        assert!(!v.validate(&req).valid);
    }

    #[test]
    fn test_payload_bound() {
        let v = RequestValidator::new(ValidatorConfig {
            max_payload_bytes: 100,
            ..Default::default()
        });
        let mut req = valid_request();
        req["params"] = json!({"blob": "x".repeat(200)});
        let outcome = v.validate(&req);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("exceeds limit"));
    }

    #[test]
    fn test_allowed_methods() {
        let v = RequestValidator::new(ValidatorConfig {
            allowed_methods: Some(vec!["tools/call".to_string()]),
            ..Default::default()
        });
        assert!(v.validate(&valid_request()).valid);

        let mut req = valid_request();
        req["method"] = json!("admin/keys");
        assert!(!v.validate(&req).valid);
    }

    #[test]
    fn test_custom_rules_scoped_and_toggled() {
        let v = validator();
        v.add_rule("require-params", Some("tools/call"), |req| {
            if req.get("params").map(|p| p.is_object()).unwrap_or(false) {
                None
            } else {
                Some("params object required".to_string())
            }
        });
        v.add_rule("global-noop", None, |_| None);

        assert!(v.validate(&valid_request()).valid);

        let mut req = valid_request();
        req.as_object_mut().unwrap().remove("params");
        let outcome = v.validate(&req);
        assert!(!outcome.valid);
        assert!(outcome.errors[0].starts_with("require-params"));

        // Different method: the scoped rule is skipped.
        req["method"] = json!("other");
        assert!(v.validate(&req).valid);

        // Disabled rules are skipped.
        req["method"] = json!("tools/call");
        assert!(v.set_rule_enabled("require-params", false));
        assert!(v.validate(&req).valid);
    }
}
