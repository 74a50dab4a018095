//! Ordered rule storage and first-match lookup.

use super::handler::{Handler, HandlerData};
use super::matcher::{CompiledMatcher, Matcher};
use crate::capture::CompletedRequest;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A rule to register, as built locally
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub matchers: Vec<Matcher>,
    pub handler: Handler,
    /// Number of requests this rule may handle; `None` is unlimited.
    pub times: Option<u32>,
}

/// Serializable rule description used on the control protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleData {
    pub matchers: Vec<Matcher>,
    pub handler: HandlerData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<u32>,
}

/// Handle identifying a registered rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleHandle {
    pub id: String,
}

/// The rule chosen for a request
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub id: String,
    pub handler: Handler,
}

#[derive(Debug)]
struct RegisteredRule {
    id: String,
    matchers: Vec<Matcher>,
    compiled: Vec<CompiledMatcher>,
    handler: Handler,
    remaining: Option<u32>,
}

impl RegisteredRule {
    fn accepts(&self, request: &CompletedRequest) -> bool {
        self.remaining != Some(0) && self.compiled.iter().all(|m| m.matches(request))
    }

    fn explain(&self) -> String {
        let mut parts: Vec<String> = self.matchers.iter().map(Matcher::explain).collect();
        if parts.is_empty() {
            parts.push("any request".to_string());
        }
        let mut text = format!("Match {}, and then {}", parts.join(" "), self.handler.explain());
        match self.remaining {
            Some(0) => text.push_str(" (done)"),
            Some(n) => text.push_str(&format!(" ({n} uses left)")),
            None => {}
        }
        text
    }
}

/// Rule list owned by a server. Insertion order is priority order.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<Vec<RegisteredRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and append a rule.
    pub fn add(&self, definition: RuleDefinition) -> Result<RuleHandle, regex::Error> {
        let compiled = definition
            .matchers
            .iter()
            .map(CompiledMatcher::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let id = uuid::Uuid::new_v4().to_string();
        let rule = RegisteredRule {
            id: id.clone(),
            matchers: definition.matchers,
            compiled,
            handler: definition.handler,
            remaining: definition.times,
        };
        debug!(rule = %id, "Registered rule: {}", rule.explain());
        self.rules.write().push(rule);
        Ok(RuleHandle { id })
    }

    pub fn remove(&self, handle: &RuleHandle) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != handle.id);
        before != rules.len()
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Find the first rule accepting `request` and consume one of its uses.
    ///
    /// Matchers run under the read lock. The write lock is taken only to
    /// consume the budget; if another request used the last one meanwhile,
    /// the search starts over.
    pub fn claim(&self, request: &CompletedRequest) -> Option<MatchedRule> {
        loop {
            let candidate = self
                .rules
                .read()
                .iter()
                .find(|r| r.accepts(request))
                .map(|r| r.id.clone())?;

            let mut rules = self.rules.write();
            let Some(rule) = rules.iter_mut().find(|r| r.id == candidate) else {
                continue;
            };
            match rule.remaining.as_mut() {
                Some(0) => continue,
                Some(remaining) => *remaining -= 1,
                None => {}
            }
            return Some(MatchedRule {
                id: rule.id.clone(),
                handler: rule.handler.clone(),
            });
        }
    }

    /// Explanation of every registered rule, in priority order.
    pub fn explanations(&self) -> Vec<String> {
        self.rules.read().iter().map(RegisteredRule::explain).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::CapturedBody;
    use crate::capture::{Headers, Protocol};
    use crate::rules::Reply;
    use bytes::Bytes;

    fn get(path: &str) -> CompletedRequest {
        CompletedRequest {
            id: "r".to_string(),
            protocol: Protocol::Http,
            method: "GET".to_string(),
            url: format!("http://localhost:8000{path}"),
            path: path.to_string(),
            hostname: "localhost".to_string(),
            normalized_url: crate::normalize::normalize(&format!("http://localhost:8000{path}")),
            headers: Headers::new(),
            remote_address: None,
            timestamp: chrono::Utc::now(),
            body: CapturedBody::new(Bytes::new(), None),
        }
    }

    fn reply_rule(path: &str, status: u16, times: Option<u32>) -> RuleDefinition {
        RuleDefinition {
            matchers: vec![Matcher::method("GET"), Matcher::url(path)],
            handler: Handler::StaticReply(Reply::new(status)),
            times,
        }
    }

    fn status_of(matched: Option<MatchedRule>) -> Option<u16> {
        match matched?.handler {
            Handler::StaticReply(reply) => Some(reply.status),
            _ => None,
        }
    }

    #[test]
    fn test_first_registered_rule_wins() {
        let registry = RuleRegistry::new();
        registry.add(reply_rule("/x", 200, None)).unwrap();
        registry.add(reply_rule("/x", 201, None)).unwrap();

        assert_eq!(status_of(registry.claim(&get("/x"))), Some(200));
        assert_eq!(status_of(registry.claim(&get("/x"))), Some(200));
        assert!(registry.claim(&get("/y")).is_none());
    }

    #[test]
    fn test_exhausted_rule_falls_through() {
        let registry = RuleRegistry::new();
        registry.add(reply_rule("/x", 200, Some(1))).unwrap();
        registry.add(reply_rule("/x", 201, None)).unwrap();

        assert_eq!(status_of(registry.claim(&get("/x"))), Some(200));
        assert_eq!(status_of(registry.claim(&get("/x"))), Some(201));
        assert!(registry.explanations()[0].ends_with("(done)"));
    }

    #[test]
    fn test_concurrent_claims_respect_budget() {
        let registry = std::sync::Arc::new(RuleRegistry::new());
        registry.add(reply_rule("/x", 200, Some(5))).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || registry.claim(&get("/x")).is_some())
            })
            .collect();
        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(claimed, 5);
        assert!(registry.claim(&get("/x")).is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = RuleRegistry::new();
        let a = registry.add(reply_rule("/x", 200, None)).unwrap();
        registry.add(reply_rule("/x", 201, None)).unwrap();

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(status_of(registry.claim(&get("/x"))), Some(201));

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.claim(&get("/x")).is_none());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let registry = RuleRegistry::new();
        let result = registry.add(RuleDefinition {
            matchers: vec![Matcher::UrlMatches {
                pattern: "[".to_string(),
            }],
            handler: Handler::StaticReply(Reply::new(200)),
            times: None,
        });
        assert!(result.is_err());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_explanations() {
        let registry = RuleRegistry::new();
        registry.add(reply_rule("/x", 200, Some(2))).unwrap();
        assert_eq!(
            registry.explanations(),
            vec!["Match GET requests for /x, and then reply with status 200 (2 uses left)"]
        );
    }

    #[test]
    fn test_rule_data_wire_shape() {
        let data: RuleData = serde_json::from_value(serde_json::json!({
            "matchers": [{"type": "method", "method": "GET"}, {"type": "url", "url": "/x"}],
            "handler": {"type": "passthrough", "options": {"forwardTo": "http://localhost:9"}},
            "times": 1
        }))
        .unwrap();
        assert_eq!(data.matchers.len(), 2);
        assert_eq!(data.times, Some(1));
    }
}
