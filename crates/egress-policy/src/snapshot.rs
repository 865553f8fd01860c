use std::collections::HashMap;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::PolicyError;
use crate::policy::{Action, PolicyDocument, Rule, RuleDocument, Target, normalize_fqdn};

/// Immutable, fully-populated policy value. Exactly one snapshot is active
/// at any time; readers observe it through a single atomic pointer load and
/// never see a partially-built value.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    default_action: Action,
    rules: Vec<Rule>,
    allow_v4: Vec<Ipv4Net>,
    deny_v4: Vec<Ipv4Net>,
    allow_v6: Vec<Ipv6Net>,
    deny_v6: Vec<Ipv6Net>,
}

impl PolicySnapshot {
    /// The reset state: deny everything, no rules.
    pub fn default_deny() -> Self {
        Self {
            default_action: Action::Deny,
            rules: Vec::new(),
            allow_v4: Vec::new(),
            deny_v4: Vec::new(),
            allow_v6: Vec::new(),
            deny_v6: Vec::new(),
        }
    }

    /// Parse a raw HTTP body or env value into a snapshot.
    ///
    /// Empty, whitespace-only, `{}`, and `null` bodies are the reset
    /// sentinel and produce [`PolicySnapshot::default_deny`].
    pub fn parse(raw: &[u8]) -> Result<Self, PolicyError> {
        let text = std::str::from_utf8(raw).map_err(|_| PolicyError::NotUtf8)?;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "{}" || trimmed == "null" {
            return Ok(Self::default_deny());
        }
        let doc: PolicyDocument = serde_json::from_str(trimmed)?;
        Self::from_document(&doc)
    }

    pub fn from_document(doc: &PolicyDocument) -> Result<Self, PolicyError> {
        let default_action = match doc.default_action.as_deref() {
            None => Action::Deny,
            Some(raw) => Action::parse(raw)?,
        };

        let mut rules = Vec::with_capacity(doc.egress.len());
        let mut seen: HashMap<String, Action> = HashMap::new();
        for entry in &doc.egress {
            let action = Action::parse(&entry.action)?;
            let target = Target::parse(&entry.target)?;
            let canonical = target.canonical();
            match seen.get(&canonical) {
                Some(prior) if *prior != action => {
                    return Err(PolicyError::InvalidActionCombo(canonical));
                }
                _ => {
                    seen.insert(canonical, action);
                }
            }
            rules.push(Rule { action, target });
        }

        let mut snapshot = Self {
            default_action,
            rules,
            allow_v4: Vec::new(),
            deny_v4: Vec::new(),
            allow_v6: Vec::new(),
            deny_v6: Vec::new(),
        };
        snapshot.classify_ip_rules();
        Ok(snapshot)
    }

    fn classify_ip_rules(&mut self) {
        for rule in &self.rules {
            let Target::Net(net) = &rule.target else {
                continue;
            };
            match (net, rule.action) {
                (IpNet::V4(n), Action::Allow) => self.allow_v4.push(*n),
                (IpNet::V4(n), Action::Deny) => self.deny_v4.push(*n),
                (IpNet::V6(n), Action::Allow) => self.allow_v6.push(*n),
                (IpNet::V6(n), Action::Deny) => self.deny_v6.push(*n),
            }
        }
    }

    /// Decide the fate of a DNS name: the first matching FQDN rule in
    /// document order wins; with no match the default action applies.
    pub fn evaluate(&self, fqdn: &str) -> Action {
        let name = normalize_fqdn(fqdn);
        for rule in &self.rules {
            let matched = match &rule.target {
                Target::Fqdn(exact) => *exact == name,
                Target::Wildcard(suffix) => wildcard_matches(suffix, &name),
                Target::Net(_) => false,
            };
            if matched {
                return rule.action;
            }
        }
        self.default_action
    }

    /// Render the active policy back into its ingestion shape.
    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            default_action: Some(self.default_action.as_str().to_string()),
            egress: self
                .rules
                .iter()
                .map(|rule| RuleDocument {
                    action: rule.action.as_str().to_string(),
                    target: rule.target.canonical(),
                })
                .collect(),
        }
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn allow_v4(&self) -> &[Ipv4Net] {
        &self.allow_v4
    }

    pub fn deny_v4(&self) -> &[Ipv4Net] {
        &self.deny_v4
    }

    pub fn allow_v6(&self) -> &[Ipv6Net] {
        &self.allow_v6
    }

    pub fn deny_v6(&self) -> &[Ipv6Net] {
        &self.deny_v6
    }
}

/// `*.suffix` matches strict subdomains only: `a.example.com` and
/// `x.y.example.com` for suffix `example.com`, never `example.com` itself.
fn wildcard_matches(suffix: &str, name: &str) -> bool {
    name.len() > suffix.len()
        && name.ends_with(suffix)
        && name.as_bytes()[name.len() - suffix.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(json: &str) -> PolicySnapshot {
        PolicySnapshot::parse(json.as_bytes()).expect("valid policy")
    }

    #[test]
    fn reset_sentinel_forms_produce_default_deny() {
        for body in ["", "   ", "\n\t ", "{}", "null"] {
            let snap = snapshot(body);
            assert_eq!(snap.default_action(), Action::Deny);
            assert_eq!(snap.rule_count(), 0);
        }
    }

    #[test]
    fn missing_default_action_is_deny() {
        let snap = snapshot(r#"{"egress":[]}"#);
        assert_eq!(snap.default_action(), Action::Deny);
    }

    #[test]
    fn wildcard_matches_strict_subdomains_only() {
        let snap = snapshot(
            r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"*.example.com"}]}"#,
        );
        assert_eq!(snap.evaluate("a.example.com"), Action::Allow);
        assert_eq!(snap.evaluate("x.y.example.com"), Action::Allow);
        assert_eq!(snap.evaluate("example.com"), Action::Deny);
        assert_eq!(snap.evaluate("notexample.com"), Action::Deny);
    }

    #[test]
    fn evaluation_normalizes_query_names() {
        let snap = snapshot(
            r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"*.pypi.org"}]}"#,
        );
        assert_eq!(snap.evaluate("Files.PyPI.org."), Action::Allow);
        assert_eq!(snap.evaluate("pypi.org."), Action::Deny);
    }

    #[test]
    fn first_matching_rule_wins() {
        let snap = snapshot(
            r#"{"defaultAction":"deny","egress":[
                {"action":"allow","target":"*.example.com"},
                {"action":"deny","target":"api.example.com"}
            ]}"#,
        );
        assert_eq!(snap.evaluate("api.example.com"), Action::Allow);
    }

    #[test]
    fn default_allow_applies_without_matches() {
        let snap = snapshot(
            r#"{"defaultAction":"allow","egress":[{"action":"deny","target":"evil.example"}]}"#,
        );
        assert_eq!(snap.evaluate("evil.example"), Action::Deny);
        assert_eq!(snap.evaluate("good.example"), Action::Allow);
    }

    #[test]
    fn ip_rules_bucket_by_family_and_action() {
        let snap = snapshot(
            r#"{"defaultAction":"allow","egress":[
                {"action":"deny","target":"10.0.0.0/8"},
                {"action":"allow","target":"151.101.0.223"},
                {"action":"deny","target":"2001:db8::/32"},
                {"action":"allow","target":"2001:4860:4860::8888"}
            ]}"#,
        );
        assert_eq!(snap.deny_v4(), vec!["10.0.0.0/8".parse::<Ipv4Net>().unwrap()]);
        assert_eq!(
            snap.allow_v4(),
            vec!["151.101.0.223/32".parse::<Ipv4Net>().unwrap()]
        );
        assert_eq!(
            snap.deny_v6(),
            vec!["2001:db8::/32".parse::<Ipv6Net>().unwrap()]
        );
        assert_eq!(
            snap.allow_v6(),
            vec!["2001:4860:4860::8888/128".parse::<Ipv6Net>().unwrap()]
        );
    }

    #[test]
    fn ip_rules_never_match_query_names() {
        let snap = snapshot(
            r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"8.8.8.8"}]}"#,
        );
        assert_eq!(snap.evaluate("dns.google"), Action::Deny);
    }

    #[test]
    fn conflicting_actions_on_same_target_are_rejected() {
        let err = PolicySnapshot::parse(
            r#"{"egress":[
                {"action":"allow","target":"example.com"},
                {"action":"deny","target":"Example.com."}
            ]}"#
            .as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidActionCombo(_)));
    }

    #[test]
    fn duplicate_rules_with_same_action_are_kept() {
        let snap = snapshot(
            r#"{"egress":[
                {"action":"allow","target":"example.com"},
                {"action":"allow","target":"example.com"}
            ]}"#,
        );
        assert_eq!(snap.rule_count(), 2);
    }

    #[test]
    fn invalid_action_and_target_surface_typed_errors() {
        let err =
            PolicySnapshot::parse(r#"{"egress":[{"action":"accept","target":"a.b"}]}"#.as_bytes())
                .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidAction(_)));

        let err =
            PolicySnapshot::parse(r#"{"egress":[{"action":"allow","target":"???"}]}"#.as_bytes())
                .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidTarget(_)));
    }

    #[test]
    fn render_parse_round_trip_is_canonical() {
        let snap = snapshot(
            r#"{"defaultAction":"deny","egress":[
                {"action":"allow","target":"*.PyPI.org"},
                {"action":"deny","target":"10.0.0.1/8"},
                {"action":"allow","target":"example.com."}
            ]}"#,
        );
        let doc = snap.to_document();
        assert_eq!(doc.default_action.as_deref(), Some("deny"));
        let targets: Vec<&str> = doc.egress.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["*.pypi.org", "10.0.0.0/8", "example.com"]);

        let rendered = serde_json::to_vec(&doc).unwrap();
        let reparsed = PolicySnapshot::parse(&rendered).unwrap();
        assert_eq!(reparsed.to_document().egress.len(), 3);
        assert_eq!(
            reparsed
                .to_document()
                .egress
                .iter()
                .map(|r| r.target.clone())
                .collect::<Vec<_>>(),
            targets
        );
    }
}
