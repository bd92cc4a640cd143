//! Component-name-to-repository-spec resolver (spec §4.F): an ordered list
//! of glob rules, first match wins, resolved at construction time so later
//! mutation of the caller's input can't change an already-built resolver's
//! behavior.

use serde_json::Value;

use crate::error::OcmError;
use crate::Result;

/// One resolution rule: a glob pattern over component names, and the
/// repository spec to use when it matches.
#[derive(Debug, Clone)]
pub struct Rule {
    /// A glob pattern matched against a component name, e.g. `github.com/acme/*`.
    pub component_name_pattern: String,
    /// The repository spec (an opaque, scheme-decodable document) to use.
    pub repository_spec: Value,
}

/// An ordered, immutable set of resolution rules (spec §4.F): the first
/// rule whose pattern matches a name wins.
#[derive(Debug, Clone)]
pub struct Resolver {
    rules: Vec<Rule>,
}

impl Resolver {
    /// Build a resolver from `rules`, deep-copying them so later mutation
    /// of the caller's original `Vec` cannot affect already-built resolver
    /// behavior.
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Find the repository spec for `component_name`, returning the first
    /// rule (in registration order) whose pattern matches.
    pub fn resolve(&self, component_name: &str) -> Result<&Value> {
        self.rules
            .iter()
            .find(|rule| glob_match::glob_match(&rule.component_name_pattern, component_name))
            .map(|rule| &rule.repository_spec)
            .ok_or_else(|| {
                OcmError::NotFound {
                    what: format!("no resolver rule matches component name: {component_name}"),
                }
                .into()
            })
    }
}
