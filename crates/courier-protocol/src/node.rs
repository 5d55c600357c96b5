//! Node addressing.
//!
//! A node is written `name@domain/instance`; every part is optional.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An addressable node on the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Node {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub instance: Option<String>,
}

impl Node {
    /// Create a node from its parts.
    #[must_use]
    pub fn new(name: impl Into<String>, domain: impl Into<String>, instance: Option<String>) -> Self {
        Self {
            name: Some(name.into()),
            domain: Some(domain.into()),
            instance,
        }
    }

    /// Parse a node from `name@domain/instance` notation.
    ///
    /// Parsing never fails: missing parts are left empty.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let (identity, instance) = match value.split_once('/') {
            Some((identity, instance)) => (identity, Some(instance)),
            None => (value, None),
        };
        let (name, domain) = match identity.split_once('@') {
            Some((name, domain)) => (Some(name), Some(domain)),
            None => (Some(identity), None),
        };

        let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            name: non_empty(name),
            domain: non_empty(domain),
            instance: non_empty(instance),
        }
    }

    /// The node without its instance.
    #[must_use]
    pub fn identity(&self) -> Node {
        Node {
            instance: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}", name)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "@{}", domain)?;
        }
        if let Some(instance) = &self.instance {
            write!(f, "/{}", instance)?;
        }
        Ok(())
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::parse(&s)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::parse(s)
    }
}

impl From<Node> for String {
    fn from(node: Node) -> String {
        node.to_string()
    }
}
