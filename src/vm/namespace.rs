//! Function namespaces.
//!
//! Functions are registered under a namespace (or the global one). Namespaces
//! form parent chains, `ObjectName -> ClassName -> ... -> SimObject`, which
//! method calls and `Parent::` walk.

use crate::vm::codeblock::CodeBlock;
use crate::vm::objects;
use crate::vm::symbols::SymbolId;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// A function declared by script.
#[derive(Debug)]
pub struct ScriptFunction {
    pub name: String,
    pub namespace: Option<String>,
    pub block: Rc<CodeBlock>,
    /// First instruction of the body.
    pub body_ip: u32,
    pub args: Vec<Option<SymbolId>>,
    pub line: u32,
}

impl ScriptFunction {
    /// `Ns::name`, or just `name` for global functions.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}::{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Namespaces {
    functions: HashMap<(String, String), Rc<ScriptFunction>>,
    /// Lowercased namespace -> parent spelling.
    parents: HashMap<String, String>,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespaces {
    pub fn new() -> Self {
        let mut ns = Self {
            functions: HashMap::new(),
            parents: HashMap::new(),
        };
        for class in ["SimSet", "SimGroup", "ScriptObject", "ScriptGroup"] {
            if let Some(parent) = objects::parent_class(class) {
                ns.parents.insert(class.to_ascii_lowercase(), parent.to_string());
            }
        }
        ns
    }

    fn key(namespace: Option<&str>, name: &str) -> (String, String) {
        (
            namespace.unwrap_or_default().to_ascii_lowercase(),
            name.to_ascii_lowercase(),
        )
    }

    /// Register a function, replacing any previous definition.
    pub fn define(&mut self, function: ScriptFunction) {
        let key = Self::key(function.namespace.as_deref(), &function.name);
        debug!(function = %function.qualified_name(), "defined function");
        self.functions.insert(key, Rc::new(function));
    }

    /// Look a function up in exactly one namespace.
    pub fn lookup(&self, namespace: Option<&str>, name: &str) -> Option<Rc<ScriptFunction>> {
        self.functions.get(&Self::key(namespace, name)).cloned()
    }

    /// Look a function up in `namespace` and then its ancestors.
    pub fn lookup_in_chain(&self, namespace: &str, name: &str) -> Option<Rc<ScriptFunction>> {
        self.chain(namespace)
            .into_iter()
            .find_map(|ns| self.lookup(Some(&ns), name))
    }

    /// `namespace` followed by its ancestors.
    pub fn chain(&self, namespace: &str) -> Vec<String> {
        let mut out = vec![namespace.to_string()];
        let mut current = namespace.to_ascii_lowercase();
        while let Some(parent) = self.parents.get(&current) {
            let lower = parent.to_ascii_lowercase();
            if out.iter().any(|n| n.eq_ignore_ascii_case(parent)) {
                break;
            }
            out.push(parent.clone());
            current = lower;
        }
        out
    }

    pub fn parent(&self, namespace: &str) -> Option<&str> {
        self.parents
            .get(&namespace.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Make `parent` the parent of `child`. An existing different link is
    /// kept and reported; links that would form a cycle are refused.
    pub fn link(&mut self, child: &str, parent: &str) -> bool {
        if child.eq_ignore_ascii_case(parent) {
            return true;
        }
        let key = child.to_ascii_lowercase();
        if let Some(existing) = self.parents.get(&key) {
            if existing.eq_ignore_ascii_case(parent) {
                return true;
            }
            warn!(child, existing = %existing, parent, "namespace is already linked to a different parent");
            return false;
        }
        if self.chain(parent).iter().any(|n| n.eq_ignore_ascii_case(child)) {
            warn!(child, parent, "refusing cyclic namespace link");
            return false;
        }
        self.parents.insert(key, parent.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::vm::symbols::SymbolTable;

    fn function(ns: Option<&str>, name: &str, line: u32) -> ScriptFunction {
        let unit = compiler::compile_resolved("ns.cs", "", &mut SymbolTable::new()).unwrap();
        ScriptFunction {
            name: name.to_string(),
            namespace: ns.map(str::to_string),
            block: Rc::new(CodeBlock::new("ns.cs", unit)),
            body_ip: 0,
            args: Vec::new(),
            line,
        }
    }

    #[test]
    fn test_redefinition_replaces() {
        let mut ns = Namespaces::new();
        ns.define(function(None, "foo", 1));
        ns.define(function(None, "FOO", 2));
        assert_eq!(ns.len(), 1);
        assert_eq!(ns.lookup(None, "Foo").unwrap().line, 2);
    }

    #[test]
    fn test_class_chain_lookup() {
        let mut ns = Namespaces::new();
        ns.define(function(Some("SimObject"), "describe", 1));
        ns.define(function(Some("Player"), "jump", 2));
        assert!(ns.link("Player", "ScriptObject"));
        assert_eq!(ns.chain("player"), vec!["player", "ScriptObject", "SimObject"]);
        assert_eq!(ns.lookup_in_chain("Player", "describe").unwrap().line, 1);
        assert_eq!(ns.lookup_in_chain("Player", "jump").unwrap().qualified_name(), "Player::jump");
        assert!(ns.lookup_in_chain("ScriptObject", "jump").is_none());
    }

    #[test]
    fn test_link_conflicts_and_cycles() {
        let mut ns = Namespaces::new();
        assert!(ns.link("A", "B"));
        assert!(ns.link("a", "b"));
        assert!(!ns.link("A", "C"));
        assert!(!ns.link("B", "A"));
        assert_eq!(ns.parent("A"), Some("B"));
    }
}
