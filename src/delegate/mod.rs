//! Delegate Tree
//!
//! Design Decision: Immutable arena built once from flat specs
//!
//! Rationale: Delegates are declared as a flat list where each names its
//! children. `DelegateTree::build` validates the whole structure up front
//! and lays it out in an arena (`Vec<Delegate>` with parent/child indices).
//! The orchestrator then tracks the active delegate as a `DelegateId`, never
//! as a live reference, and the tree is never mutated after construction.
//!
//! Validation (all at build time, none at call time):
//! 1. Spec names are unique: `DuplicateDelegateName`
//! 2. Root and every child reference exist: `UnknownDelegate`
//! 3. No child closes a cycle to an ancestor: `CyclicDelegateTree`
//! 4. No delegate appears twice in the tree (two parents, or listed twice
//!    under one parent): `DuplicateDelegateName`
//! 5. Every bound capability is registered: `UnboundCapability`
//!
//! Specs not reachable from the root are dropped with a warning.

pub mod catalog;
pub mod config;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::capability::CapabilityRegistry;
use crate::error::{MasterpieceError, Result};

pub use config::{DelegateConfig, DelegateLoader, DelegateSetConfig};

/// Declarative definition of one delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateSpec {
    pub name: String,
    pub instruction: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl DelegateSpec {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            capabilities: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }
}

/// Index of a delegate in its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelegateId(usize);

impl DelegateId {
    pub const ROOT: DelegateId = DelegateId(0);
}

impl fmt::Display for DelegateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One validated node of the tree
#[derive(Debug, Clone)]
pub struct Delegate {
    name: String,
    instruction: String,
    capabilities: Vec<String>,
    parent: Option<DelegateId>,
    children: Vec<DelegateId>,
}

impl Delegate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Bound capability names, in declaration order
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn binds(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn parent(&self) -> Option<DelegateId> {
        self.parent
    }

    pub fn children(&self) -> &[DelegateId] {
        &self.children
    }
}

#[derive(Debug, Clone)]
pub struct DelegateTree {
    nodes: Vec<Delegate>,
    index: HashMap<String, DelegateId>,
}

/// Depth-first arena builder
struct Builder<'a> {
    specs: HashMap<&'a str, &'a DelegateSpec>,
    nodes: Vec<Delegate>,
    index: HashMap<String, DelegateId>,
    path: Vec<String>,
}

impl<'a> Builder<'a> {
    fn visit(&mut self, name: &str, parent: Option<DelegateId>) -> Result<DelegateId> {
        if let Some(pos) = self.path.iter().position(|n| n == name) {
            let mut cycle = self.path[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(MasterpieceError::CyclicDelegateTree { path: cycle });
        }
        if self.index.contains_key(name) {
            return Err(MasterpieceError::DuplicateDelegateName(name.to_string()));
        }

        let spec = *self
            .specs
            .get(name)
            .ok_or_else(|| MasterpieceError::UnknownDelegate(name.to_string()))?;

        let id = DelegateId(self.nodes.len());
        self.nodes.push(Delegate {
            name: spec.name.clone(),
            instruction: spec.instruction.clone(),
            capabilities: spec.capabilities.clone(),
            parent,
            children: Vec::with_capacity(spec.children.len()),
        });
        self.index.insert(spec.name.clone(), id);

        self.path.push(spec.name.clone());
        for child in &spec.children {
            let child_id = self.visit(child, Some(id))?;
            self.nodes[id.0].children.push(child_id);
        }
        self.path.pop();

        Ok(id)
    }
}

impl DelegateTree {
    /// Validate `specs` and build the tree rooted at `root`
    ///
    /// Pure apart from reading the registry; on error nothing is retained.
    pub async fn build(
        root: &str,
        specs: &[DelegateSpec],
        registry: &CapabilityRegistry,
    ) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(specs.len());
        for spec in specs {
            if by_name.insert(spec.name.as_str(), spec).is_some() {
                return Err(MasterpieceError::DuplicateDelegateName(spec.name.clone()));
            }
        }
        if !by_name.contains_key(root) {
            return Err(MasterpieceError::UnknownDelegate(root.to_string()));
        }
        for spec in specs {
            if let Some(missing) = spec.children.iter().find(|c| !by_name.contains_key(c.as_str())) {
                return Err(MasterpieceError::UnknownDelegate(missing.clone()));
            }
        }

        let mut builder = Builder {
            specs: by_name,
            nodes: Vec::with_capacity(specs.len()),
            index: HashMap::with_capacity(specs.len()),
            path: Vec::new(),
        };
        builder.visit(root, None)?;

        let reachable: HashSet<&str> = builder.index.keys().map(String::as_str).collect();
        for spec in specs.iter().filter(|s| !reachable.contains(s.name.as_str())) {
            tracing::warn!(delegate = %spec.name, root, "Delegate is not reachable from the root, ignoring");
        }

        for node in &builder.nodes {
            for capability in &node.capabilities {
                if !registry.contains(capability).await {
                    return Err(MasterpieceError::UnboundCapability {
                        delegate: node.name.clone(),
                        capability: capability.clone(),
                    });
                }
            }
        }

        tracing::debug!(root, size = builder.nodes.len(), "Built delegate tree");
        Ok(Self {
            nodes: builder.nodes,
            index: builder.index,
        })
    }

    pub fn root(&self) -> &Delegate {
        &self.nodes[DelegateId::ROOT.0]
    }

    /// Panics on an id from another tree
    pub fn get(&self, id: DelegateId) -> &Delegate {
        &self.nodes[id.0]
    }

    pub fn id_of(&self, name: &str) -> Option<DelegateId> {
        self.index.get(name).copied()
    }

    pub fn find(&self, name: &str) -> Option<&Delegate> {
        self.id_of(name).map(|id| self.get(id))
    }

    /// Names of `id`'s children, in declaration order
    pub fn child_names(&self, id: DelegateId) -> Vec<String> {
        self.get(id)
            .children
            .iter()
            .map(|c| self.get(*c).name.clone())
            .collect()
    }

    /// The direct child of `parent` named `name`, if any
    pub fn child(&self, parent: DelegateId, name: &str) -> Option<DelegateId> {
        self.get(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.get(*c).name == name)
    }

    pub fn is_child(&self, parent: &str, child: &str) -> bool {
        self.id_of(parent)
            .and_then(|p| self.child(p, child))
            .is_some()
    }

    /// Names from the root down to `id`
    pub fn path_to(&self, id: DelegateId) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            path.push(self.get(node).name.as_str());
            current = self.get(node).parent;
        }
        path.reverse();
        path
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Delegates in depth-first order, root first
    pub fn iter(&self) -> impl Iterator<Item = (DelegateId, &Delegate)> {
        self.nodes.iter().enumerate().map(|(i, d)| (DelegateId(i), d))
    }
}
