//! Context ledger - execution context allocation and tree tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TroupeError};
use crate::types::{AgentRole, ContextId};

/// One node in the recursion tree
///
/// Immutable once created; recursion always creates a new child context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub context_id: ContextId,
    /// Parent node, `None` for a root without an external parent
    pub parent_context_id: Option<ContextId>,
    pub depth: u32,
    /// Bound inherited from the root
    pub max_depth: u32,
    pub team_size: usize,
    pub assigned_role: AgentRole,
    /// Position of the owning agent within its team
    pub agent_index: usize,
    pub start_time: DateTime<Utc>,
}

impl ExecutionContext {
    /// Whether this node may spawn a child context
    pub fn can_spawn(&self) -> bool {
        self.depth < self.max_depth
    }

    /// Levels of recursion left below this node
    pub fn recursion_remaining(&self) -> u32 {
        self.max_depth.saturating_sub(self.depth)
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }
}

/// Options for a root context supplied by an inbound request
#[derive(Debug, Clone, Default)]
pub struct RootOptions {
    /// Use this id instead of generating one
    pub context_id: Option<ContextId>,
    /// External parent the caller is threading through
    pub parent_context_id: Option<ContextId>,
}

#[derive(Debug, Clone)]
struct LedgerNode {
    context: ExecutionContext,
    children: Vec<ContextId>,
}

/// Allocates execution contexts and records the tree they form
///
/// Ids are random v4 UUIDs, so allocation never contends. The tree record is
/// only touched for the duration of an insert or a lookup.
pub struct ContextLedger {
    nodes: RwLock<HashMap<ContextId, LedgerNode>>,
    issued: AtomicU64,
}

impl ContextLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    /// Create a depth-0 context with a fresh id
    pub fn new_root(&self, max_depth: u32, team_size: usize) -> ExecutionContext {
        let context = Self::root_context(ContextId::new(), None, max_depth, team_size);
        self.record(&mut self.nodes.write(), context.clone(), None);
        context
    }

    /// Create a depth-0 context honouring caller-supplied ids
    pub fn new_root_with(
        &self,
        options: RootOptions,
        max_depth: u32,
        team_size: usize,
    ) -> Result<ExecutionContext> {
        let context_id = options.context_id.unwrap_or_default();

        // Check and insert under one guard so concurrent requests cannot share an id
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&context_id) {
            return Err(TroupeError::DuplicateContext(context_id));
        }

        let context =
            Self::root_context(context_id, options.parent_context_id, max_depth, team_size);
        self.record(&mut nodes, context.clone(), None);
        Ok(context)
    }

    /// Create a child of `parent` one level deeper
    pub fn new_child(
        &self,
        parent: &ExecutionContext,
        assigned_role: AgentRole,
        agent_index: usize,
        team_size: usize,
    ) -> Result<ExecutionContext> {
        if parent.depth + 1 > parent.max_depth {
            return Err(TroupeError::DepthExceeded {
                depth: parent.depth,
                max_depth: parent.max_depth,
            });
        }

        let context = ExecutionContext {
            context_id: ContextId::new(),
            parent_context_id: Some(parent.context_id),
            depth: parent.depth + 1,
            max_depth: parent.max_depth,
            team_size,
            assigned_role,
            agent_index,
            start_time: Utc::now(),
        };

        self.record(&mut self.nodes.write(), context.clone(), Some(parent.context_id));
        Ok(context)
    }

    fn root_context(
        context_id: ContextId,
        parent_context_id: Option<ContextId>,
        max_depth: u32,
        team_size: usize,
    ) -> ExecutionContext {
        // A lone agent at the root acts alone; a larger root team is coordinated
        let assigned_role = if team_size <= 1 {
            AgentRole::Solo
        } else {
            AgentRole::Leader
        };

        ExecutionContext {
            context_id,
            parent_context_id,
            depth: 0,
            max_depth,
            team_size,
            assigned_role,
            agent_index: 0,
            start_time: Utc::now(),
        }
    }

    fn record(
        &self,
        nodes: &mut HashMap<ContextId, LedgerNode>,
        context: ExecutionContext,
        parent: Option<ContextId>,
    ) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        let context_id = context.context_id;
        let depth = context.depth;

        if let Some(pid) = &parent {
            if let Some(parent_node) = nodes.get_mut(pid) {
                parent_node.children.push(context_id);
            }
        }
        nodes.insert(
            context_id,
            LedgerNode {
                context,
                children: Vec::new(),
            },
        );

        debug!(context_id = %context_id, parent = ?parent, depth, "Issued context");
    }

    /// Look up a recorded context
    pub fn get(&self, id: &ContextId) -> Option<ExecutionContext> {
        self.nodes.read().get(id).map(|n| n.context.clone())
    }

    /// Direct children of a context
    pub fn children(&self, id: &ContextId) -> Vec<ContextId> {
        self.nodes
            .read()
            .get(id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Path from the tree root down to `id`, inclusive
    pub fn lineage(&self, id: &ContextId) -> Vec<ContextId> {
        let nodes = self.nodes.read();
        let mut path = Vec::new();
        let mut current = Some(*id);

        while let Some(cid) = current {
            match nodes.get(&cid) {
                Some(node) => {
                    path.push(cid);
                    // An external parent is not part of this ledger
                    current = node
                        .context
                        .parent_context_id
                        .filter(|p| nodes.contains_key(p));
                }
                None => break,
            }
        }

        path.reverse();
        path
    }

    /// Drop `root` and every context below it, returning the removed ids
    ///
    /// The issue counter is unaffected.
    pub fn remove_tree(&self, root: &ContextId) -> Vec<ContextId> {
        let mut nodes = self.nodes.write();
        let mut removed = Vec::new();
        let mut pending = vec![*root];

        while let Some(id) = pending.pop() {
            if let Some(node) = nodes.remove(&id) {
                pending.extend(node.children);
                removed.push(id);
            }
        }

        // Unlink from a parent that stays behind
        for node in nodes.values_mut() {
            node.children.retain(|c| c != root);
        }
        drop(nodes);

        debug!(root = %root, removed = removed.len(), "Removed context tree");
        removed
    }

    /// All recorded contexts
    pub fn contexts(&self) -> Vec<ExecutionContext> {
        self.nodes.read().values().map(|n| n.context.clone()).collect()
    }

    /// Number of contexts ever issued
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl Default for ContextLedger {
    fn default() -> Self {
        Self::new()
    }
}
