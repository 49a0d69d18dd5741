use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use ahash::RandomState;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;

use super::{CallTree, CallTreeNodeBase};
use crate::stacks::{FrameIndex, NodeIndex};

/// A node of a tree merged from every node of one focus frame.
///
/// A callee tree merges what all nodes of the focus frame call, level by level, grouping by
/// name. A caller tree merges the chains of callers above them, so the children of the root are
/// the direct callers of the focus frame, their children the callers of those, and so on.
///
/// Children are built the first time they are asked for. When the focus frame is recursive,
/// callee subtrees would otherwise count the nested occurrences twice: once below their outer
/// occurrence and once as occurrences of their own. Those nested subtrees are subtracted out.
#[derive(Debug)]
pub struct AggregateCallTreeNode<'a> {
    tree: &'a CallTree,
    base: CallTreeNodeBase,
    nodes: Vec<NodeIndex>,
    caller_offset: Option<usize>,
    focus_id: FrameIndex,
    recursion: bool,
    children: OnceCell<Vec<AggregateCallTreeNode<'a>>>,
}

impl<'a> AggregateCallTreeNode<'a> {
    /// The merged callee tree of the frame of `focus`.
    pub fn callee_tree(tree: &'a CallTree, focus: NodeIndex) -> Self {
        Self::focus_root(tree, focus, None)
    }

    /// The merged caller tree of the frame of `focus`.
    pub fn caller_tree(tree: &'a CallTree, focus: NodeIndex) -> Self {
        Self::focus_root(tree, focus, Some(0))
    }

    /// The merged callee tree of the frame named `name`.
    pub fn callee_tree_by_name(tree: &'a CallTree, name: &str) -> Option<Self> {
        let first = *tree.nodes_with_id(tree.frame_id(name)?).first()?;
        Some(Self::callee_tree(tree, first))
    }

    /// The merged caller tree of the frame named `name`.
    pub fn caller_tree_by_name(tree: &'a CallTree, name: &str) -> Option<Self> {
        let first = *tree.nodes_with_id(tree.frame_id(name)?).first()?;
        Some(Self::caller_tree(tree, first))
    }

    fn focus_root(tree: &'a CallTree, focus: NodeIndex, caller_offset: Option<usize>) -> Self {
        let focus_base = tree.node(focus).base();
        let focus_id = focus_base.id;
        let nodes = tree.nodes_with_id(focus_id);
        let nested: Vec<bool> = nodes
            .iter()
            .map(|&node| has_ancestor(tree, node, |a| tree.nodes[a.index()].base.id == focus_id))
            .collect();
        let recursion = nested.iter().any(|&n| n);

        let mut base = CallTreeNodeBase::new(focus_base.name.clone(), focus_id);
        for (&node, &nested) in nodes.iter().zip(&nested) {
            let node = &tree.nodes[node.index()].base;
            base.add_exclusive(node, 1.0);
            if !nested {
                base.add_inclusive(node, 1.0);
            }
        }
        AggregateCallTreeNode {
            tree,
            base,
            nodes,
            caller_offset,
            focus_id,
            recursion,
            children: OnceCell::new(),
        }
    }

    /// The tree nodes merged into this one. For caller trees these are nodes of the focus
    /// frame; the node itself stands for their ancestors at [`Self::caller_offset`].
    pub fn nodes(&self) -> &[NodeIndex] {
        &self.nodes
    }

    /// How many levels above the focus frame this caller tree node is; `None` in callee trees.
    pub fn caller_offset(&self) -> Option<usize> {
        self.caller_offset
    }

    /// Whether this node belongs to a caller tree.
    pub fn is_caller_tree(&self) -> bool {
        self.caller_offset.is_some()
    }

    /// Whether the focus frame is ever called from within itself.
    pub fn recursion(&self) -> bool {
        self.recursion
    }

    /// The merged children, largest inclusive metric first.
    pub fn children(&self) -> &[AggregateCallTreeNode<'a>] {
        self.children.get_or_init(|| match self.caller_offset {
            None => self.callee_children(),
            Some(offset) => self.caller_children(offset + 1),
        })
    }

    /// The child named `name`.
    pub fn child(&self, name: &str) -> Option<&AggregateCallTreeNode<'a>> {
        self.children().iter().find(|c| c.name() == name)
    }

    fn child_node(&self, base: CallTreeNodeBase, nodes: Vec<NodeIndex>, caller_offset: Option<usize>) -> Self {
        AggregateCallTreeNode {
            tree: self.tree,
            base,
            nodes,
            caller_offset,
            focus_id: self.focus_id,
            recursion: self.recursion,
            children: OnceCell::new(),
        }
    }

    fn callee_children(&self) -> Vec<AggregateCallTreeNode<'a>> {
        let tree = self.tree;
        let mut groups: IndexMap<Arc<str>, Vec<NodeIndex>, RandomState> = IndexMap::default();
        for &node in &self.nodes {
            for &callee in &tree.nodes[node.index()].callees {
                let base = &tree.nodes[callee.index()].base;
                // Nested occurrences of the focus are merged into the root already.
                if base.id == self.focus_id {
                    continue;
                }
                groups.entry(base.name.clone()).or_default().push(callee);
            }
        }

        let mut children: Vec<_> = groups
            .into_iter()
            .map(|(name, nodes)| {
                let mut base = CallTreeNodeBase::new(name, tree.nodes[nodes[0].index()].base.id);
                for &node in &nodes {
                    let node_base = &tree.nodes[node.index()].base;
                    base.add_inclusive(node_base, 1.0);
                    base.add_exclusive(node_base, 1.0);
                    if self.recursion {
                        self.subtract_out_trees(node, &mut base);
                    }
                }
                self.child_node(base, nodes, None)
            })
            .collect();
        sort(&mut children);
        children
    }

    // Subtracts the topmost focus subtrees strictly below `node` from the inclusive totals of
    // `base`; they are counted where the root merges them in.
    fn subtract_out_trees(&self, node: NodeIndex, base: &mut CallTreeNodeBase) {
        let tree = self.tree;
        let mut work: Vec<NodeIndex> = tree.nodes[node.index()].callees.clone();
        while let Some(index) = work.pop() {
            let current = &tree.nodes[index.index()];
            if current.base.id == self.focus_id {
                base.add_inclusive(&current.base, -1.0);
            } else {
                work.extend_from_slice(&current.callees);
            }
        }
    }

    fn caller_children(&self, offset: usize) -> Vec<AggregateCallTreeNode<'a>> {
        let tree = self.tree;
        let mut groups: IndexMap<Arc<str>, (FrameIndex, Vec<NodeIndex>), RandomState> =
            IndexMap::default();
        for &node in &self.nodes {
            if let Some(ancestor) = ancestor(tree, node, offset) {
                let base = &tree.nodes[ancestor.index()].base;
                groups
                    .entry(base.name.clone())
                    .or_insert_with(|| (base.id, Vec::new()))
                    .1
                    .push(node);
            }
        }

        let mut children: Vec<_> = groups
            .into_iter()
            .map(|(name, (id, nodes))| {
                // An occurrence inside another occurrence of the same group is already counted
                // by the outer one.
                let nodes = if self.recursion {
                    let members: HashSet<NodeIndex, RandomState> = nodes.iter().copied().collect();
                    nodes
                        .into_iter()
                        .filter(|&node| !has_ancestor(tree, node, |a| members.contains(&a)))
                        .collect()
                } else {
                    nodes
                };
                let mut base = CallTreeNodeBase::new(name, id);
                for &node in &nodes {
                    let node_base = &tree.nodes[node.index()].base;
                    base.add_inclusive(node_base, 1.0);
                    base.add_exclusive(node_base, 1.0);
                }
                self.child_node(base, nodes, Some(offset))
            })
            .collect();
        sort(&mut children);
        children
    }
}

impl Deref for AggregateCallTreeNode<'_> {
    type Target = CallTreeNodeBase;

    fn deref(&self) -> &CallTreeNodeBase {
        &self.base
    }
}

fn sort(children: &mut [AggregateCallTreeNode<'_>]) {
    children.sort_by(|a, b| {
        b.base
            .inclusive_metric
            .abs()
            .total_cmp(&a.base.inclusive_metric.abs())
            .then_with(|| a.base.name.cmp(&b.base.name))
    });
}

// The ancestor `levels` callers above `node`; the root counts as an ancestor.
fn ancestor(tree: &CallTree, node: NodeIndex, levels: usize) -> Option<NodeIndex> {
    let mut current = node;
    for _ in 0..levels {
        current = tree.nodes[current.index()].caller?;
    }
    Some(current)
}

fn has_ancestor<F>(tree: &CallTree, node: NodeIndex, mut matches: F) -> bool
where
    F: FnMut(NodeIndex) -> bool,
{
    let mut current = tree.nodes[node.index()].caller;
    while let Some(index) = current {
        if matches(index) {
            return true;
        }
        current = tree.nodes[index.index()].caller;
    }
    false
}
