//! Tree Builder
//!
//! Turns the flat group/item maps into a rooted forest with per-node
//! aggregates. Pure: called on every Entity Store change.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::domain::{Group, GroupId, Item};

/// A group plus its ordered children and subtree aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct GroupNode {
    pub group: Group,
    pub children: Vec<GroupNode>,
    /// Items owned directly by this group
    pub direct_item_count: usize,
    pub direct_weight: f64,
    /// Items in this group and all descendants
    pub item_count: usize,
    pub total_weight: f64,
}

impl GroupNode {
    /// Number of nodes in this subtree, self included
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(GroupNode::node_count).sum::<usize>()
    }

    pub fn find(&self, id: GroupId) -> Option<&GroupNode> {
        if self.group.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

/// Build the forest of group trees.
///
/// A parent id that names no known group makes the group a root. Groups
/// stuck in a parent cycle are promoted to roots so that every group
/// appears exactly once.
pub fn build_forest<'a, I>(groups: I, items: &HashMap<GroupId, Vec<Item>>) -> Vec<GroupNode>
where
    I: IntoIterator<Item = &'a Group>,
{
    let groups: Vec<&Group> = groups.into_iter().collect();
    let known: HashSet<GroupId> = groups.iter().map(|g| g.id).collect();

    // Build parent -> children map
    let mut children_map: HashMap<Option<GroupId>, Vec<&Group>> = HashMap::new();
    for group in &groups {
        let parent = group.parent_id.filter(|p| *p != group.id && known.contains(p));
        children_map.entry(parent).or_default().push(group);
    }

    // Sort children by position
    for children in children_map.values_mut() {
        children.sort_by(|a, b| sibling_order(a, b));
    }

    let mut visited = HashSet::with_capacity(groups.len());
    let mut forest = Vec::new();
    if let Some(roots) = children_map.get(&None) {
        for root in roots {
            forest.push(assemble(root, &children_map, items, &mut visited));
        }
    }

    let mut stranded: Vec<&Group> = groups.iter().copied().filter(|g| !visited.contains(&g.id)).collect();
    stranded.sort_by(|a, b| sibling_order(a, b));
    for group in stranded {
        if !visited.contains(&group.id) {
            forest.push(assemble(group, &children_map, items, &mut visited));
        }
    }

    forest
}

fn assemble(
    group: &Group,
    children_map: &HashMap<Option<GroupId>, Vec<&Group>>,
    items: &HashMap<GroupId, Vec<Item>>,
    visited: &mut HashSet<GroupId>,
) -> GroupNode {
    visited.insert(group.id);

    let mut children = Vec::new();
    if let Some(kids) = children_map.get(&Some(group.id)) {
        for kid in kids {
            if !visited.contains(&kid.id) {
                children.push(assemble(kid, children_map, items, visited));
            }
        }
    }

    let own = items.get(&group.id).map(Vec::as_slice).unwrap_or(&[]);
    let direct_item_count = own.len();
    let direct_weight: f64 = own.iter().map(|i| i.weight).sum();

    // Post-order: children are complete before the parent sums them
    let item_count = direct_item_count + children.iter().map(|c| c.item_count).sum::<usize>();
    let total_weight = direct_weight + children.iter().map(|c| c.total_weight).sum::<f64>();

    GroupNode {
        group: group.clone(),
        children,
        direct_item_count,
        direct_weight,
        item_count,
        total_weight,
    }
}

fn sibling_order(a: &Group, b: &Group) -> Ordering {
    a.position
        .cmp(&b.position)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

/// Render the forest as (node, depth) pairs in display order
pub fn flatten(forest: &[GroupNode]) -> Vec<(&GroupNode, usize)> {
    fn collect<'a>(nodes: &'a [GroupNode], depth: usize, result: &mut Vec<(&'a GroupNode, usize)>) {
        for node in nodes {
            result.push((node, depth));
            collect(&node.children, depth + 1, result);
        }
    }

    let mut result = Vec::new();
    collect(forest, 0, &mut result);
    result
}

pub fn find_node(forest: &[GroupNode], id: GroupId) -> Option<&GroupNode> {
    forest.iter().find_map(|root| root.find(id))
}

pub fn node_count(forest: &[GroupNode]) -> usize {
    forest.iter().map(GroupNode::node_count).sum()
}
