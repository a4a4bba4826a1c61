//! Spanning trees for broadcast fan-out.
//!
//! A tree is a list of nodes, each either a leaf hostname or a sub-tree
//! whose root is the first leaf reached by descending leftmost children.
//! Branching factor is bounded by `max_neighbor_nodes`, giving broadcasts
//! O(log_k N) depth.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeNode {
    Host(String),
    Branch(Vec<TreeNode>),
}

impl TreeNode {
    /// First leaf under this node, by leftmost descent.
    pub fn first_host(&self) -> Option<&str> {
        match self {
            TreeNode::Host(h) => Some(h),
            TreeNode::Branch(children) => children.first().and_then(TreeNode::first_host),
        }
    }

    fn collect_hosts(&self, exclude: Option<&str>, out: &mut Vec<String>) {
        match self {
            TreeNode::Host(h) => {
                if exclude != Some(h.as_str()) {
                    out.push(h.clone());
                }
            }
            TreeNode::Branch(children) => {
                for child in children {
                    child.collect_hosts(exclude, out);
                }
            }
        }
    }
}

/// Build a spanning tree over `nodes` with branching factor `max`: the first
/// `max` nodes become roots, the remainder is distributed beneath them in
/// groups of `⌈(n−max)/max⌉`, and any group still exceeding `max` recurses.
/// A branch is a root plus at least one descendant, so factors below 2 are
/// treated as 2.
pub fn make_tree(nodes: &[String], max: usize) -> Vec<TreeNode> {
    let max = max.max(2);
    if nodes.len() <= max {
        return nodes.iter().cloned().map(TreeNode::Host).collect();
    }

    let mut groups: Vec<Vec<String>> = nodes[..max].iter().map(|h| vec![h.clone()]).collect();
    let remaining = nodes.len() - max;
    let per_root = remaining / max + 1;
    let mut i = max;
    let mut j = 0;
    while i < nodes.len() {
        let take = per_root.min(nodes.len() - i);
        groups[j].extend(nodes[i..i + take].iter().cloned());
        i += take;
        j += 1;
    }

    groups
        .into_iter()
        .map(|group| {
            if group.len() == 1 {
                TreeNode::Host(group.into_iter().next().expect("group is non-empty"))
            } else if group.len() <= max {
                TreeNode::Branch(group.into_iter().map(TreeNode::Host).collect())
            } else {
                TreeNode::Branch(make_tree(&group, max))
            }
        })
        .collect()
}

/// First leaf of the whole tree (the host a sender addresses).
pub fn first_host(tree: &[TreeNode]) -> Option<&str> {
    tree.first().and_then(TreeNode::first_host)
}

/// Every host in the tree, in leftmost order.
pub fn all_hosts(tree: &[TreeNode]) -> Vec<String> {
    let mut out = Vec::new();
    for node in tree {
        node.collect_hosts(None, &mut out);
    }
    out
}

/// Remove the first occurrence of `host`, pruning any branch it empties.
/// Returns whether the host was present.
pub fn remove_host(tree: &mut Vec<TreeNode>, host: &str) -> bool {
    let mut removed = false;
    tree.retain_mut(|node| match node {
        TreeNode::Host(h) => {
            if !removed && h == host {
                removed = true;
                false
            } else {
                true
            }
        }
        TreeNode::Branch(children) => {
            if !removed {
                removed = remove_host(children, host);
            }
            !children.is_empty()
        }
    });
    removed
}

/// Rebuild a tree over the surviving hosts after `dead` is excluded,
/// promoting a survivor as the new root. `None` when nothing survives.
/// Removing an already-absent host is a no-op in the host set, so the
/// rebuild is idempotent.
pub fn rebuild_without(tree: &[TreeNode], dead: &str, max: usize) -> Option<Vec<TreeNode>> {
    let mut survivors = Vec::new();
    for node in tree {
        node.collect_hosts(Some(dead), &mut survivors);
    }
    if survivors.is_empty() {
        None
    } else {
        Some(make_tree(&survivors, max))
    }
}

/// Largest list arity anywhere in the tree, for bounding checks.
pub fn max_branching(tree: &[TreeNode]) -> usize {
    let mut max = tree.len();
    for node in tree {
        if let TreeNode::Branch(children) = node {
            max = max.max(max_branching(children));
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("host{i}")).collect()
    }

    #[test]
    fn small_roster_stays_flat() {
        let tree = make_tree(&hosts(3), 4);
        assert_eq!(
            tree,
            vec![
                TreeNode::Host("host0".into()),
                TreeNode::Host("host1".into()),
                TreeNode::Host("host2".into()),
            ]
        );
    }

    #[test]
    fn coverage_is_exact_and_branching_is_bounded() {
        for n in 1..=60 {
            for k in 2..=5 {
                let input = hosts(n);
                let tree = make_tree(&input, k);
                let mut seen = all_hosts(&tree);
                seen.sort();
                let mut expected = input.clone();
                expected.sort();
                assert_eq!(seen, expected, "n={n} k={k}: every host exactly once");
                assert!(max_branching(&tree) <= k, "n={n} k={k}: branching bounded");
            }
        }
    }

    #[test]
    fn first_host_descends_leftmost() {
        let tree = make_tree(&hosts(20), 3);
        assert_eq!(first_host(&tree), Some("host0"));
    }

    #[test]
    fn remove_host_prunes_empty_branches() {
        let mut tree = vec![
            TreeNode::Host("a".into()),
            TreeNode::Branch(vec![TreeNode::Host("b".into())]),
        ];
        assert!(remove_host(&mut tree, "b"));
        assert_eq!(tree, vec![TreeNode::Host("a".into())]);
        assert!(!remove_host(&mut tree, "b"));
    }

    #[test]
    fn rebuild_excludes_the_dead_root_and_promotes_a_survivor() {
        // [A, [B, C, D]] with B dead rebuilds over {A, C, D}
        let tree = vec![
            TreeNode::Host("A".into()),
            TreeNode::Branch(vec![
                TreeNode::Host("B".into()),
                TreeNode::Host("C".into()),
                TreeNode::Host("D".into()),
            ]),
        ];
        let rebuilt = rebuild_without(&tree[1..], "B", 4).unwrap();
        assert_eq!(all_hosts(&rebuilt), vec!["C".to_string(), "D".to_string()]);
        assert_eq!(first_host(&rebuilt), Some("C"));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let tree = make_tree(&hosts(13), 3);
        let once = rebuild_without(&tree, "host4", 3).unwrap();
        let twice = rebuild_without(&once, "host4", 3).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rebuild_of_a_lone_dead_host_is_none() {
        let tree = vec![TreeNode::Host("A".into())];
        assert!(rebuild_without(&tree, "A", 4).is_none());
    }
}
