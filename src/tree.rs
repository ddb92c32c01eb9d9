//! Rebuilds the nested comment forest from the flat store.
//!
//! Parent/child edges are first recorded as slot indices into the store and
//! only turned into owned nested `Comment`s once every edge is known. Nothing
//! ever holds a pointer back to its parent.

use std::collections::HashMap;

use tracing::warn;

use crate::comment::{Comment, CommentStore};

/// Deepest nesting kept in a thread; the thread root sits at depth 0.
///
/// Replies nested deeper are attached directly to their thread root. This
/// keeps the published JSON within what `serde_json` will read back (128
/// levels, two per published level).
pub const MAX_REPLY_DEPTH: usize = 32;

/// Ordered top-level comments, each owning its replies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Forest {
    roots: Vec<Comment>,
}

impl Forest {
    pub fn roots(&self) -> &[Comment] {
        &self.roots
    }

    pub fn into_roots(self) -> Vec<Comment> {
        self.roots
    }

    /// Number of top-level comments.
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Number of comments at every depth.
    pub fn total_count(&self) -> usize {
        self.roots.iter().map(Comment::subtree_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Consumes the store and returns a forest holding every stored comment
/// exactly once, roots ordered by id descending, replies in fetch order.
///
/// Comments whose parent was never collected are repaired into roots with
/// `parent_id` and `root_id` both reset to 0. Replies deeper than
/// [`MAX_REPLY_DEPTH`] are moved under their thread root.
pub fn reconstruct(store: CommentStore) -> Forest {
    let mut comments = store.into_comments();
    for comment in &mut comments {
        comment.children.clear();
    }

    let index: HashMap<i64, usize> = comments
        .iter()
        .enumerate()
        .map(|(slot, comment)| (comment.id, slot))
        .collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); comments.len()];
    let mut parent_of: Vec<Option<usize>> = vec![None; comments.len()];
    let mut roots = Vec::new();

    for slot in 0..comments.len() {
        let parent_id = comments[slot].parent_id;
        if parent_id == 0 {
            roots.push(slot);
            continue;
        }
        match index.get(&parent_id) {
            Some(&parent) if parent != slot => {
                children[parent].push(slot);
                parent_of[slot] = Some(parent);
            }
            _ => {
                warn!(
                    comment = comments[slot].id,
                    parent = parent_id,
                    "parent comment not collected; promoting to root"
                );
                repair_orphan(&mut comments[slot]);
                roots.push(slot);
            }
        }
    }

    // Any slot not reachable from a root sits on a parent cycle. Cutting the
    // first such slot loose makes its whole cycle reachable again.
    let mut reachable = vec![false; comments.len()];
    mark_reachable(&roots, &children, &mut reachable);
    for slot in 0..comments.len() {
        if reachable[slot] {
            continue;
        }
        if let Some(parent) = parent_of[slot].take() {
            children[parent].retain(|&child| child != slot);
        }
        warn!(
            comment = comments[slot].id,
            parent = comments[slot].parent_id,
            "comment sits on a parent cycle; promoting to root"
        );
        repair_orphan(&mut comments[slot]);
        roots.push(slot);
        mark_reachable(&[slot], &children, &mut reachable);
    }

    let flattened = cap_depth(&roots, &mut children, &mut comments);
    if flattened > 0 {
        warn!(
            comments = flattened,
            max_depth = MAX_REPLY_DEPTH,
            "reply chain too deep; attached the deepest replies to their thread root"
        );
    }

    roots.sort_by(|&a, &b| comments[b].id.cmp(&comments[a].id));

    let mut slots: Vec<Option<Comment>> = comments.into_iter().map(Some).collect();
    let roots = roots
        .into_iter()
        .filter_map(|slot| materialize(slot, &mut slots, &children))
        .collect();

    Forest { roots }
}

fn repair_orphan(comment: &mut Comment) {
    comment.parent_id = 0;
    comment.root_id = 0;
}

fn mark_reachable(start: &[usize], children: &[Vec<usize>], reachable: &mut [bool]) {
    let mut stack: Vec<usize> = start.to_vec();
    while let Some(slot) = stack.pop() {
        if reachable[slot] {
            continue;
        }
        reachable[slot] = true;
        stack.extend(children[slot].iter().copied());
    }
}

/// Walks every thread and re-parents replies that would sit deeper than
/// [`MAX_REPLY_DEPTH`] onto the thread root. Returns how many moved.
fn cap_depth(roots: &[usize], children: &mut [Vec<usize>], comments: &mut [Comment]) -> usize {
    let mut parent_of: Vec<Option<usize>> = vec![None; comments.len()];
    let mut moved = 0;
    let mut stack: Vec<(usize, usize, usize)> = roots.iter().map(|&root| (root, 0, root)).collect();
    while let Some((slot, depth, thread)) = stack.pop() {
        for &child in &children[slot] {
            if depth < MAX_REPLY_DEPTH {
                parent_of[child] = Some(slot);
                stack.push((child, depth + 1, thread));
            } else {
                let root_id = comments[thread].id;
                comments[child].parent_id = root_id;
                comments[child].root_id = root_id;
                parent_of[child] = Some(thread);
                stack.push((child, 1, thread));
                moved += 1;
            }
        }
    }
    if moved == 0 {
        return 0;
    }

    // Slot order is fetch order, so rebuilding from it keeps reply order.
    for list in children.iter_mut() {
        list.clear();
    }
    for (slot, parent) in parent_of.into_iter().enumerate() {
        if let Some(parent) = parent {
            children[parent].push(slot);
        }
    }
    moved
}

/// Assembles the owned subtree under `root`, children before parents.
fn materialize(
    root: usize,
    slots: &mut [Option<Comment>],
    children: &[Vec<usize>],
) -> Option<Comment> {
    let mut order = Vec::new();
    let mut stack = vec![root];
    while let Some(slot) = stack.pop() {
        order.push(slot);
        stack.extend(children[slot].iter().copied());
    }
    // Reversed pre-order puts every child ahead of its parent.
    for &slot in order.iter().rev() {
        let replies: Vec<Comment> = children[slot]
            .iter()
            .filter_map(|&child| slots[child].take())
            .collect();
        if let Some(comment) = slots[slot].as_mut() {
            comment.children = replies;
        }
    }
    slots[root].take()
}
