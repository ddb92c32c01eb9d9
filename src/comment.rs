//! Comment records and the flat store a crawl accumulates them in.
//!
//! The remote API hands back loosely typed JSON. Every field except the id is
//! read leniently so a single malformed attribute never drops a comment; the
//! transcoder later substitutes documented defaults for whatever is missing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One comment as received from the platform.
///
/// `children` is always empty at ingestion time and only populated by the
/// tree reconstructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    /// `0` means "no parent".
    pub parent_id: i64,
    /// Top-level ancestor hint, `0` for root comments.
    pub root_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub like_count: i64,
    /// Epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Reported size of the reply sub-thread; `> 0` means it must be paged.
    pub reply_count: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Comment>,
}

impl Comment {
    /// Builds a bare comment, mostly useful for fixtures and fakes.
    pub fn new(id: i64, parent_id: i64, root_id: i64) -> Self {
        Self {
            id,
            parent_id,
            root_id,
            author: None,
            text: None,
            like_count: 0,
            created_at: None,
            reply_count: 0,
            children: Vec::new(),
        }
    }

    /// Reads a comment out of a raw reply object (`rpid`, `parent`, `root`,
    /// `member.uname`, `content.message`, `like`, `ctime`, `rcount`).
    ///
    /// Returns `None` only when the item has no usable integer `rpid`, since
    /// without a key it cannot enter the store.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let id = int_field(value, "rpid")?;
        Some(Self {
            id,
            parent_id: int_field(value, "parent").unwrap_or(0),
            root_id: int_field(value, "root").unwrap_or(0),
            author: value
                .pointer("/member/uname")
                .and_then(Value::as_str)
                .map(str::to_owned),
            text: value
                .pointer("/content/message")
                .and_then(Value::as_str)
                .map(str::to_owned),
            like_count: int_field(value, "like").unwrap_or(0),
            created_at: int_field(value, "ctime"),
            reply_count: int_field(value, "rcount").unwrap_or(0),
            children: Vec::new(),
        })
    }

    /// Number of comments in this subtree, the node itself included.
    pub fn subtree_len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(comment) = stack.pop() {
            count += 1;
            stack.extend(comment.children.iter());
        }
        count
    }
}

/// Accepts integers, integral floats, and numeric strings; the platform has
/// shipped all three for id fields over the years.
fn int_field(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Flat, id-keyed map of every comment seen during one crawl.
///
/// Re-inserting an id overwrites the stored record but keeps the slot it was
/// first seen in, so iteration order stays the original fetch order.
#[derive(Debug, Clone, Default)]
pub struct CommentStore {
    comments: Vec<Comment>,
    index: HashMap<i64, usize>,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites. Returns `true` when the id was new.
    pub fn insert(&mut self, mut comment: Comment) -> bool {
        comment.children.clear();
        match self.index.get(&comment.id) {
            Some(&slot) => {
                self.comments[slot] = comment;
                false
            }
            None => {
                self.index.insert(comment.id, self.comments.len());
                self.comments.push(comment);
                true
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<&Comment> {
        self.index.get(&id).map(|&slot| &self.comments[slot])
    }

    pub fn contains(&self, id: i64) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    /// Comments in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &Comment> {
        self.comments.iter()
    }

    pub fn into_comments(self) -> Vec<Comment> {
        self.comments
    }
}

impl FromIterator<Comment> for CommentStore {
    fn from_iter<I: IntoIterator<Item = Comment>>(iter: I) -> Self {
        let mut store = CommentStore::new();
        for comment in iter {
            store.insert(comment);
        }
        store
    }
}
