//! Maps reconstructed comments onto the published JSON record shape.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::comment::Comment;

/// Shown when a comment carries no usable author name.
pub const UNKNOWN_USER: &str = "未知用户";
/// Shown when a comment's timestamp is missing or out of range.
pub const UNKNOWN_TIME: &str = "未知时间";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Timestamps are rendered in the platform's home zone (China Standard Time).
const PLATFORM_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// The externally published comment record. Field order is part of the
/// format consumers rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedComment {
    #[serde(rename = "评论ID")]
    pub id: i64,
    #[serde(rename = "用户名")]
    pub username: String,
    #[serde(rename = "评论内容")]
    pub message: String,
    #[serde(rename = "点赞数")]
    pub likes: i64,
    #[serde(rename = "回复时间")]
    pub replied_at: String,
    #[serde(rename = "父评论ID")]
    pub parent_id: i64,
    pub replies: Vec<PublishedComment>,
}

/// Transcodes a comment and its replies in their current order.
pub fn transcode(comment: &Comment) -> PublishedComment {
    let replies = transcode_forest(&comment.children);
    publish(comment, replies)
}

/// One level of the walk: a comment whose replies are being transcoded, or
/// the forest itself when `node` is `None`.
struct Frame<'a> {
    node: Option<&'a Comment>,
    children: &'a [Comment],
    done: Vec<PublishedComment>,
}

impl<'a> Frame<'a> {
    fn new(node: Option<&'a Comment>, children: &'a [Comment]) -> Self {
        Self {
            node,
            children,
            done: Vec::with_capacity(children.len()),
        }
    }
}

/// Transcodes every root with an explicit stack, so thread depth never
/// turns into call depth.
pub fn transcode_forest(roots: &[Comment]) -> Vec<PublishedComment> {
    let mut stack = vec![Frame::new(None, roots)];
    while let Some(mut frame) = stack.pop() {
        if let Some(next) = frame.children.get(frame.done.len()) {
            stack.push(frame);
            stack.push(Frame::new(Some(next), &next.children));
            continue;
        }
        let Some(node) = frame.node else {
            return frame.done;
        };
        let published = publish(node, frame.done);
        if let Some(parent) = stack.last_mut() {
            parent.done.push(published);
        }
    }
    Vec::new()
}

fn publish(comment: &Comment, replies: Vec<PublishedComment>) -> PublishedComment {
    PublishedComment {
        id: comment.id,
        username: comment
            .author
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_USER)
            .to_owned(),
        message: comment.text.clone().unwrap_or_default(),
        likes: comment.like_count,
        replied_at: format_timestamp(comment.created_at),
        parent_id: resolve_parent(comment),
        replies,
    }
}

/// The direct parent when known, otherwise the thread root, otherwise 0.
fn resolve_parent(comment: &Comment) -> i64 {
    if comment.parent_id != 0 {
        comment.parent_id
    } else {
        comment.root_id
    }
}

/// Epoch seconds to `YYYY-MM-DD HH:MM:SS`; `0` counts as missing.
pub fn format_timestamp(epoch: Option<i64>) -> String {
    let Some(epoch) = epoch.filter(|&secs| secs != 0) else {
        return UNKNOWN_TIME.to_owned();
    };
    let Some(offset) = FixedOffset::east_opt(PLATFORM_UTC_OFFSET_SECS) else {
        return UNKNOWN_TIME.to_owned();
    };
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .map(|utc| utc.with_timezone(&offset).format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| UNKNOWN_TIME.to_owned())
}
