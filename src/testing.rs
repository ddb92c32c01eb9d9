//! Scripted `CommentApi` fake shared by the fetcher, pipeline, and job tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::{ApiError, CommentApi, ReplyPage, ResourceHandle, RootPage};
use crate::comment::Comment;
use crate::identifier::VideoId;

pub(crate) const TEST_AID: i64 = 170001;
pub(crate) const TEST_TITLE: &str = "测试: 视频/标题";

/// A root comment with `reply_count` announced replies.
pub(crate) fn comment(id: i64, reply_count: i64) -> Comment {
    let mut comment = Comment::new(id, 0, 0);
    comment.author = Some(format!("user{id}"));
    comment.text = Some(format!("comment {id}"));
    comment.created_at = Some(1_700_000_000 + id);
    comment.reply_count = reply_count;
    comment
}

pub(crate) fn replying(id: i64, parent_id: i64, root_id: i64) -> Comment {
    let mut reply = comment(id, 0);
    reply.parent_id = parent_id;
    reply.root_id = root_id;
    reply
}

enum Scripted<T> {
    Page(T),
    Fail,
}

#[derive(Default)]
pub(crate) struct ScriptedApi {
    unresolvable: bool,
    roots: HashMap<u32, Scripted<Vec<Comment>>>,
    replies: HashMap<(i64, u32), Scripted<(Vec<Comment>, u64)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn unresolvable(mut self) -> Self {
        self.unresolvable = true;
        self
    }

    pub(crate) fn root_page(mut self, page: u32, items: Vec<Comment>) -> Self {
        self.roots.insert(page, Scripted::Page(items));
        self
    }

    pub(crate) fn failing_root_page(mut self, page: u32) -> Self {
        self.roots.insert(page, Scripted::Fail);
        self
    }

    pub(crate) fn reply_page(mut self, root: i64, page: u32, items: Vec<Comment>, total: u64) -> Self {
        self.replies.insert((root, page), Scripted::Page((items, total)));
        self
    }

    pub(crate) fn failing_reply_page(mut self, root: i64, page: u32) -> Self {
        self.replies.insert((root, page), Scripted::Fail);
        self
    }

    /// Root and reply page requests in the order they were made.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommentApi for ScriptedApi {
    async fn resolve_resource(&self, _video: &VideoId) -> Result<ResourceHandle, ApiError> {
        if self.unresolvable {
            return Err(ApiError::Remote {
                code: -404,
                message: "video not found".into(),
            });
        }
        Ok(ResourceHandle {
            aid: TEST_AID,
            title: TEST_TITLE.into(),
        })
    }

    async fn fetch_root_page(
        &self,
        _resource: &ResourceHandle,
        page: u32,
    ) -> Result<RootPage, ApiError> {
        self.calls.lock().push(format!("root {page}"));
        match self.roots.get(&page) {
            Some(Scripted::Page(items)) => Ok(RootPage {
                items: items.clone(),
                has_more: self.roots.contains_key(&(page + 1)),
            }),
            Some(Scripted::Fail) => Err(ApiError::Transport(format!("root page {page} refused"))),
            None => Ok(RootPage::default()),
        }
    }

    async fn fetch_reply_page(
        &self,
        _resource: &ResourceHandle,
        root_id: i64,
        page: u32,
        _page_size: u32,
    ) -> Result<ReplyPage, ApiError> {
        self.calls.lock().push(format!("reply {root_id}/{page}"));
        match self.replies.get(&(root_id, page)) {
            Some(Scripted::Page((items, total))) => Ok(ReplyPage {
                items: items.clone(),
                total_count: *total,
            }),
            Some(Scripted::Fail) => Err(ApiError::Transport(format!(
                "reply page {root_id}/{page} refused"
            ))),
            None => Ok(ReplyPage::default()),
        }
    }
}
