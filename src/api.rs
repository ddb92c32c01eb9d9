//! Remote comment API seam.
//!
//! `CommentApi` is the only thing the fetcher knows about the platform. The
//! production implementation, `BiliHttpApi`, issues blocking `ureq` requests
//! on the blocking pool; tests substitute a scripted fake.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task;
use tracing::{debug, warn};

use crate::comment::Comment;
use crate::credentials::Credential;
use crate::identifier::VideoId;

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
const REFERER: &str = "https://www.bilibili.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Reply resource type for ordinary videos.
const VIDEO_RESOURCE_TYPE: &str = "1";
const ROOT_PAGE_SIZE: u32 = 20;

/// Numeric handle of a video plus the title used to name the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub aid: i64,
    pub title: String,
}

#[derive(Debug, Clone, Default)]
pub struct RootPage {
    pub items: Vec<Comment>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReplyPage {
    pub items: Vec<Comment>,
    /// Size of the whole sub-thread as reported by the platform.
    pub total_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("platform returned code {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("request task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait CommentApi: Send + Sync {
    async fn resolve_resource(&self, video: &VideoId) -> Result<ResourceHandle, ApiError>;

    async fn fetch_root_page(
        &self,
        resource: &ResourceHandle,
        page: u32,
    ) -> Result<RootPage, ApiError>;

    async fn fetch_reply_page(
        &self,
        resource: &ResourceHandle,
        root_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<ReplyPage, ApiError>;
}

/// `CommentApi` backed by the public web endpoints.
#[derive(Clone)]
pub struct BiliHttpApi {
    agent: ureq::Agent,
    base: String,
    cookie: String,
}

impl BiliHttpApi {
    pub fn new(base: impl Into<String>, credential: &Credential) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            base: base.into().trim_end_matches('/').to_owned(),
            cookie: credential.cookie_header(),
        }
    }

    /// Runs a GET on the blocking pool and returns the envelope's `data`.
    async fn get_data(
        &self,
        path: &'static str,
        query: Vec<(&'static str, String)>,
    ) -> Result<Value, ApiError> {
        let this = self.clone();
        task::spawn_blocking(move || this.get_data_blocking(path, &query))
            .await
            .map_err(|err| ApiError::Task(err.to_string()))?
    }

    fn get_data_blocking(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base, path);
        debug!(%url, ?query, "requesting");
        let mut request = self
            .agent
            .get(&url)
            .set("Cookie", &self.cookie)
            .set("Referer", REFERER);
        for (key, value) in query {
            request = request.query(key, value);
        }

        let response = request
            .call()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let body: Value = response
            .into_json()
            .map_err(|err| ApiError::Malformed(format!("{url}: {err}")))?;

        let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_owned();
            return Err(ApiError::Remote { code, message });
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl CommentApi for BiliHttpApi {
    async fn resolve_resource(&self, video: &VideoId) -> Result<ResourceHandle, ApiError> {
        let data = self
            .get_data("/x/web-interface/view", vec![("bvid", video.to_string())])
            .await?;
        let aid = data
            .get("aid")
            .and_then(Value::as_i64)
            .ok_or_else(|| ApiError::Malformed(format!("no aid for {video}")))?;
        let title = data
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(video.as_str())
            .to_owned();
        Ok(ResourceHandle { aid, title })
    }

    async fn fetch_root_page(
        &self,
        resource: &ResourceHandle,
        page: u32,
    ) -> Result<RootPage, ApiError> {
        let data = self
            .get_data(
                "/x/v2/reply",
                vec![
                    ("type", VIDEO_RESOURCE_TYPE.to_owned()),
                    ("oid", resource.aid.to_string()),
                    ("pn", page.to_string()),
                    ("ps", ROOT_PAGE_SIZE.to_string()),
                    ("sort", "0".to_owned()),
                ],
            )
            .await?;
        let items = parse_items(&data);
        let has_more = match page_info(&data) {
            Some((num, size, count)) => num.saturating_mul(size) < count,
            None => !items.is_empty(),
        };
        Ok(RootPage { items, has_more })
    }

    async fn fetch_reply_page(
        &self,
        resource: &ResourceHandle,
        root_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<ReplyPage, ApiError> {
        let data = self
            .get_data(
                "/x/v2/reply/reply",
                vec![
                    ("type", VIDEO_RESOURCE_TYPE.to_owned()),
                    ("oid", resource.aid.to_string()),
                    ("root", root_id.to_string()),
                    ("pn", page.to_string()),
                    ("ps", page_size.to_string()),
                ],
            )
            .await?;
        let items = parse_items(&data);
        let total_count = page_info(&data).map(|(_, _, count)| count).unwrap_or(0);
        Ok(ReplyPage { items, total_count })
    }
}

/// `data.replies` may be `null` on the last page; items without an id are
/// dropped with a warning.
fn parse_items(data: &Value) -> Vec<Comment> {
    let Some(raw) = data.get("replies").and_then(Value::as_array) else {
        return Vec::new();
    };
    raw.iter()
        .filter_map(|item| {
            let parsed = Comment::from_wire(item);
            if parsed.is_none() {
                warn!("skipping reply item without rpid");
            }
            parsed
        })
        .collect()
}

/// `(num, size, count)` from `data.page`.
fn page_info(data: &Value) -> Option<(u64, u64, u64)> {
    let page = data.get("page")?;
    let field = |key: &str| page.get(key).and_then(Value::as_u64);
    Some((field("num")?, field("size")?, field("count")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_items_handles_null_and_bad_entries() {
        assert!(parse_items(&json!({ "replies": null })).is_empty());
        let data = json!({ "replies": [ { "rpid": 1 }, { "nope": true }, { "rpid": 2, "parent": 1 } ] });
        let ids: Vec<i64> = parse_items(&data).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn page_info_reads_counts() {
        let data = json!({ "page": { "num": 2, "size": 10, "count": 35 } });
        assert_eq!(page_info(&data), Some((2, 10, 35)));
        assert_eq!(page_info(&json!({})), None);
    }

    #[test]
    fn base_url_is_normalized() {
        let api = BiliHttpApi::new("http://localhost:9000/", &Credential::default());
        assert_eq!(api.base, "http://localhost:9000");
    }
}
