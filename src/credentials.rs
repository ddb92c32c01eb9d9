//! Session cookies used to authenticate against the comment API.
//!
//! The crawler never inspects these values beyond checking they are present;
//! they are forwarded verbatim as a `Cookie` header.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CrawlError;

const CREDENTIAL_FILE_PREFIX: &str = "bilibili_credential_";
const CREDENTIAL_FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub sessdata: String,
    #[serde(default)]
    pub bili_jct: String,
    #[serde(default)]
    pub buvid3: String,
    #[serde(default)]
    pub dedeuserid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ac_time_value: Option<String>,
}

impl Credential {
    /// Trims every field and rejects blank required ones.
    pub fn validate(mut self) -> Result<Self, CrawlError> {
        let required = [
            ("sessdata", &mut self.sessdata),
            ("bili_jct", &mut self.bili_jct),
            ("buvid3", &mut self.buvid3),
            ("dedeuserid", &mut self.dedeuserid),
        ];
        for (name, value) in required {
            *value = value.trim().to_owned();
            if value.is_empty() {
                return Err(CrawlError::CredentialUnavailable(format!(
                    "cookie field {name} is empty"
                )));
            }
        }
        self.ac_time_value = self
            .ac_time_value
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        Ok(self)
    }

    pub fn cookie_header(&self) -> String {
        let mut header = format!(
            "SESSDATA={}; bili_jct={}; buvid3={}; DedeUserID={}",
            self.sessdata, self.bili_jct, self.buvid3, self.dedeuserid
        );
        if let Some(ac_time_value) = &self.ac_time_value {
            header.push_str("; ac_time_value=");
            header.push_str(ac_time_value);
        }
        header
    }
}

/// Loads the newest `bilibili_credential_*.json` in `dir`. File names carry a
/// sortable timestamp, so the lexicographically last one wins.
pub fn load_latest_credential(dir: &Path) -> Result<Credential, CrawlError> {
    let unavailable = |reason: String| CrawlError::CredentialUnavailable(reason);

    let entries = fs::read_dir(dir)
        .map_err(|err| unavailable(format!("reading {}: {err}", dir.display())))?;

    let latest = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            name.starts_with(CREDENTIAL_FILE_PREFIX) && name.ends_with(CREDENTIAL_FILE_SUFFIX)
        })
        .max()
        .ok_or_else(|| {
            unavailable(format!(
                "no {CREDENTIAL_FILE_PREFIX}*{CREDENTIAL_FILE_SUFFIX} in {}",
                dir.display()
            ))
        })?;

    let path = dir.join(&latest);
    info!(path = %path.display(), "loading credential file");
    let content = fs::read_to_string(&path)
        .map_err(|err| unavailable(format!("reading {}: {err}", path.display())))?;
    let credential: Credential = serde_json::from_str(&content)
        .map_err(|err| unavailable(format!("parsing {}: {err}", path.display())))?;
    credential.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Credential {
        Credential {
            sessdata: "s".into(),
            bili_jct: "j".into(),
            buvid3: "b".into(),
            dedeuserid: "42".into(),
            ac_time_value: None,
        }
    }

    #[test]
    fn cookie_header_includes_optional_value() {
        assert_eq!(
            sample().cookie_header(),
            "SESSDATA=s; bili_jct=j; buvid3=b; DedeUserID=42"
        );
        let mut cred = sample();
        cred.ac_time_value = Some("t".into());
        assert!(cred.cookie_header().ends_with("; ac_time_value=t"));
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let mut cred = sample();
        cred.buvid3 = "  ".into();
        let err = cred.validate().unwrap_err();
        assert_eq!(err.kind(), "CredentialUnavailable");

        let mut cred = sample();
        cred.ac_time_value = Some(" ".into());
        assert!(cred.validate().unwrap().ac_time_value.is_none());
    }

    #[test]
    fn loads_newest_credential_file() {
        let dir = tempdir().unwrap();
        let older = serde_json::json!({"sessdata": "old", "bili_jct": "j", "buvid3": "b", "dedeuserid": "1"});
        let newer = serde_json::json!({"sessdata": "new", "bili_jct": "j", "buvid3": "b", "dedeuserid": "1"});
        fs::write(
            dir.path().join("bilibili_credential_20240101_000000.json"),
            older.to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join("bilibili_credential_20250101_000000.json"),
            newer.to_string(),
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cred = load_latest_credential(dir.path()).unwrap();
        assert_eq!(cred.sessdata, "new");
    }

    #[test]
    fn missing_directory_is_credential_unavailable() {
        let dir = tempdir().unwrap();
        let err = load_latest_credential(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), "CredentialUnavailable");

        let err = load_latest_credential(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "CredentialUnavailable");
    }
}
