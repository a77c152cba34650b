//! Media materializer: downloads item media and caption sidecars to disk.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data>/<owner>/image/<id>.<ext>
//! <data>/<owner>/image/<post>_p<n>.<ext>   (carousel child n)
//! <data>/<owner>/video/<id>.<ext>
//! <data>/<owner>/{image,video}/<id>.txt    (caption sidecar)
//! ```
//!
//! Owner and id are reduced to `[A-Za-z0-9_-]` before touching the
//! filesystem. File extensions come from the downloaded bytes, not the URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pagerelay::{value_as_id, DedupLedger, MaterializeSummary, Materializer, RelayResult, TaggedItem};
use serde_json::Value;

/// Extensions looked for when checking whether an item is already on disk.
const SAVED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "mp4"];

/// Timestamps above this are taken as milliseconds, below as seconds.
const MILLIS_THRESHOLD: i64 = 999_999_999_999;

/// Guess a file extension from leading magic bytes.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 4 {
        return None;
    }
    match bytes {
        [0xff, 0xd8, ..] => Some("jpg"),
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("webp"),
        [0x00, 0x00, 0x00, _, b'f', b't', b'y', b'p', ..] => Some("mp4"),
        [b'I', b'D', b'3', ..] => Some("mp3"),
        _ => None,
    }
}

/// Make an owner or item id safe to use as a single path component.
pub fn safe_segment(raw: &str) -> String {
    raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Render a seconds-or-milliseconds epoch timestamp for caption files.
pub fn format_timestamp(value: Option<&Value>) -> String {
    let Some(raw) = value.and_then(Value::as_f64) else {
        return "N/A".to_string();
    };
    let raw = raw as i64;
    if raw == 0 {
        return "N/A".to_string();
    }
    let millis = if raw > MILLIS_THRESHOLD {
        Some(raw)
    } else {
        raw.checked_mul(1000)
    };
    match millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(dt) => dt.format("%d/%m/%Y %I:%M:%S %p").to_string(),
        None => "N/A".to_string(),
    }
}

/// Ids among `ids` that already have a media file for `owner` on disk.
pub fn saved_ids(root: &Path, owner: &str, ids: &[String]) -> Vec<String> {
    let base = root.join(safe_segment(owner));
    let image_dir = base.join("image");
    let video_dir = base.join("video");
    ids.iter()
        .filter(|id| {
            let stem = safe_segment(id);
            SAVED_EXTENSIONS.iter().any(|ext| {
                image_dir.join(format!("{stem}.{ext}")).exists()
                    || (*ext == "mp4" && video_dir.join(format!("{stem}.{ext}")).exists())
            })
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn dir(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    fn default_extension(self) -> &'static str {
        match self {
            MediaKind::Image => "jpg",
            MediaKind::Video => "mp4",
        }
    }
}

/// One file to fetch for an item.
#[derive(Debug, Clone, PartialEq)]
struct MediaJob {
    url: String,
    kind: MediaKind,
    /// File stem, without extension.
    stem: String,
    /// Carousel children do not mark the post as saved.
    is_main: bool,
}

fn media_of(obj: &Value) -> Option<(String, MediaKind)> {
    let non_empty = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    non_empty("video")
        .map(|u| (u, MediaKind::Video))
        .or_else(|| non_empty("image").map(|u| (u, MediaKind::Image)))
}

/// Jobs for an item whose sanitized id is `post_id`.
fn media_jobs(item: &TaggedItem, post_id: &str) -> Vec<MediaJob> {
    let fields = Value::Object(item.fields.clone());
    let mut jobs = Vec::new();

    if let Some((url, kind)) = media_of(&fields) {
        jobs.push(MediaJob {
            url,
            kind,
            stem: post_id.to_string(),
            is_main: true,
        });
    }

    if let Some(Value::Array(children)) = item.get("carousel") {
        for (index, child) in children.iter().enumerate() {
            if child.get("id").and_then(value_as_id).is_none() {
                continue;
            }
            if let Some((url, kind)) = media_of(child) {
                jobs.push(MediaJob {
                    url,
                    kind,
                    stem: format!("{post_id}_p{}", index + 1),
                    is_main: false,
                });
            }
        }
    }

    jobs
}

fn caption_text(item: &TaggedItem) -> Option<String> {
    if item.get("accessibility_caption").is_none() && item.get("caption").is_none() {
        return None;
    }
    let text = ["accessibility_caption", "caption"]
        .iter()
        .filter_map(|k| item.get(k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or("(No caption)");
    let created = item.get("taken_at_timestamp").or_else(|| item.get("created_at"));
    let count = |key: &str| match item.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(v) if !v.is_null() => v.to_string(),
        _ => "N/A".to_string(),
    };

    Some(format!(
        "Caption text: {text}\nCreated: {}\nLikes: {}\nComments: {}\n",
        format_timestamp(created),
        count("like_count"),
        count("comment_count"),
    ))
}

/// Downloads media with `reqwest` into a data directory.
#[derive(Debug, Clone)]
pub struct HttpMaterializer {
    root: PathBuf,
    client: reqwest::Client,
}

impl HttpMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            root: root.into(),
            client,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(format!("received status code {status}"));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("no data".to_string());
        }
        Ok(bytes.to_vec())
    }

    async fn download(&self, base: &Path, job: &MediaJob) -> Result<PathBuf, String> {
        let bytes = self.fetch(&job.url).await?;
        let ext = sniff_extension(&bytes).unwrap_or_else(|| {
            tracing::warn!(
                "Could not determine type for {}, defaulting to .{}",
                job.url,
                job.kind.default_extension()
            );
            job.kind.default_extension()
        });
        let path = base.join(job.kind.dir()).join(format!("{}.{ext}", job.stem));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("writing {}: {e}", path.display()))?;
        Ok(path)
    }

    async fn materialize_item(
        &self,
        item: &TaggedItem,
        ledger: &dyn DedupLedger,
        summary: &mut MaterializeSummary,
    ) {
        let Some(id) = item.id() else {
            summary.errors.push("item without id".to_string());
            return;
        };
        if item.username.is_empty() {
            summary.errors.push(format!("item {id} without username"));
            return;
        }

        let base = self.root.join(safe_segment(&item.username));
        let stem = safe_segment(&id);
        for dir in ["image", "video"] {
            if let Err(e) = tokio::fs::create_dir_all(base.join(dir)).await {
                summary
                    .errors
                    .push(format!("creating directories for {}: {e}", item.username));
                return;
            }
        }

        for job in media_jobs(item, &stem) {
            match self.download(&base, &job).await {
                Ok(path) => {
                    tracing::debug!("Downloaded {} for {}", path.display(), item.username);
                    summary.downloaded += 1;
                    if job.is_main {
                        if let Err(e) = ledger.record(&item.username, &id) {
                            summary.errors.push(format!("recording {id}: {e}"));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Error downloading {}: {e}", job.url);
                    summary.errors.push(format!("{}: {e}", job.url));
                }
            }
        }

        if let Some(caption) = caption_text(item) {
            let has = |key: &str| item.get(key).and_then(Value::as_str).is_some_and(|s| !s.is_empty());
            let dir = if has("image") {
                base.join("image")
            } else if has("video") {
                base.join("video")
            } else {
                base.clone()
            };
            let path = dir.join(format!("{stem}.txt"));
            match tokio::fs::write(&path, caption).await {
                Ok(()) => summary.downloaded += 1,
                Err(e) => summary.errors.push(format!("writing caption {id}: {e}")),
            }
        }
    }
}

#[async_trait]
impl Materializer for HttpMaterializer {
    async fn materialize(
        &self,
        api_name: &str,
        items: &[TaggedItem],
        ledger: &dyn DedupLedger,
    ) -> RelayResult<MaterializeSummary> {
        tracing::info!("Materializing {} item(s) for {api_name}", items.len());
        tokio::fs::create_dir_all(&self.root).await?;

        let mut summary = MaterializeSummary::default();
        for item in items {
            self.materialize_item(item, ledger, &mut summary).await;
        }

        tracing::info!(
            "Download process finished. Downloaded: {}, Errors: {}",
            summary.downloaded,
            summary.errors.len()
        );
        Ok(summary)
    }
}
