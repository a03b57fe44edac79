//! File-system endpoints rooted at `files.root` (the user's home by default).
//!
//! | Method | Path                           | Effect                                   |
//! |--------|--------------------------------|------------------------------------------|
//! | GET    | `/files`, `/files/{path}`      | read a file, or list a directory         |
//! | GET    | `/files/{path}?list=true`      | list a directory                         |
//! | GET    | `/files/{path}?info=true`      | stat (name, size, type, mtime, mode)     |
//! | PUT    | `/files/{path}`                | write a file (atomic)                    |
//! | POST   | `/files/{path}`                | `mkdir`, `touch`, or `copy`              |
//! | DELETE | `/files/{path}?missing_ok=bool`| remove a file or an empty directory      |
//!
//! ## Path resolution
//!
//! `path` is relative to the root; a leading `~` names the root itself.
//! `..` may not climb above the root, and the nearest existing ancestor of
//! the target must still be inside the root after resolving symlinks.
//! Dangling symlinks count as pointing at their target. Violations are 403
//! `PathForbidden`.
//!
//! ## Size limits
//!
//! Reads and writes are capped at `files.max_file_size` (default 2 MB).
//! Binary files are returned/accepted with base64 encoding.
//!
//! ## Atomicity
//!
//! Writes go to a temp file in the target directory and are renamed over the
//! target, so readers never see partial content.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path as UrlPath, Query, State,
    },
    http::StatusCode,
    Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use spyder_remote_protocol::ErrorKind;

use crate::error::ApiError;
use crate::util::expand_tilde;
use crate::AppState;

/// Monotonic counter to uniquify temp file names across concurrent writes.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Query parameters for `GET /files/{path}`.
#[derive(Deserialize, Default)]
pub struct ReadQuery {
    /// List directory contents instead of reading a file.
    #[serde(default)]
    pub list: bool,
    /// Return stat information only.
    #[serde(default)]
    pub info: bool,
}

/// Query parameters for `DELETE /files/{path}`.
#[derive(Deserialize)]
pub struct DeleteQuery {
    /// Succeed when the target does not exist.
    #[serde(default)]
    pub missing_ok: bool,
}

/// Request body for `PUT /files/{path}`.
#[derive(Deserialize)]
pub struct FileWriteRequest {
    /// UTF-8 text, or base64 if `encoding` is `"base64"`.
    pub content: String,
    pub encoding: Option<String>,
    /// Create parent directories if they don't exist.
    #[serde(default)]
    pub create_dirs: bool,
    /// Octal permission string, e.g. `"0644"`.
    pub mode: Option<String>,
}

/// Request body for `POST /files/{path}`.
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileOp {
    Mkdir {
        #[serde(default)]
        parents: bool,
        #[serde(default)]
        exist_ok: bool,
    },
    Touch {
        #[serde(default)]
        truncate: bool,
    },
    Copy {
        destination: String,
    },
}

/// A single directory entry.
#[derive(Serialize)]
pub struct DirEntry {
    pub name: String,
    /// One of `"file"`, `"dir"`, `"symlink"`, or `"other"`.
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    /// Size in bytes (0 for directories).
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

fn root_of(state: &AppState) -> PathBuf {
    PathBuf::from(expand_tilde(&state.config.files.root).as_ref())
}

/// Map a request path onto the root without touching the filesystem.
fn resolve_lexical(root: &Path, raw: &str) -> Result<PathBuf, ApiError> {
    if raw.contains('\0') {
        return Err(ApiError::bad_request("Path contains null bytes"));
    }
    let rel = raw.trim_start_matches('/');
    let rel = if rel == "~" {
        ""
    } else {
        rel.strip_prefix("~/").unwrap_or(rel)
    };

    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(ApiError::forbidden(format!("{raw}: outside the served root")));
                }
                out.pop();
                depth -= 1;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

/// Dangling symlinks followed before giving up.
const MAX_LINK_HOPS: usize = 16;

/// Check that the nearest existing ancestor of `path` (the path itself if it
/// exists) resolves inside the root. A dangling symlink on the way is
/// followed to where it points, since creating through it would write there.
async fn ensure_inside(root: &Path, path: &Path) -> Result<(), ApiError> {
    let real_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| ApiError::from_io(&e, "files root"))?;
    let outside = || {
        ApiError::forbidden(format!(
            "{}: resolves outside the served root",
            path.display()
        ))
    };

    let mut target = path.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        let mut probe = target.clone();
        let mut rest = Vec::new();
        loop {
            if let Ok(real) = tokio::fs::canonicalize(&probe).await {
                return if real.starts_with(&real_root) {
                    Ok(())
                } else {
                    Err(outside())
                };
            }
            let dangling = tokio::fs::symlink_metadata(&probe)
                .await
                .is_ok_and(|m| m.file_type().is_symlink());
            if dangling {
                break;
            }
            match probe.file_name() {
                Some(name) => rest.push(name.to_os_string()),
                None => return Err(outside()),
            }
            if !probe.pop() {
                return Err(outside());
            }
        }

        let link = tokio::fs::read_link(&probe)
            .await
            .map_err(|e| ApiError::from_io(&e, &path.display().to_string()))?;
        let mut next = probe.parent().map(Path::to_path_buf).unwrap_or_default();
        next.push(link);
        next.extend(rest.iter().rev());
        target = next;
    }
    Err(ApiError::forbidden(format!(
        "{}: too many levels of symbolic links",
        path.display()
    )))
}

async fn resolve(state: &AppState, raw: &str) -> Result<PathBuf, ApiError> {
    let root = root_of(state);
    let path = resolve_lexical(&root, raw)?;
    ensure_inside(&root, &path).await?;
    Ok(path)
}

fn epoch_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

fn display(raw: &str) -> String {
    let rel = raw.trim_start_matches('/');
    if rel.is_empty() {
        "~".to_string()
    } else {
        rel.to_string()
    }
}

/// `GET /files` — list the root.
pub async fn get_root(
    State(state): State<AppState>,
    query: Result<Query<ReadQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    read_path(&state, "", &query).await
}

/// `GET /files/{path}`
pub async fn get_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    query: Result<Query<ReadQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    read_path(&state, &raw, &query).await
}

async fn read_path(state: &AppState, raw: &str, query: &ReadQuery) -> Result<Json<Value>, ApiError> {
    let path = resolve(state, raw).await?;
    if query.info {
        return stat(&path, raw).await;
    }
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| ApiError::from_io(&e, &display(raw)))?;
    if query.list || metadata.is_dir() {
        return list_directory(&path, raw).await;
    }
    read_file(&path, raw, &metadata, state.config.files.max_file_size).await
}

async fn stat(path: &Path, raw: &str) -> Result<Json<Value>, ApiError> {
    let link = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| ApiError::from_io(&e, &display(raw)))?;
    let islink = link.file_type().is_symlink();
    let metadata = if islink {
        tokio::fs::metadata(path).await.unwrap_or(link)
    } else {
        link
    };
    let kind = if metadata.is_dir() {
        "dir"
    } else if metadata.is_file() {
        "file"
    } else {
        "other"
    };
    let name = path
        .file_name()
        .map_or_else(|| "~".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(Json(json!({
        "name": name,
        "path": display(raw),
        "size": metadata.len(),
        "type": kind,
        "mtime": metadata.modified().ok().and_then(epoch_secs),
        "mode": format!("{:04o}", metadata.mode() & 0o7777),
        "islink": islink,
    })))
}

/// Read a single file, returning UTF-8 text or base64 for binary.
async fn read_file(
    path: &Path,
    raw: &str,
    metadata: &std::fs::Metadata,
    max_size: usize,
) -> Result<Json<Value>, ApiError> {
    if metadata.len() > max_size as u64 {
        return Err(ApiError::bad_request(format!(
            "File too large ({} bytes, max {max_size})",
            metadata.len()
        )));
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::from_io(&e, &display(raw)))?;

    let (content, encoding) = match String::from_utf8(bytes) {
        Ok(text) => (text, None),
        Err(e) => (
            base64::engine::general_purpose::STANDARD.encode(e.as_bytes()),
            Some("base64"),
        ),
    };
    Ok(Json(json!({
        "path": display(raw),
        "content": content,
        "size": metadata.len(),
        "modified": metadata.modified().ok().and_then(epoch_secs),
        "encoding": encoding,
    })))
}

/// List a directory's contents, sorted by name.
async fn list_directory(path: &Path, raw: &str) -> Result<Json<Value>, ApiError> {
    let mut read_dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| ApiError::from_io(&e, &display(raw)))?;

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        // file_type() does not follow symlinks; metadata() below does.
        let file_type = entry.file_type().await.ok();
        let metadata = tokio::fs::metadata(entry.path()).await.ok();

        let (entry_type, symlink_target) = match file_type {
            Some(t) if t.is_symlink() => {
                let target = tokio::fs::read_link(entry.path())
                    .await
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned());
                ("symlink", target)
            }
            Some(t) if t.is_dir() => ("dir", None),
            Some(t) if t.is_file() => ("file", None),
            _ => ("other", None),
        };

        entries.push(DirEntry {
            name,
            entry_type,
            size: metadata
                .as_ref()
                .filter(|m| !m.is_dir())
                .map_or(0, std::fs::Metadata::len),
            modified: metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(epoch_secs),
            symlink_target,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(json!({
        "path": display(raw),
        "entries": entries,
    })))
}

/// `PUT /files/{path}` — write a file atomically.
pub async fn put_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    payload: Result<Json<FileWriteRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(payload) = payload?;
    let path = resolve(&state, &raw).await?;
    let max = state.config.files.max_file_size;

    let bytes = match payload.encoding.as_deref() {
        Some("base64") => base64::engine::general_purpose::STANDARD
            .decode(&payload.content)
            .map_err(|e| ApiError::bad_request(format!("Invalid base64: {e}")))?,
        None | Some("utf-8" | "text") => payload.content.into_bytes(),
        Some(other) => {
            return Err(ApiError::bad_request(format!("Unknown encoding: {other}")));
        }
    };
    if bytes.len() > max {
        return Err(ApiError::bad_request(format!(
            "Content too large ({} bytes, max {max})",
            bytes.len()
        )));
    }
    let mode = payload
        .mode
        .as_deref()
        .map(|m| {
            u32::from_str_radix(m, 8)
                .map_err(|_| ApiError::bad_request(format!("Invalid octal mode: {m:?}")))
        })
        .transpose()?;

    let parent = path
        .parent()
        .ok_or_else(|| ApiError::bad_request("Cannot write to the root itself"))?;
    if payload.create_dirs {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::from_io(&e, &display(&raw)))?;
    }

    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".srs_tmp_{}_{seq}", std::process::id()));
    tokio::fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| ApiError::from_io(&e, &display(&raw)))?;

    if let Some(mode) = mode {
        if let Err(e) =
            tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode)).await
        {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ApiError::from_io(&e, &display(&raw)));
        }
    }

    if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(ApiError::from_io(&e, &display(&raw)));
    }

    Ok(Json(json!({
        "path": display(&raw),
        "size": bytes.len(),
        "ok": true,
    })))
}

/// `POST /files/{path}` — `mkdir`, `touch`, or `copy`.
pub async fn post_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    op: Result<Json<FileOp>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(op) = op?;
    let path = resolve(&state, &raw).await?;
    let shown = display(&raw);

    match op {
        FileOp::Mkdir { parents, exist_ok } => {
            let result = if parents {
                tokio::fs::create_dir_all(&path).await
            } else {
                tokio::fs::create_dir(&path).await
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && exist_ok => {
                    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                        return Err(ApiError::new(
                            ErrorKind::AlreadyExists,
                            format!("{shown}: exists and is not a directory"),
                        ));
                    }
                }
                Err(e) => return Err(ApiError::from_io(&e, &shown)),
            }
        }
        FileOp::Touch { truncate } => {
            let mut options = tokio::fs::OpenOptions::new();
            options.create(true).write(true);
            if truncate {
                options.truncate(true);
            } else {
                options.append(true);
            }
            options
                .open(&path)
                .await
                .map_err(|e| ApiError::from_io(&e, &shown))?;
        }
        FileOp::Copy { destination } => {
            let dest = resolve(&state, &destination).await?;
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| ApiError::from_io(&e, &shown))?;
            if metadata.is_dir() {
                return Err(ApiError::bad_request(format!(
                    "{shown}: copying directories is not supported"
                )));
            }
            if metadata.len() > state.config.files.max_file_size as u64 {
                return Err(ApiError::bad_request(format!(
                    "{shown}: file too large to copy"
                )));
            }
            tokio::fs::copy(&path, &dest)
                .await
                .map_err(|e| ApiError::from_io(&e, &display(&destination)))?;
            return Ok((
                StatusCode::CREATED,
                Json(json!({"path": display(&destination), "ok": true})),
            ));
        }
    }
    Ok((StatusCode::CREATED, Json(json!({"path": shown, "ok": true}))))
}

/// `DELETE /files/{path}` — remove a file or an empty directory.
pub async fn delete_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<StatusCode, ApiError> {
    let Query(query) = query?;
    let root = root_of(&state);
    let path = resolve_lexical(&root, &raw)?;
    if path == root {
        return Err(ApiError::forbidden("Cannot delete the served root"));
    }
    // A symlink is removed itself, so only its directory has to be inside.
    if let Some(parent) = path.parent() {
        ensure_inside(&root, parent).await?;
    }

    let shown = display(&raw);
    let metadata = match tokio::fs::symlink_metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && query.missing_ok => {
            return Ok(StatusCode::NO_CONTENT);
        }
        Err(e) => return Err(ApiError::from_io(&e, &shown)),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    result.map_err(|e| ApiError::from_io(&e, &shown))?;
    Ok(StatusCode::NO_CONTENT)
}
