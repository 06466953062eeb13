//! `FILE_ACTION` dispatch.
//!
//! Every action resolves `path` (and `dest` for `zip`) through the same
//! [`Jail`] as `cd`, so nothing outside the root is ever touched.
//!
//! | Action     | Result `data`                                      |
//! |------------|----------------------------------------------------|
//! | `read`     | `{path, content (base64), size, modified}`         |
//! | `write`    | `{path, size}`, atomic temp-file + rename          |
//! | `list`     | `{path, entries: [{name, type, size, modified}]}`  |
//! | `delete`   | `{path}` (file or empty directory)                 |
//! | `mkdir`    | `{path}` (parents created)                         |
//! | `zip`      | `{path, dest, size}`                               |
//! | `checksum` | `{path, sha256, size}`                             |
//! | `upload`   | `{path, received, complete}`                       |
//! | `download` | no reply on success; a `FILE_CHUNK` sequence       |

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::config::FilesConfig;
use crate::error::RelayError;
use crate::jail::Jail;
use crate::tunnel::frame::{decode_bytes, encode_bytes, FileAction, FileOp, Frame, Message, RpcResponse};

/// Monotonic counter to uniquify temp file names across concurrent writes.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

const HASH_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FileSettings {
    pub max_file_size: u64,
    pub chunk_size: usize,
}

impl From<&FilesConfig> for FileSettings {
    fn from(c: &FilesConfig) -> Self {
        Self {
            max_file_size: c.max_file_size,
            chunk_size: c.chunk_size,
        }
    }
}

#[derive(Serialize)]
struct DirEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: &'static str,
    size: u64,
    modified: Option<u64>,
}

/// Handle one `FILE_ACTION`. Downloads stream their own frames through
/// `outbound` and only produce a response envelope on failure.
pub async fn handle(
    request_id: &str,
    action: &FileAction,
    settings: &FileSettings,
    outbound: &mpsc::Sender<Message>,
) -> Option<RpcResponse> {
    let result = match &action.op {
        FileOp::Download { chunk_size } => {
            let chunk = chunk_size.unwrap_or(settings.chunk_size).clamp(1, 4 * 1024 * 1024);
            match download(request_id, action, chunk, outbound).await {
                Ok(()) => return None,
                Err(e) => Err(e),
            }
        }
        _ => dispatch(action, settings).await,
    };
    Some(match result {
        Ok(data) => RpcResponse::success(request_id, data),
        Err(e) => {
            info!(action = action.op.name(), code = e.code(), "File action failed: {e}");
            RpcResponse::error(request_id, e.code(), e.to_string())
        }
    })
}

/// Run a non-download action and return its result `data`.
pub async fn dispatch(action: &FileAction, settings: &FileSettings) -> Result<Value, RelayError> {
    let jail = Jail::new(&action.root)?;
    let path = jail.resolve_from_root(&action.path)?;
    debug!(action = action.op.name(), path = %path.display(), "File action");

    match &action.op {
        FileOp::Read => read_file(&path, settings.max_file_size).await,
        FileOp::Write {
            content,
            create_dirs,
        } => {
            let bytes = decode_content(content)?;
            check_size(bytes.len() as u64, settings.max_file_size)?;
            write_atomic(&path, &bytes, *create_dirs).await?;
            Ok(json!({"path": path.display().to_string(), "size": bytes.len()}))
        }
        FileOp::List => list_directory(&path).await,
        FileOp::Delete => {
            if path == jail.root() {
                return Err(RelayError::JailViolation(action.path.clone()));
            }
            let meta = tokio::fs::symlink_metadata(&path).await?;
            if meta.is_dir() {
                tokio::fs::remove_dir(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            Ok(json!({"path": path.display().to_string()}))
        }
        FileOp::Mkdir => {
            tokio::fs::create_dir_all(&path).await?;
            Ok(json!({"path": path.display().to_string()}))
        }
        FileOp::Zip { dest } => {
            let dest = jail.resolve_from_root(dest)?;
            let (src, out) = (path.clone(), dest.clone());
            let size = tokio::task::spawn_blocking(move || zip_path(&src, &out))
                .await
                .map_err(|e| RelayError::Remote {
                    code: "ZIP_FAILED".into(),
                    message: e.to_string(),
                })??;
            Ok(json!({
                "path": path.display().to_string(),
                "dest": dest.display().to_string(),
                "size": size,
            }))
        }
        FileOp::Checksum => {
            let (sha256, size) = hash_file(&path).await?;
            Ok(json!({"path": path.display().to_string(), "sha256": sha256, "size": size}))
        }
        FileOp::Upload {
            data,
            offset,
            is_last,
        } => upload_chunk(&path, &decode_content(data)?, *offset, *is_last, settings.max_file_size).await,
        FileOp::Download { .. } => Err(RelayError::Protocol(
            "download is streamed, not dispatched".into(),
        )),
    }
}

fn decode_content(content: &str) -> Result<Vec<u8>, RelayError> {
    decode_bytes(content).map_err(|e| RelayError::Protocol(e.to_string()))
}

fn check_size(size: u64, max: u64) -> Result<(), RelayError> {
    if size > max {
        return Err(RelayError::Remote {
            code: "FILE_TOO_LARGE".into(),
            message: format!("{size} bytes exceeds the {max} byte limit"),
        });
    }
    Ok(())
}

fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

async fn read_file(path: &Path, max_size: u64) -> Result<Value, RelayError> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        return Err(RelayError::Remote {
            code: "IS_DIRECTORY".into(),
            message: "path is a directory, use list".into(),
        });
    }
    check_size(metadata.len(), max_size)?;
    let bytes = tokio::fs::read(path).await?;
    Ok(json!({
        "path": path.display().to_string(),
        "content": encode_bytes(&bytes),
        "size": bytes.len(),
        "modified": metadata.modified().ok().and_then(unix_secs),
    }))
}

/// List a directory's contents, sorted by name.
async fn list_directory(path: &Path) -> Result<Value, RelayError> {
    let mut read_dir = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        // file_type() uses lstat, so symlinks are reported as such.
        let file_type = entry.file_type().await.ok();
        let metadata = entry.metadata().await.ok();
        let entry_type = match file_type {
            Some(t) if t.is_symlink() => "symlink",
            Some(t) if t.is_dir() => "dir",
            Some(t) if t.is_file() => "file",
            _ => "other",
        };
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            entry_type,
            size: metadata.as_ref().map_or(0, std::fs::Metadata::len),
            modified: metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(unix_secs),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(json!({"path": path.display().to_string(), "entries": entries}))
}

/// Write to a temp file in the same directory, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8], create_dirs: bool) -> Result<(), RelayError> {
    let parent = path.parent().unwrap_or(Path::new("/"));
    if create_dirs {
        tokio::fs::create_dir_all(parent).await?;
    }
    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".revtun_tmp_{}_{seq}", std::process::id()));
    if let Err(e) = tokio::fs::write(&temp_path, bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

fn upload_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "upload".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.revtun-upload"))
}

/// Append one upload chunk. Offset 0 starts over; later chunks must land
/// exactly at the end of what was received so far.
async fn upload_chunk(
    path: &Path,
    data: &[u8],
    offset: u64,
    is_last: bool,
    max_size: u64,
) -> Result<Value, RelayError> {
    let temp_path = upload_temp_path(path);
    let received = offset + data.len() as u64;
    if let Err(e) = check_size(received, max_size) {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    let mut file = if offset == 0 {
        tokio::fs::File::create(&temp_path).await?
    } else {
        let current = match tokio::fs::metadata(&temp_path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if current != offset {
            return Err(RelayError::Remote {
                code: "OFFSET_MISMATCH".into(),
                message: format!("expected offset {current}, got {offset}"),
            });
        }
        tokio::fs::OpenOptions::new().append(true).open(&temp_path).await?
    };
    file.write_all(data).await?;
    file.flush().await?;
    drop(file);

    if is_last {
        tokio::fs::rename(&temp_path, path).await?;
        info!(path = %path.display(), size = received, "Upload complete");
    }
    Ok(json!({
        "path": path.display().to_string(),
        "received": received,
        "complete": is_last,
    }))
}

/// Streaming SHA-256 in 64 KiB blocks. Returns (lowercase hex, size).
async fn hash_file(path: &Path) -> Result<(String, u64), RelayError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex_encode(&hasher.finalize()), size))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn zip_failed(e: impl std::fmt::Display) -> RelayError {
    RelayError::Remote {
        code: "ZIP_FAILED".into(),
        message: e.to_string(),
    }
}

/// Deflate `src` (file or directory tree) into `dest`. Symlinks are skipped
/// so the archive cannot pull in anything from outside the jail.
fn zip_path(src: &Path, dest: &Path) -> Result<u64, RelayError> {
    let meta = std::fs::symlink_metadata(src)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(dest)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let base = src.parent().unwrap_or(src);

    if meta.is_dir() {
        for entry in WalkDir::new(src) {
            let entry = entry.map_err(zip_failed)?;
            let entry_path = entry.path();
            if entry_path == dest || entry.file_type().is_symlink() {
                continue;
            }
            let name = entry_path
                .strip_prefix(base)
                .map_err(zip_failed)?
                .to_string_lossy()
                .into_owned();
            if entry.file_type().is_dir() {
                zip.add_directory(format!("{name}/"), options).map_err(zip_failed)?;
            } else {
                zip.start_file(name, options).map_err(zip_failed)?;
                append_file(&mut zip, entry_path)?;
            }
        }
    } else if meta.is_file() {
        let name = src
            .file_name()
            .map_or_else(|| "file".into(), |n| n.to_string_lossy().into_owned());
        zip.start_file(name, options).map_err(zip_failed)?;
        append_file(&mut zip, src)?;
    } else {
        return Err(zip_failed("source is neither a file nor a directory"));
    }

    let file = zip.finish().map_err(zip_failed)?;
    Ok(file.metadata()?.len())
}

fn append_file(zip: &mut ZipWriter<std::fs::File>, path: &Path) -> Result<(), RelayError> {
    let mut f = std::fs::File::open(path)?;
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        zip.write_all(&buf[..n])?;
    }
}

/// Stream a file as `FILE_CHUNK` frames. Failures before the first chunk are
/// returned to the caller so they can go out as an error envelope.
async fn download(
    request_id: &str,
    action: &FileAction,
    chunk_size: usize,
    outbound: &mpsc::Sender<Message>,
) -> Result<(), RelayError> {
    let jail = Jail::new(&action.root)?;
    let path = jail.resolve_from_root(&action.path)?;
    let mut file = tokio::fs::File::open(&path).await?;
    if file.metadata().await?.is_dir() {
        return Err(RelayError::Remote {
            code: "IS_DIRECTORY".into(),
            message: "cannot download a directory".into(),
        });
    }

    let mut buf = vec![0u8; chunk_size];
    let mut pending: Option<Vec<u8>> = None;
    let mut sent = 0u64;
    loop {
        let n = read_full(&mut file, &mut buf).await?;
        // One chunk of lookahead so the final frame carries isLast.
        if let Some(prev) = pending.take() {
            sent += prev.len() as u64;
            send_chunk(outbound, request_id, &prev, n == 0).await?;
        }
        if n == 0 {
            if sent == 0 {
                send_chunk(outbound, request_id, &[], true).await?;
            }
            break;
        }
        pending = Some(buf[..n].to_vec());
    }
    info!(path = %path.display(), bytes = sent, "Download streamed");
    Ok(())
}

/// Fill `buf` as far as the file allows; returns 0 only at EOF.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn send_chunk(
    outbound: &mpsc::Sender<Message>,
    request_id: &str,
    data: &[u8],
    is_last: bool,
) -> Result<(), RelayError> {
    let frame = Frame::FileChunk {
        request_id: request_id.to_string(),
        data: encode_bytes(data),
        is_last,
    };
    outbound
        .send(frame.into())
        .await
        .map_err(|_| RelayError::ChannelLoss("channel closed during download".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::frame::RpcStatus;

    fn settings() -> FileSettings {
        FileSettings {
            max_file_size: 1024,
            chunk_size: 4,
        }
    }

    fn action(root: &Path, path: &str, op: FileOp) -> FileAction {
        FileAction {
            root: root.display().to_string(),
            path: path.into(),
            op,
        }
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let root = tempfile::tempdir().unwrap();
        let s = settings();

        let data = dispatch(
            &action(
                root.path(),
                "a/b.txt",
                FileOp::Write {
                    content: encode_bytes(b"hello"),
                    create_dirs: true,
                },
            ),
            &s,
        )
        .await
        .unwrap();
        assert_eq!(data["size"], 5);

        let data = dispatch(&action(root.path(), "a/b.txt", FileOp::Read), &s).await.unwrap();
        assert_eq!(decode_bytes(data["content"].as_str().unwrap()).unwrap(), b"hello");

        std::fs::write(root.path().join("a/a.txt"), b"x").unwrap();
        std::fs::create_dir(root.path().join("a/dir")).unwrap();
        let data = dispatch(&action(root.path(), "a", FileOp::List), &s).await.unwrap();
        let names: Vec<&str> = data["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["a.txt", "b.txt", "dir"]);
        assert_eq!(data["entries"][2]["type"], "dir");

        dispatch(&action(root.path(), "a/b.txt", FileOp::Delete), &s).await.unwrap();
        assert!(!root.path().join("a/b.txt").exists());
        let err = dispatch(&action(root.path(), "a/b.txt", FileOp::Read), &s).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_paths_outside_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let target = other.path().join("victim.txt");
        let err = dispatch(
            &action(
                root.path(),
                target.to_str().unwrap(),
                FileOp::Write {
                    content: encode_bytes(b"x"),
                    create_dirs: false,
                },
            ),
            &settings(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::JailViolation(_)));
        assert!(!target.exists());

        let err = dispatch(&action(root.path(), ".", FileOp::Delete), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::JailViolation(_)));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let root = tempfile::tempdir().unwrap();
        let big = encode_bytes(&[0u8; 2048]);
        let err = dispatch(
            &action(
                root.path(),
                "big.bin",
                FileOp::Write {
                    content: big,
                    create_dirs: false,
                },
            ),
            &settings(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_checksum() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("f"), b"abc").unwrap();
        let data = dispatch(&action(root.path(), "f", FileOp::Checksum), &settings())
            .await
            .unwrap();
        assert_eq!(
            data["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(data["size"], 3);
    }

    #[tokio::test]
    async fn test_chunked_upload() {
        let root = tempfile::tempdir().unwrap();
        let s = settings();
        let upload = |data: &[u8], offset: u64, is_last: bool| {
            action(
                root.path(),
                "up.txt",
                FileOp::Upload {
                    data: encode_bytes(data),
                    offset,
                    is_last,
                },
            )
        };

        dispatch(&upload(b"hel", 0, false), &s).await.unwrap();
        let err = dispatch(&upload(b"xx", 7, false), &s).await.unwrap_err();
        assert_eq!(err.code(), "OFFSET_MISMATCH");
        assert!(!root.path().join("up.txt").exists());

        let data = dispatch(&upload(b"lo", 3, true), &s).await.unwrap();
        assert_eq!(data["received"], 5);
        assert_eq!(std::fs::read(root.path().join("up.txt")).unwrap(), b"hello");
        assert!(!upload_temp_path(&root.path().join("up.txt")).exists());
    }

    #[tokio::test]
    async fn test_zip_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("site/css")).unwrap();
        std::fs::write(root.path().join("site/index.html"), b"<html>").unwrap();
        std::fs::write(root.path().join("site/css/a.css"), b"body{}").unwrap();

        let data = dispatch(
            &action(
                root.path(),
                "site",
                FileOp::Zip {
                    dest: "backup/site.zip".into(),
                },
            ),
            &settings(),
        )
        .await
        .unwrap();
        assert!(data["size"].as_u64().unwrap() > 0);

        let file = std::fs::File::open(root.path().join("backup/site.zip")).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["site/", "site/css/", "site/css/a.css", "site/index.html"]);
    }

    #[tokio::test]
    async fn test_download_streams_chunks() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("f.bin"), b"0123456789").unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let reply = handle(
            "r1",
            &action(root.path(), "f.bin", FileOp::Download { chunk_size: None }),
            &settings(),
            &tx,
        )
        .await;
        assert!(reply.is_none());
        drop(tx);

        let mut bytes = Vec::new();
        let mut lasts = Vec::new();
        while let Some(Message::Frame(Frame::FileChunk { request_id, data, is_last })) = rx.recv().await {
            assert_eq!(request_id, "r1");
            bytes.extend(decode_bytes(&data).unwrap());
            lasts.push(is_last);
        }
        assert_eq!(bytes, b"0123456789");
        assert_eq!(lasts, [false, false, true]);
    }

    #[tokio::test]
    async fn test_download_errors_become_envelope() {
        let root = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let reply = handle(
            "r2",
            &action(root.path(), "missing", FileOp::Download { chunk_size: None }),
            &settings(),
            &tx,
        )
        .await
        .unwrap();
        assert_eq!(reply.status, RpcStatus::Error);
        assert_eq!(reply.code.as_deref(), Some("NOT_FOUND"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_download_sends_single_last_chunk() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("empty"), b"").unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        assert!(handle(
            "r3",
            &action(root.path(), "empty", FileOp::Download { chunk_size: None }),
            &settings(),
            &tx,
        )
        .await
        .is_none());
        let Some(Message::Frame(Frame::FileChunk { data, is_last, .. })) = rx.recv().await else {
            panic!("expected a chunk");
        };
        assert!(data.is_empty());
        assert!(is_last);
    }
}
