//! Streams log bundles to an HTTP response.

use crate::model::Task;
use axum::body::Body;
use axum::response::Response;
use futures::TryStreamExt;
use http::{StatusCode, header};
use shared::errors::{ErrorClass, chain_message};
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const MULTI_DOWNLOAD_FILENAME: &str = "logs.zip";

/// Bytes buffered between the archive writer and the response body.
const ARCHIVE_PIPE_BYTES: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("nothing to download")]
    Empty,
    #[error("could not read log bundle")]
    Io(#[from] std::io::Error),
    #[error("could not build archive")]
    Zip(#[from] zip::result::ZipError),
    #[error("invalid response header")]
    Header(#[from] http::Error),
}

impl ErrorClass for DownloadError {
    fn code(&self) -> &'static str {
        match self {
            DownloadError::Empty => "api.logs.download.empty",
            _ => "api.logs.download.failed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            DownloadError::Empty => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Responds with the bundles of the given tasks. A single bundle is sent as is,
/// several are packed into one archive of flattened file names, streamed as it
/// is written.
pub async fn stream_bundles(tasks: &[Task]) -> Result<Response, DownloadError> {
    let paths: Vec<PathBuf> = tasks
        .iter()
        .filter_map(|t| t.log_store_path.as_ref().map(PathBuf::from))
        .collect();

    match (tasks, paths.as_slice()) {
        ([task], [path]) => {
            let file = tokio::fs::File::open(path).await?;
            attachment(file, &task.target.download_filename())
        }
        (_, []) => Err(DownloadError::Empty),
        _ => {
            // Missing bundles fail the request before any header is sent.
            for path in &paths {
                tokio::fs::metadata(path).await?;
            }

            let (reader, writer) = tokio::io::duplex(ARCHIVE_PIPE_BYTES);
            let out = SyncIoBridge::new(writer);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = write_archive(&paths, out) {
                    tracing::error!(error = %chain_message(&e), "log archive interrupted");
                }
            });
            attachment(reader, MULTI_DOWNLOAD_FILENAME)
        }
    }
}

fn attachment<R>(reader: R, filename: &str) -> Result<Response, DownloadError>
where
    R: AsyncRead + Send + 'static,
{
    let body = ReaderStream::new(reader).inspect_err(|e| {
        tracing::error!(error = %e, "log download interrupted");
    });
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(body))?;
    Ok(response)
}

/// Writes the files into an archive on a non-seekable writer. Runs on a
/// blocking thread.
fn write_archive<W: Write>(paths: &[PathBuf], out: W) -> Result<(), DownloadError> {
    let mut archive = ZipWriter::new_stream(out);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    let mut used = HashSet::new();
    for path in paths {
        let name = unique_name(path, &mut used);
        archive.start_file(name, options)?;
        let mut source = File::open(path)?;
        std::io::copy(&mut source, &mut archive)?;
    }

    archive.finish()?;
    Ok(())
}

fn unique_name(path: &Path, used: &mut HashSet<String>) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle.zip".to_string());
    if used.insert(base.clone()) {
        return base;
    }

    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
        None => (base.clone(), String::new()),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem}-{n}{ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Target, TaskState};
    use http_body_util::BodyExt;
    use std::io::{Cursor, Read, Write};
    use topology::types::NodeKind;

    fn write_bundle(dir: &Path, group: i64, name: &str, content: &str) -> String {
        let dir = dir.join(group.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("kv.log", options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
        zip.finish().unwrap();
        path.to_string_lossy().into_owned()
    }

    fn task(id: i64, ip: &str, path: Option<String>) -> Task {
        Task {
            id,
            task_group_id: 1,
            target: Target {
                kind: NodeKind::Kv,
                ip: ip.into(),
                port: 20160,
                status_port: 20180,
            },
            state: TaskState::Finished,
            error: None,
            log_store_path: path,
            slow_log_store_path: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn disposition(response: &Response) -> String {
        response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn body(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_single_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), 1, "10.0.0.2-20160.zip", "hello\n");

        let response = stream_bundles(&[task(1, "10.0.0.2", Some(path.clone()))])
            .await
            .unwrap();
        assert_eq!(
            disposition(&response),
            "attachment; filename=\"logs-kv-10.0.0.2-20160.zip\""
        );
        assert_eq!(body(response).await, std::fs::read(path).unwrap());
    }

    #[tokio::test]
    async fn test_multiple_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_bundle(dir.path(), 1, "10.0.0.2-20160.zip", "one\n");
        let second = write_bundle(dir.path(), 2, "10.0.0.2-20160.zip", "two\n");
        let third = write_bundle(dir.path(), 1, "10.0.0.3-20160.zip", "three\n");
        let tasks = [
            task(1, "10.0.0.2", Some(first)),
            task(2, "10.0.0.2", Some(second.clone())),
            task(3, "10.0.0.3", Some(third)),
        ];

        let response = stream_bundles(&tasks).await.unwrap();
        assert_eq!(disposition(&response), "attachment; filename=\"logs.zip\"");

        let mut archive = zip::ZipArchive::new(Cursor::new(body(response).await)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "10.0.0.2-20160-1.zip",
                "10.0.0.2-20160.zip",
                "10.0.0.3-20160.zip"
            ]
        );

        let mut inner = Vec::new();
        archive
            .by_name("10.0.0.2-20160-1.zip")
            .unwrap()
            .read_to_end(&mut inner)
            .unwrap();
        assert_eq!(inner, std::fs::read(second).unwrap());
    }

    #[tokio::test]
    async fn test_nothing_to_download() {
        let err = stream_bundles(&[task(1, "10.0.0.2", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Empty));
        assert!(matches!(
            stream_bundles(&[]).await.unwrap_err(),
            DownloadError::Empty
        ));
    }

    #[tokio::test]
    async fn test_missing_bundle_fails_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let present = write_bundle(dir.path(), 1, "10.0.0.2-20160.zip", "one\n");
        let missing = dir.path().join("1/10.0.0.3-20160.zip");
        let tasks = [
            task(1, "10.0.0.2", Some(present)),
            task(2, "10.0.0.3", Some(missing.to_string_lossy().into_owned())),
        ];

        let err = stream_bundles(&tasks).await.unwrap_err();
        assert!(
            matches!(&err, DownloadError::Io(e) if e.kind() == std::io::ErrorKind::NotFound),
            "{err:?}"
        );
        assert_eq!(err.code(), "api.logs.download.failed");
    }

    #[tokio::test]
    async fn test_large_archive_streams_through_pipe() {
        let dir = tempfile::tempdir().unwrap();
        // Each bundle alone is larger than the pipe buffer.
        let content = "x".repeat(3 * ARCHIVE_PIPE_BYTES);
        let tasks: Vec<Task> = (0..3)
            .map(|i| {
                let ip = format!("10.0.0.{i}");
                let name = format!("{ip}-20160.zip");
                task(i, &ip, Some(write_bundle(dir.path(), 1, &name, &content)))
            })
            .collect();

        let response = stream_bundles(&tasks).await.unwrap();
        let bytes = body(response).await;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);

        let mut inner = Vec::new();
        archive
            .by_name("10.0.0.1-20160.zip")
            .unwrap()
            .read_to_end(&mut inner)
            .unwrap();
        assert_eq!(
            inner,
            std::fs::read(tasks[1].log_store_path.as_ref().unwrap()).unwrap()
        );
    }

    #[test]
    fn test_unique_name() {
        let mut used = HashSet::new();
        assert_eq!(unique_name(Path::new("/a/x.zip"), &mut used), "x.zip");
        assert_eq!(unique_name(Path::new("/b/x.zip"), &mut used), "x-1.zip");
        assert_eq!(unique_name(Path::new("/c/x.zip"), &mut used), "x-2.zip");
        assert_eq!(unique_name(Path::new("/c/noext"), &mut used), "noext");
    }
}
