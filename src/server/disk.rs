//! Read/write view over one local directory.
//!
//! `GET`/`HEAD` serve files (octet-stream with explicit `Content-Length`
//! and `Last-Modified`) and render directories as JSON listings; `PUT`
//! atomically replaces a file when the service is writable. Paths
//! containing traversal, and dotfiles when disallowed, are blocked before
//! any filesystem access.

use crate::server::error::{Error, Result};
use crate::server::service::{
    HttpRequest, HttpResponse, RequestHandle, RequestMetadata, Service,
};
use crate::util::{escape_json_string, http_time};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use http::{HeaderValue, Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Serves one directory tree.
pub struct DiskDirectoryService {
    root: PathBuf,
    writable: bool,
    allow_dotfiles: bool,
}

impl DiskDirectoryService {
    pub(crate) fn new(root: PathBuf, writable: bool, allow_dotfiles: bool) -> Self {
        Self {
            root,
            writable,
            allow_dotfiles,
        }
    }

    /// Decode and vet the URL path. `None` means the path is blocked:
    /// traversal, undecodable segments, or dotfiles when disallowed.
    fn parse_path(&self, path: &str) -> Option<Vec<String>> {
        let mut segments = Vec::new();
        for raw in path.split('/').filter(|s| !s.is_empty()) {
            let segment = percent_decode_str(raw).decode_utf8().ok()?;
            if segment == "." || segment == ".." || segment.contains('/') || segment.contains('\0')
            {
                return None;
            }
            if !self.allow_dotfiles && segment.starts_with('.') {
                return None;
            }
            segments.push(segment.into_owned());
        }
        Some(segments)
    }

    fn resolve(&self, segments: &[String]) -> PathBuf {
        let mut path = self.root.clone();
        for segment in segments {
            path.push(segment);
        }
        path
    }

    async fn get(&self, segments: &[String], include_body: bool) -> Result<HttpResponse> {
        let path = self.resolve(segments);
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return Ok(error_response(StatusCode::NOT_FOUND, "Not Found"));
        };

        if meta.is_file() {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/octet-stream")
                // Set Content-Length explicitly so in-process callers (a
                // worker probing with HEAD) can query the size without a
                // real HTTP connection in between.
                .header(CONTENT_LENGTH, meta.len());
            if let Ok(modified) = meta.modified() {
                response = response.header(LAST_MODIFIED, http_time(modified));
            }
            let body = if include_body {
                Bytes::from(
                    tokio::fs::read(&path)
                        .await
                        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?,
                )
            } else {
                Bytes::new()
            };
            return Ok(response.body(body).expect("static response headers"));
        }

        if meta.is_dir() {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/json");
            if let Ok(modified) = meta.modified() {
                response = response.header(LAST_MODIFIED, http_time(modified));
            }
            let body = if include_body {
                Bytes::from(self.list_directory(&path).await?)
            } else {
                Bytes::new()
            };
            return Ok(response.body(body).expect("static response headers"));
        }

        // Sockets, devices and pipes are not servable.
        Ok(error_response(StatusCode::NOT_ACCEPTABLE, "Not Acceptable"))
    }

    async fn list_directory(&self, path: &PathBuf) -> Result<String> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| Error::io(format!("listing {}", path.display()), e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("listing {}", path.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.allow_dotfiles && name.starts_with('.') {
                continue;
            }
            let kind = match entry.file_type().await {
                Ok(t) => node_kind(t),
                Err(_) => "other",
            };
            entries.push(format!(
                "{{\"name\":\"{}\",\"type\":\"{kind}\"}}",
                escape_json_string(&name)
            ));
        }
        Ok(format!("[{}]", entries.join(",")))
    }

    async fn put(&self, segments: &[String], body: Bytes) -> Result<HttpResponse> {
        let path = self.resolve(segments);
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidRequest("cannot replace the directory root".into()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;

        // Write to a sibling temp file, then rename over the target, so a
        // concurrent reader sees either the old or the new content.
        let temp = parent.join(format!(".gatehouse-put-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp, &body)
            .await
            .map_err(|e| Error::io(format!("writing {}", temp.display()), e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::io(format!("replacing {}", path.display()), e));
        }

        debug!(path = %path.display(), bytes = body.len(), "file replaced");
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Bytes::new())
            .expect("static response headers"))
    }
}

impl Service for DiskDirectoryService {
    fn start_request(self: Arc<Self>, _metadata: RequestMetadata) -> Box<dyn RequestHandle> {
        Box::new(DiskHandle { service: self })
    }
}

struct DiskHandle {
    service: Arc<DiskDirectoryService>,
}

#[async_trait]
impl RequestHandle for DiskHandle {
    fn describe(&self) -> &'static str {
        "Disk directory services"
    }

    async fn http(self: Box<Self>, req: HttpRequest) -> Result<HttpResponse> {
        let service = &self.service;
        let segments = service.parse_path(req.uri().path());
        let method = req.method().clone();

        if method == Method::GET || method == Method::HEAD {
            match segments {
                None => Ok(error_response(StatusCode::NOT_FOUND, "Not Found")),
                Some(segments) => service.get(&segments, method == Method::GET).await,
            }
        } else if method == Method::PUT {
            if !service.writable {
                return Ok(error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "Method Not Allowed",
                ));
            }
            match segments {
                // Historical wording, kept as-is.
                None => Ok(error_response(StatusCode::FORBIDDEN, "Unauthorized")),
                Some(segments) => service.put(&segments, req.into_body()).await,
            }
        } else {
            Ok(error_response(
                StatusCode::NOT_IMPLEMENTED,
                "Not Implemented",
            ))
        }
    }
}

fn node_kind(file_type: std::fs::FileType) -> &'static str {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return "blockDevice";
        }
        if file_type.is_char_device() {
            return "characterDevice";
        }
        if file_type.is_fifo() {
            return "namedPipe";
        }
        if file_type.is_socket() {
            return "socket";
        }
    }
    if file_type.is_file() {
        "file"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else {
        "other"
    }
}

fn error_response(status: StatusCode, message: &'static str) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(Bytes::from_static(message.as_bytes()))
        .expect("static response headers")
}
