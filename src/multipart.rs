//! Streaming multipart/form-data body for document uploads.

use bytes::Bytes;
use futures::{stream, StreamExt};
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::Result;

const DASHES: &str = "--";
const NEWLINE: &str = "\r\n";

/// A single-part multipart upload read straight from a local file.
#[derive(Clone, Debug)]
pub struct Multipart {
    /// Local file to stream.
    pub file_name: PathBuf,
    /// MIME type of the file contents.
    pub content_type: String,
    /// Name the document is stored under on the server.
    pub document_path: String,
    boundary: String,
}

impl Multipart {
    pub fn new(
        file_name: impl Into<PathBuf>,
        content_type: impl Into<String>,
        document_path: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            document_path: document_path.into(),
            boundary: Uuid::new_v4().to_string(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_disposition(&self) -> String {
        format!(
            "form-data; name=\"defaultName\"; filename=\"{}\"",
            self.document_path
        )
    }

    /// The request `Content-Type` header value.
    pub fn multipart_content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn head(&self) -> String {
        format!(
            "{DASHES}{b}{NEWLINE}Content-Disposition: {cd}{NEWLINE}Content-Type: {ct}{NEWLINE}{NEWLINE}",
            b = self.boundary,
            cd = self.content_disposition(),
            ct = self.content_type,
        )
    }

    fn tail(&self) -> String {
        format!("{NEWLINE}{DASHES}{b}{DASHES}{NEWLINE}", b = self.boundary)
    }

    /// Opens the file and returns a request body that streams it between the
    /// part header and the closing boundary.
    pub async fn into_body(self) -> Result<reqwest::Body> {
        let file = tokio::fs::File::open(&self.file_name).await?;
        let head = stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from(self.head()))]);
        let tail = stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from(self.tail()))]);
        let body = head.chain(ReaderStream::new(file)).chain(tail);
        Ok(reqwest::Body::wrap_stream(body))
    }
}
