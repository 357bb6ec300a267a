//! `multipart/form-data` encoding for file uploads

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::path::Path;

/// A file part: field name, file name, content type and contents
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field_name: String,
    pub file_name: String,
    pub content_type: mime::Mime,
    pub data: Bytes,
}

impl FilePart {
    /// Build a part from in-memory bytes, guessing nothing about the type
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            content_type: mime::APPLICATION_OCTET_STREAM,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: mime::Mime) -> Self {
        self.content_type = content_type;
        self
    }

    /// Read a file from disk into a part named `field_name`
    ///
    /// The content type is derived from the file extension.
    ///
    /// # Errors
    /// Returns the I/O error if the file cannot be read.
    pub async fn from_path(
        field_name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map_or_else(|| "file".to_owned(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(field_name, file_name, data).with_content_type(guess_mime(path)))
    }
}

/// Content type for a handful of common extensions, octet-stream otherwise
fn guess_mime(path: &Path) -> mime::Mime {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("json") => mime::APPLICATION_JSON,
        Some("txt") => mime::TEXT_PLAIN_UTF_8,
        Some("csv") => mime::TEXT_CSV_UTF_8,
        Some("html" | "htm") => mime::TEXT_HTML_UTF_8,
        Some("png") => mime::IMAGE_PNG,
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("gif") => mime::IMAGE_GIF,
        Some("svg") => mime::IMAGE_SVG,
        Some("pdf") => mime::APPLICATION_PDF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

/// Encoded multipart body plus the matching `Content-Type` header value
#[derive(Debug, Clone)]
pub struct MultipartForm {
    boundary: String,
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    #[must_use]
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = format!(
            "apikit-{:016x}{:016x}",
            rng.random::<u64>(),
            rng.random::<u64>()
        );
        Self {
            boundary,
            fields: Vec::new(),
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `multipart/form-data; boundary=...`
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encode all parts; text fields first, then files
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let files_len: usize = self.files.iter().map(|f| f.data.len() + 256).sum();
        let mut buf = BytesMut::with_capacity(files_len + self.fields.len() * 128);

        for (name, value) in &self.fields {
            self.put_boundary(&mut buf);
            buf.put_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    escape_quoted(name)
                )
                .as_bytes(),
            );
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        for file in &self.files {
            self.put_boundary(&mut buf);
            buf.put_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: {}\r\n\r\n",
                    escape_quoted(&file.field_name),
                    escape_quoted(&file.file_name),
                    file.content_type
                )
                .as_bytes(),
            );
            buf.put_slice(&file.data);
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        buf.freeze()
    }

    fn put_boundary(&self, buf: &mut BytesMut) {
        buf.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
    }
}

/// Percent-encode the characters that would break a quoted header parameter
fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
