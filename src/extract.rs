//! Text extraction seam in front of the ingest pipeline.
//!
//! The engine ingests plain text; turning PDFs and Office documents into
//! text is an external collaborator's job. [`TextExtractor`] is that seam:
//! the built-in implementation passes raw content through, reads text-like
//! files, and fetches URLs, while binary formats are rejected with a
//! pointer to the `content` field.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::models::DocType;

/// Where the document's bytes come from.
#[derive(Debug, Clone)]
pub enum IngestSource {
    /// Text supplied inline with the request.
    Content(String),
    /// An uploaded file already persisted under the documents directory.
    File(PathBuf),
    /// A URL to fetch.
    Url(String),
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, source: &IngestSource, doc_type: DocType) -> Result<String>;
}

/// Default extractor: inline content, UTF-8 files, and URL bodies.
pub struct PlainTextExtractor {
    client: reqwest::Client,
}

impl PlainTextExtractor {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, source: &IngestSource, doc_type: DocType) -> Result<String> {
        match source {
            IngestSource::Content(text) => Ok(text.clone()),
            IngestSource::File(path) => match doc_type {
                DocType::Text | DocType::Markdown | DocType::Raw => {
                    Ok(std::fs::read_to_string(path)?)
                }
                DocType::Pdf | DocType::Docx => Err(EngineError::InvalidInput(format!(
                    "{} extraction requires an external converter; supply extracted text via the content field",
                    doc_type.as_str()
                ))),
                DocType::Url => Err(EngineError::InvalidInput(
                    "doc_type url does not accept file uploads".to_string(),
                )),
            },
            IngestSource::Url(url) => {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| EngineError::UpstreamTransient(e.to_string()))?;

                if !resp.status().is_success() {
                    return Err(EngineError::Upstream(format!(
                        "fetching {} returned {}",
                        url,
                        resp.status()
                    )));
                }

                resp.text()
                    .await
                    .map_err(|e| EngineError::Upstream(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_content_passes_through() {
        let extractor = PlainTextExtractor::new(5).unwrap();
        let text = extractor
            .extract(
                &IngestSource::Content("hello world".to_string()),
                DocType::Raw,
            )
            .await
            .unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_text_file_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("note.md");
        std::fs::write(&path, "# heading\n\nbody").unwrap();

        let extractor = PlainTextExtractor::new(5).unwrap();
        let text = extractor
            .extract(&IngestSource::File(path), DocType::Markdown)
            .await
            .unwrap();
        assert!(text.contains("# heading"));
    }

    #[tokio::test]
    async fn test_binary_formats_rejected() {
        let extractor = PlainTextExtractor::new(5).unwrap();
        let err = extractor
            .extract(
                &IngestSource::File(PathBuf::from("/tmp/whatever.pdf")),
                DocType::Pdf,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
