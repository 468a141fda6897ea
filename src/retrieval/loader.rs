use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    DocumentSource, DocumentStore, LoadedChunk, LoadedDocument, Metadata, RetrievalError,
    RetrievalResult,
};

/// Extensions loaded as plain text and reported as a known type.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "csv", "rst", "xml", "json", "html", "htm", "go", "py", "java", "sh", "bat",
    "ps1", "cmd", "js", "ts", "css", "cpp", "hpp", "h", "c", "cs", "sql", "log", "ini", "pl",
    "pm", "r", "dart", "dockerfile", "env", "php", "hs", "hsc", "lua", "nginxconf", "conf", "m",
    "mm", "plsql", "perl", "rb", "rs", "db2", "scala", "bash", "swift", "vue", "svelte", "toml",
    "yaml", "yml",
];

/// Formats that need a dedicated parser.
const BINARY_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "epub", "xls", "xlsx"];

const BINARY_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/epub+zip",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

fn extension(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_text_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/json"
}

/// Loads uploads and web pages as a single text chunk.
///
/// Text-like content (by extension or content type) is reported as a known
/// type. Anything else is decoded as UTF-8 on a best-effort basis and
/// flagged as unknown; binary office and PDF formats are rejected.
#[derive(Debug, Clone, Default)]
pub struct PlainTextStore {
    client: reqwest::Client,
}

impl PlainTextStore {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn classify(filename: &str, content_type: Option<&str>) -> RetrievalResult<bool> {
        let ext = extension(filename);
        let content_type = content_type.map(essence).unwrap_or_default();

        if BINARY_EXTENSIONS.contains(&ext.as_str())
            || BINARY_CONTENT_TYPES.contains(&content_type.as_str())
        {
            return Err(RetrievalError::UnsupportedFormat(filename.to_string()));
        }

        Ok(TEXT_EXTENSIONS.contains(&ext.as_str()) || is_text_content_type(&content_type))
    }

    async fn fetch(&self, url: &str) -> RetrievalResult<String> {
        let fetch_error = |e: reqwest::Error| RetrievalError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };
        self.client
            .get(url)
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?
            .text()
            .await
            .map_err(fetch_error)
    }
}

fn single_chunk(source: &str, text: String, known_type: bool) -> LoadedDocument {
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), Value::String(source.to_string()));
    LoadedDocument {
        chunks: vec![LoadedChunk { text, metadata }],
        known_type,
    }
}

#[async_trait]
impl DocumentStore for PlainTextStore {
    async fn load(
        &self,
        source: &DocumentSource,
        content_type: Option<&str>,
    ) -> RetrievalResult<LoadedDocument> {
        let (text, known_type) = match source {
            DocumentSource::Bytes { filename, data } => {
                let known_type = Self::classify(filename, content_type)?;
                let text = std::str::from_utf8(data)
                    .map_err(|_| {
                        warn!("{} is not valid UTF-8", filename);
                        RetrievalError::UnsupportedFormat(filename.clone())
                    })?
                    .to_string();
                (text, known_type)
            }
            DocumentSource::Url(url) => (self.fetch(url).await?, true),
        };
        debug!(
            "Loaded {} ({} bytes, known_type={})",
            source.name(),
            text.len(),
            known_type
        );
        Ok(single_chunk(source.name(), text, known_type))
    }
}
