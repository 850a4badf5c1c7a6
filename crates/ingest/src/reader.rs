use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

use crate::chunk::Document;

pub struct FileReader;

impl FileReader {
    pub async fn read_file(path: &Path) -> Result<String> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match extension {
            "txt" | "md" => {
                let content = fs::read_to_string(path)
                    .await
                    .context(format!("Failed to read file: {:?}", path))?;
                Ok(content)
            }
            _ => anyhow::bail!("Unsupported file format: {}", extension),
        }
    }

    /// Read a file into a `Document` identified by its path
    pub async fn read_document(path: &Path) -> Result<Document> {
        let content = Self::read_file(path).await?;
        let id = crate::generate_doc_id(&path.to_string_lossy());
        Ok(Document::new(id, content))
    }
}
