use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use flowchat_core::error::{FlowError, Result};
use flowchat_core::flow::FlowDocument;
use flowchat_core::traits::FlowSource;

/// Loads flows from disk.
///
/// A file path serves the same flow to every assistant. A directory serves
/// `{dir}/{assistant_id}.json`.
pub struct FileFlowSource {
    path: PathBuf,
}

impl FileFlowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self, assistant_id: &str) -> Result<PathBuf> {
        if !self.path.is_dir() {
            return Ok(self.path.clone());
        }
        let file_name = format!("{}.json", assistant_id);
        if file_name.contains(['/', '\\']) || assistant_id.starts_with('.') {
            return Err(FlowError::FlowLoad(format!(
                "invalid assistant id: {}",
                assistant_id
            )));
        }
        Ok(self.path.join(file_name))
    }
}

impl FlowSource for FileFlowSource {
    fn load_flow(&self, assistant_id: &str) -> BoxFuture<'_, Result<FlowDocument>> {
        let path = self.resolve(assistant_id);
        Box::pin(async move {
            let path = path?;
            debug!(path = %path.display(), "Loading flow");
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                FlowError::FlowLoad(format!("{}: {}", path.display(), e))
            })?;
            FlowDocument::from_json(&content)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_test_utils::{write_flow, yes_no_flow};

    #[tokio::test]
    async fn test_file_serves_every_assistant() {
        let (_dir, path) = write_flow(&yes_no_flow());
        let source = FileFlowSource::new(&path);
        let doc = source.load_flow("anyone").await.unwrap();
        assert_eq!(doc.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_directory_serves_per_assistant() {
        let (dir, path) = write_flow(&yes_no_flow());
        std::fs::rename(&path, dir.path().join("asst-1.json")).unwrap();
        let source = FileFlowSource::new(dir.path());

        assert!(source.load_flow("asst-1").await.is_ok());
        assert!(matches!(
            source.load_flow("asst-2").await,
            Err(FlowError::FlowLoad(_))
        ));
        assert!(matches!(
            source.load_flow("../etc").await,
            Err(FlowError::FlowLoad(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_flow_is_flow_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FileFlowSource::new(&path).load_flow("a").await,
            Err(FlowError::FlowLoad(_))
        ));
    }
}
