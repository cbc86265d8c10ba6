//! Image pull and build.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;

use crate::engine::{BUILD_FILE_NAME, ContainerEngine, EngineError, ProgressStream};
use crate::environment::archive::BuildContext;
use crate::environment::error::{EnvironmentError, Result};
use crate::environment::sink::OutputSink;

/// An image reference usable to start containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Pulled reference or locally built tag.
    pub reference: String,
}

impl Image {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

/// Pulls reference images and builds local ones.
pub struct ImageManager {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn OutputSink>,
}

impl ImageManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, sink: Arc<dyn OutputSink>) -> Self {
        Self { engine, sink }
    }

    /// Pull `reference`, returning once every layer is present.
    pub async fn pull(&self, reference: &str) -> Result<Image> {
        tracing::info!("Pulling image: {}", reference);

        let stream = self.engine.pull_image(reference);
        self.drain_progress(reference, stream)
            .await
            .map_err(|source| EnvironmentError::Pull {
                image: reference.to_string(),
                source,
            })?;

        tracing::info!("Pulled image: {}", reference);
        Ok(Image::new(reference))
    }

    /// Build `source_dir` into an image tagged `tag`.
    ///
    /// The directory must contain a `Dockerfile` at its root.
    pub async fn build(&self, tag: &str, source_dir: &Path) -> Result<Image> {
        let context =
            BuildContext::from_dir(source_dir).map_err(|source| EnvironmentError::BuildContext {
                tag: tag.to_string(),
                source,
            })?;

        if !context.contains(BUILD_FILE_NAME) {
            return Err(EnvironmentError::MissingBuildFile {
                tag: tag.to_string(),
                file: BUILD_FILE_NAME,
                dir: source_dir.to_path_buf(),
            });
        }

        let archive = context
            .to_archive()
            .map_err(|source| EnvironmentError::BuildContext {
                tag: tag.to_string(),
                source,
            })?;

        tracing::info!(
            "Building image '{}' from {} ({} files, {} bytes)",
            tag,
            source_dir.display(),
            context.len(),
            context.total_size()
        );

        let stream = self.engine.build_image(archive, tag);
        self.drain_progress(tag, stream)
            .await
            .map_err(|source| EnvironmentError::Build {
                tag: tag.to_string(),
                source,
            })?;

        tracing::info!("Built image: {}", tag);
        Ok(Image::new(tag))
    }

    async fn drain_progress(
        &self,
        resource: &str,
        mut stream: ProgressStream<'_>,
    ) -> std::result::Result<(), EngineError> {
        while let Some(line) = stream.next().await {
            self.sink.progress(resource, &line?);
        }
        Ok(())
    }
}
