//! Configuration artifacts written for services once per attempt.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::template::ConfigTemplate;

/// Declares a file a service reads at startup.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ArtifactSpec {
    /// Source file, relative to the stack's config directory.
    pub source: PathBuf,

    /// Output path, relative to the service's working directory.
    pub output: PathBuf,

    /// Copy the source bytes unchanged instead of rendering them.
    #[serde(default)]
    pub verbatim: bool,
}

/// Loaded content of an artifact source.
#[derive(Clone, Debug)]
pub enum ArtifactContent {
    /// Rendered against the attempt's variables.
    Template(ConfigTemplate),

    /// Opaque bytes written as-is.
    Verbatim(Vec<u8>),
}

/// An artifact whose source has been read from disk.
#[derive(Clone, Debug)]
pub struct LoadedArtifact {
    /// Declaration this artifact came from.
    pub spec: ArtifactSpec,

    /// Loaded content.
    pub content: ArtifactContent,
}

impl LoadedArtifact {
    /// Reads an artifact's source relative to `config_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the output path is not a plain relative path, if the
    /// source cannot be read, or if a template source is not valid UTF-8.
    pub async fn load(config_dir: &Path, name: &str, spec: &ArtifactSpec) -> Result<Self> {
        validate_output_path(&spec.output)?;

        let path = config_dir.join(&spec.source);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| Error::ReadArtifact {
                path: path.clone(),
                source,
            })?;

        let content = if spec.verbatim {
            ArtifactContent::Verbatim(bytes)
        } else {
            let text = String::from_utf8(bytes).map_err(|e| Error::ReadArtifact {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
            ArtifactContent::Template(ConfigTemplate::new(name, text))
        };

        debug!("loaded artifact {} from {}", name, path.display());

        Ok(Self {
            spec: spec.clone(),
            content,
        })
    }
}

/// Writes rendered artifact bytes below `service_dir`.
///
/// # Errors
///
/// Returns an error if the output path is invalid or the file cannot be written.
pub async fn write_artifact(service_dir: &Path, output: &Path, bytes: &[u8]) -> Result<PathBuf> {
    validate_output_path(output)?;

    let path = service_dir.join(output);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Io("failed to create artifact directory", e))?;
    }

    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| Error::Io("failed to write artifact", e))?;

    debug!("wrote {} ({} bytes)", path.display(), bytes.len());

    Ok(path)
}

fn validate_output_path(output: &Path) -> Result<()> {
    let plain = output.components().count() > 0
        && output
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

    if plain {
        Ok(())
    } else {
        Err(Error::InvalidOutputPath(output.to_path_buf()))
    }
}
