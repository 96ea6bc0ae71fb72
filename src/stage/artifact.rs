// src/stage/artifact.rs

use crate::model::ProductKey;

/// Payload of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    Data(Vec<u8>),
    /// Produced, but empty. Nothing is written and the product becomes `blank`.
    Blank,
}

/// Extra file stored next to an artifact, sharing its stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub extension: String,
    pub data: Vec<u8>,
}

/// One output returned by a transformation.
///
/// `key` must describe the product the artifact was planned as; the harness
/// matches artifacts to expected products by the file name derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: ProductKey,
    pub content: ArtifactContent,
    pub sidecars: Vec<Sidecar>,
    pub outlier: bool,
    pub quality_flags: u32,
}

impl Artifact {
    pub fn new(key: ProductKey, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            content: ArtifactContent::Data(data.into()),
            sidecars: Vec::new(),
            outlier: false,
            quality_flags: 0,
        }
    }

    pub fn blank(key: ProductKey) -> Self {
        Self {
            key,
            content: ArtifactContent::Blank,
            sidecars: Vec::new(),
            outlier: false,
            quality_flags: 0,
        }
    }

    pub fn with_sidecar(mut self, extension: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.sidecars.push(Sidecar {
            extension: extension.into(),
            data: data.into(),
        });
        self
    }

    pub fn outlier(mut self, outlier: bool) -> Self {
        self.outlier = outlier;
        self
    }

    pub fn with_quality_flags(mut self, flags: u32) -> Self {
        self.quality_flags = flags;
        self
    }

    pub fn is_blank(&self) -> bool {
        matches!(self.content, ArtifactContent::Blank)
    }
}
