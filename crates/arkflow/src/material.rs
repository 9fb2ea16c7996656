//! Learning materials as seen by the orchestrator, and the collaborator
//! traits used to look them up and to hand out download links.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterialError {
    #[error("material '{0}' not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("material directory unavailable: {0}")]
    Unavailable(String),
}

/// Closed set of material content kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Document,
    Image,
    Audio,
    Video,
    Text,
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Document => "document",
            ContentType::Image => "image",
            ContentType::Audio => "audio",
            ContentType::Video => "video",
            ContentType::Text => "text",
            ContentType::Other => "other",
        }
    }

    /// Detects the content type from a file name's extension.
    pub fn from_filename(filename: &str) -> Self {
        match mime_guess::from_path(filename).first() {
            Some(mime) => Self::from_mime(&mime),
            None => ContentType::Other,
        }
    }

    fn from_mime(mime: &mime_guess::Mime) -> Self {
        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("image", _) => ContentType::Image,
            ("audio", _) => ContentType::Audio,
            ("video", _) => ContentType::Video,
            ("text", "plain") | ("text", "markdown") => ContentType::Text,
            ("application", "pdf")
            | ("application", "msword")
            | ("application", "rtf")
            | ("application", "vnd.ms-powerpoint")
            | ("application", "vnd.oasis.opendocument.text") => ContentType::Document,
            ("application", sub) if sub.starts_with("vnd.openxmlformats-officedocument") => {
                ContentType::Document
            }
            _ => ContentType::Other,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaterialStatus {
    Uploading,
    Stored,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub id: String,
    pub owner_id: String,
    pub content_type: ContentType,
    /// Opaque reference understood by the content presigner.
    pub storage_ref: String,
    pub status: MaterialStatus,
}

impl Material {
    /// A stored material whose content type is detected from `storage_ref`.
    pub fn stored(id: &str, owner_id: &str, storage_ref: &str) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            content_type: ContentType::from_filename(storage_ref),
            storage_ref: storage_ref.to_string(),
            status: MaterialStatus::Stored,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

/// Read access to material records.
#[async_trait]
pub trait MaterialDirectory: Send + Sync {
    async fn get_material(&self, material_id: &str) -> Result<Material, MaterialError>;
}

/// Issues short-lived download locators for stored content.
#[async_trait]
pub trait ContentPresigner: Send + Sync {
    async fn presign_download(&self, storage_ref: &str, ttl: Duration)
        -> Result<String, MaterialError>;
}

/// In-process material directory.
#[derive(Default)]
pub struct MemoryMaterialDirectory {
    materials: RwLock<HashMap<String, Material>>,
}

impl MemoryMaterialDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, material: Material) {
        let mut materials = self.materials.write().unwrap_or_else(|e| {
            log::warn!("Material directory lock was poisoned, recovering");
            e.into_inner()
        });
        materials.insert(material.id.clone(), material);
    }

    pub fn remove(&self, material_id: &str) -> Option<Material> {
        let mut materials = self.materials.write().unwrap_or_else(|e| {
            log::warn!("Material directory lock was poisoned, recovering");
            e.into_inner()
        });
        materials.remove(material_id)
    }
}

#[async_trait]
impl MaterialDirectory for MemoryMaterialDirectory {
    async fn get_material(&self, material_id: &str) -> Result<Material, MaterialError> {
        let materials = self.materials.read().unwrap_or_else(|e| {
            log::warn!("Material directory lock was poisoned, recovering");
            e.into_inner()
        });
        materials
            .get(material_id)
            .cloned()
            .ok_or_else(|| MaterialError::NotFound(material_id.to_string()))
    }
}
