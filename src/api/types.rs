//! Request bodies of the REST API

use serde::Deserialize;
use uuid::Uuid;

use crate::domain::DriverId;
use crate::workflow::{EvidenceBundle, EvidenceFile};

use super::error::{validation_error, ApiError};
use super::utils::decode_base64_any;

/// Photo or signature sent inline as base64
#[derive(Debug, Deserialize)]
pub struct EvidenceFileBody {
    pub file_name: String,
    pub content_type: String,
    /// Base64 or data URL
    pub data: String,
}

impl EvidenceFileBody {
    pub fn decode(&self, field: &str) -> Result<EvidenceFile, ApiError> {
        let bytes = decode_base64_any(field, &self.data)?;
        if bytes.is_empty() {
            return Err(validation_error(field, format!("{field} is empty")));
        }
        Ok(EvidenceFile::new(
            self.file_name.clone(),
            self.content_type.clone(),
            bytes,
        ))
    }
}

/// Evidence attached to a finalize or occurrence request
#[derive(Debug, Default, Deserialize)]
pub struct EvidenceBody {
    #[serde(default)]
    pub photos: Vec<EvidenceFileBody>,
    #[serde(default)]
    pub signature: Option<EvidenceFileBody>,
}

impl EvidenceBody {
    pub fn into_bundle(self) -> Result<EvidenceBundle, ApiError> {
        let mut bundle = EvidenceBundle::default();
        for (i, photo) in self.photos.iter().enumerate() {
            bundle = bundle.with_photo(photo.decode(&format!("photos[{i}]"))?);
        }
        if let Some(signature) = &self.signature {
            bundle = bundle.with_signature(signature.decode("signature")?);
        }
        Ok(bundle)
    }
}

/// Accepting a pickup, collection or delivery. Admins name the driver.
#[derive(Debug, Default, Deserialize)]
pub struct AcceptRequest {
    #[serde(default)]
    pub driver_id: Option<Uuid>,
}

impl AcceptRequest {
    pub fn assign_to(&self) -> Option<DriverId> {
        self.driver_id.map(DriverId::from_uuid)
    }
}

/// Target status as its wire name, e.g. `EM_TRANSITO`
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct OccurrenceRequest {
    /// `coleta_realizada`, `tentativa_entrega` or `entregue`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub observations: Option<String>,
    #[serde(default)]
    pub evidence: EvidenceBody,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub code: String,
    #[serde(default)]
    pub photo: Option<EvidenceFileBody>,
}
