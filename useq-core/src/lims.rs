use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::ids::RunId;

/// Sentinel rendered for fields the LIMS could not supply.
pub const UNAVAILABLE: &str = "NA";

/// A LIMS attribute that may legitimately be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum MetadataField<T> {
    Available(T),
    #[default]
    Unavailable,
}

impl<T> MetadataField<T> {
    pub fn as_option(&self) -> Option<&T> {
        match self {
            MetadataField::Available(value) => Some(value),
            MetadataField::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, MetadataField::Available(_))
    }
}

impl<T> From<Option<T>> for MetadataField<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => MetadataField::Available(value),
            None => MetadataField::Unavailable,
        }
    }
}

impl<T: fmt::Display> fmt::Display for MetadataField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataField::Available(value) => value.fmt(f),
            MetadataField::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

/// Run/project metadata as seen by the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub project_id: MetadataField<String>,
    /// Project-requested demultiplexing tolerance.
    pub barcode_mismatches: MetadataField<u8>,
    pub contact_email: MetadataField<String>,
}

/// Read-only LIMS collaborator.
#[async_trait]
pub trait LimsClient: Send + Sync {
    async fn run_metadata(&self, run_id: &RunId) -> Result<RunMetadata>;
}
