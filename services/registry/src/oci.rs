//! OCI image manifest documents

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Media type of an OCI image manifest
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an OCI image configuration
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Media type of a gzip compressed layer
pub const LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A reference to a blob, with the information needed to fetch and verify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,

    /// Digest of the referenced content
    pub digest: Digest,

    /// Size of the referenced content in bytes
    pub size: u64,

    /// Alternate locations the content can be fetched from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Arbitrary metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// An image manifest: one configuration blob and an ordered list of layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2
    pub schema_version: u32,

    /// Media type of the manifest itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The image configuration
    pub config: Descriptor,

    /// Layers, from base to top
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Arbitrary metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Every blob the manifest refers to: the layers first, then the config.
    pub fn references(&self) -> impl Iterator<Item = &Digest> {
        self.layers
            .iter()
            .chain(std::iter::once(&self.config))
            .map(|descriptor| &descriptor.digest)
    }

    /// Look up an annotation on the manifest.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}
