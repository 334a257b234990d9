use crate::DocumentType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A content cluster: its name, config id, and the bucket space of each document type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub config_id: String,
    #[serde(default)]
    pub bucket_spaces: BTreeMap<DocumentType, String>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        config_id: impl Into<String>,
        bucket_spaces: BTreeMap<DocumentType, String>,
    ) -> Self {
        Self {
            name: name.into(),
            config_id: config_id.into(),
            bucket_spaces,
        }
    }

    /// Route to the cluster's storage nodes.
    #[must_use]
    pub fn route(&self) -> String {
        format!(
            "[Storage:cluster={};clusterconfigid={}]",
            self.name, self.config_id
        )
    }

    #[must_use]
    pub fn bucket_space_of(&self, document_type: &DocumentType) -> Option<&str> {
        self.bucket_spaces.get(document_type).map(String::as_str)
    }
}
