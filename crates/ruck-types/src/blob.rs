use serde::{Deserialize, Serialize};

/// Payload kind of a blob stored inside a pack.
///
/// `Data` blobs hold file content chunks; `Tree` blobs hold serialized
/// directory trees. The pair `(BlobType, Id)` addresses a blob uniquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

impl BlobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::Data => "data",
            BlobType::Tree => "tree",
        }
    }
}

impl std::fmt::Display for BlobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&BlobType::Data).unwrap(), "\"data\"");
        assert_eq!(serde_json::to_string(&BlobType::Tree).unwrap(), "\"tree\"");
        let t: BlobType = serde_json::from_str("\"tree\"").unwrap();
        assert_eq!(t, BlobType::Tree);
    }
}
