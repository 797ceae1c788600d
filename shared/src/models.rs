use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Address of one object in blob storage: `<container>/<key>`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub container: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        ObjectLocation {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Splits a blob path on its first `/`. The first segment names the
    /// container (or bucket), the remainder is the object key.
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim_start_matches('/');
        let (container, key) = path
            .split_once('/')
            .ok_or_else(|| anyhow!("blob path {:?} has no container segment", path))?;
        if container.is_empty() || key.is_empty() {
            return Err(anyhow!("blob path {:?} is missing a container or key", path));
        }
        Ok(ObjectLocation::new(container, key))
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}
