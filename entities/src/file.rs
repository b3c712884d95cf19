use std::{hash::Hash, sync::Arc};

use crate::Data;

/// MIME type used when the source does not declare one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct File {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub data: Arc<dyn Data>,
}

impl File {
    /// Builds the file at position `index` of a batch.
    ///
    /// Ids are positional (`file_0`, `file_1`, ...) and stay stable for the
    /// lifetime of one file's movement.
    pub fn positional(
        index: usize,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Arc<dyn Data>,
    ) -> Self {
        let mime_type = mime_type.into();
        Self {
            id: format!("file_{index}"),
            name: name.into(),
            mime_type: if mime_type.is_empty() {
                DEFAULT_MIME_TYPE.to_string()
            } else {
                mime_type
            },
            data,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Hash for File {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
