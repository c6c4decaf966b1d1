use serde::{Deserialize, Serialize};

/// One unit of work: copy `source` to `destination`.
///
/// Created by the job producer, moved through the queue exactly once, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyJob {
    pub source: String,
    pub destination: String,
    /// Size in bytes when the producer could stat the source.
    pub size: Option<u64>,
}

impl CopyJob {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        size: Option<u64>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            size,
        }
    }
}

impl std::fmt::Display for CopyJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}
