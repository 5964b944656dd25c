/// Parameters every transformation receives alongside the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformParams {
    pub identifier: String,
    pub timestamp: String,
}

impl TransformParams {
    pub fn pairs(&self) -> [(&'static str, &str); 2] {
        [
            ("identifier", self.identifier.as_str()),
            ("timestamp", self.timestamp.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot transform {from} -> {to}: {reason}")]
pub struct TransformError {
    pub from: String,
    pub to: String,
    pub reason: String,
}

/// Converts record metadata from the harvested prefix into the storage schema.
pub trait FormatTransformer: Send + Sync {
    fn transform(
        &self,
        from: &str,
        to: &str,
        metadata: &str,
        params: &TransformParams,
    ) -> Result<String, TransformError>;
}
