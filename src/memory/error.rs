#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("working memory full: {needed} bytes needed, hard cap is {hard_cap}")]
    StorageFull { needed: usize, hard_cap: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
}
