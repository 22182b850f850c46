#[derive(Debug, thiserror::Error)]
pub enum MnemoError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("user_id must not be empty")]
    EmptyUser,

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("embedding provider '{0}' failed: {1}")]
    Provider(String, String),

    #[error("all embedding providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("LLM backend error: {0}")]
    Llm(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
