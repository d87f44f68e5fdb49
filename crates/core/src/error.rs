#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("No workflow provided")]
    NoWorkflow,

    #[error("Validation failed: {0}")]
    Validation(String),
}
