use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid status transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },
}
