use uuid::Uuid;

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The insert (or its notification) failed at the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Error type for administrative actions on jobs.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// No job row exists for the given id.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The job is not in a state that permits the requested action.
    #[error("job {id} cannot be {action} from its current state")]
    InvalidState {
        /// The job the action was attempted on.
        id: Uuid,
        /// The action that was rejected, e.g. `"retried"`.
        action: &'static str,
    },

    /// The underlying database operation failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
