use crate::topology::TopologyError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] JoinError),
}
