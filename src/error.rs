//! Group-chain error abstractions.

use crate::models::GroupId;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// The failure kinds reported to the originator of a next objective.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ObjectiveError {
    /// The objective is malformed.
    #[error("bad params: {0}")]
    BadParams(String),
    /// The objective asks for something this pipeline can not express.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The objective type is not recognized.
    #[error("unknown next objective type: {0}")]
    Unknown(String),
    /// The top-level group of the objective was never confirmed by the device.
    #[error("group installation failed")]
    GroupInstallationFailed,
    /// The objective refers to a group chain which does not exist.
    #[error("group chain is missing")]
    GroupMissing,
    /// The controller hit an internal error, such as a storage failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The outcome of a next objective operation, carrying the hardware id of its top-level group.
pub type ObjectiveResult = std::result::Result<GroupId, ObjectiveError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
