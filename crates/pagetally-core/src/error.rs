use thiserror::Error;

use crate::hit::ValidationError;
use crate::session::SessionError;

/// Why a single submitted record was not buffered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HitError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}
