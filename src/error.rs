// Crate-wide error aggregation
//
// Every module defines its own narrow thiserror enum; PlejdError wraps them
// with #[from] for the manager's public API and the CLI's top-level Result.

use thiserror::Error;

use crate::cloud::CloudError;
use crate::codec::CodecError;
use crate::mesh::SessionError;
use crate::node::AddressError;
use crate::roster::RosterError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum PlejdError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("manager has not been initialised yet")]
    NotInitialised,

    #[error("no candidate gateway available")]
    NoCandidateGateway,
}

impl PlejdError {
    /// Whether the caller should keep retrying on the existing session (vs. surface up).
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoCandidateGateway | Self::Session(_) | Self::Codec(_)
        )
    }
}
