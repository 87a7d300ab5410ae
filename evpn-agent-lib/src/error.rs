//! Crate-wide error type, composing every module's own `thiserror` enum.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] crate::managers::link::Error),
    #[error(transparent)]
    Bridge(#[from] crate::managers::bridge::Error),
    #[error(transparent)]
    Address(#[from] crate::managers::address::Error),
    #[error(transparent)]
    Neighbour(#[from] crate::managers::neighbour::Error),
    #[error(transparent)]
    Route(#[from] crate::managers::route::Error),
    #[error(transparent)]
    Ovs(#[from] crate::managers::ovs::Error),
    #[error(transparent)]
    Frr(#[from] crate::managers::frr::Error),
    #[error(transparent)]
    Inventory(#[from] crate::inventory::Error),
    #[error(transparent)]
    Config(#[from] crate::config::Error),
}
