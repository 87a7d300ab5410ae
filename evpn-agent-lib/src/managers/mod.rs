//! Per-resource-kind reconciliation managers. Each owns a snapshot of one
//! facet of host state plus the set of resources ensured so far this
//! iteration, and exposes `ensure_*`/`prune`/`finalise`.

pub mod address;
pub mod bridge;
pub mod frr;
pub mod link;
pub mod neighbour;
pub mod ovs;
pub mod route;
