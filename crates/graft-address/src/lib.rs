//! Graft Address
//!
//! Node and port addressing for graph fragments.
//!
//! Every node living in a container has a concrete [`NodeId`] (`0:3:5`) that is
//! assigned by whoever hosts it. Those ids change whenever a fragment is pasted,
//! loaded or otherwise re-hosted, so anything a fragment persists about its own
//! nodes is stored as a [`RelativeAddress`] (`3:5`, relative to the fragment's
//! root container) instead. A [`PasteMapping`] produced by a paste translates the
//! relative form back into concrete ids in the new host.

mod error;
mod id;
mod mapping;
mod port;

pub use error::AddressError;
pub use id::{NodeId, RelativeAddress};
pub use mapping::PasteMapping;
pub use port::{ConcretePort, PortRef};
