//! Graft Reference
//!
//! Some nodes in a fragment hold no data, only a [`DataReference`] to a value
//! kept elsewhere. This crate moves such values around so a fragment can
//! travel or run on its own:
//!
//! - [`write_reference_data`] writes referenced values as files into the
//!   fragment's project and points the nodes at those files. Nested fragment
//!   values are handled recursively.
//! - [`copy_reference_data`] goes the other way for ephemeral runs: file
//!   references are read into a [`ValueRepository`] and the nodes point at
//!   the registered values. [`copy_pasted_reference_data`] does the same
//!   for nodes pasted out of a fragment, leaving the fragment itself as is.
//!
//! Every file path is resolved inside the owning project directory. A path
//! that leaves it fails with [`ReferenceError::Security`].
//!
//! [`DataReference`]: graft_graph::DataReference
//! [`ValueRepository`]: graft_graph::ValueRepository

mod error;
mod materialize;

pub use error::ReferenceError;
pub use materialize::{
  REFERENCE_DATA_DIR, copy_pasted_reference_data, copy_reference_data, make_portable,
  write_reference_data,
};
