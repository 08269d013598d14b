//! Graft Fragment
//!
//! A fragment is a connected subset of a workflow that was copied into a
//! project of its own, together with its declared boundary: the inputs that
//! feed it, the outputs it produces and the nodes that only reference data
//! stored elsewhere.
//!
//! # Lifecycle
//!
//! ```text
//! Fragment::capture(registry, container, request) ─► Captured (live project)
//!        │                                               │
//!        │                               serialize_and_dispose()
//!        ▼                                               ▼
//! Fragment::read(archive) ──────────────────────► Serialized (packed graph)
//!                                                        │
//!                                    load(registry) ─► live project (cached)
//!                                    dispose()      ─► packed again
//! ```
//!
//! # Archive layout
//!
//! A saved fragment is a tar stream with exactly two entries, in order:
//! `metadata.json` (name, boundary slots, reference node addresses, optional
//! custom name) and `workflow.bin` (the gzip packed project directory).

mod archive;
mod error;
mod fragment;
mod slot;

pub use archive::{METADATA_ENTRY, Metadata, WORKFLOW_ENTRY};
pub use error::FragmentError;
pub use fragment::{CaptureRequest, Fragment, sanitize_name};
pub use slot::{BoundaryInput, BoundaryOutput, InputSlot, OutputSlot};
