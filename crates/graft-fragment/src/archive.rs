//! Tar layout of a saved fragment and the gzip blob holding its graph.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use graft_address::RelativeAddress;
use serde::{Deserialize, Serialize};

use crate::error::FragmentError;
use crate::slot::{InputSlot, OutputSlot};

pub const METADATA_ENTRY: &str = "metadata.json";
pub const WORKFLOW_ENTRY: &str = "workflow.bin";

/// The structured document stored ahead of the graph blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
  pub name: String,
  pub ref_node_ids: Vec<RelativeAddress>,
  pub input_ports: Vec<InputSlot>,
  pub output_ports: Vec<OutputSlot>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub custom_workflow_name: Option<String>,
}

/// Pack a project directory into a gzip compressed tar blob.
pub(crate) fn pack_dir(dir: &Path) -> Result<Vec<u8>, FragmentError> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  builder.append_dir_all(".", dir)?;
  let encoder = builder.into_inner()?;
  Ok(encoder.finish()?)
}

/// Unpack a blob produced by [`pack_dir`] into `dir`.
pub(crate) fn unpack_dir(blob: &[u8], dir: &Path) -> std::io::Result<()> {
  let mut archive = tar::Archive::new(GzDecoder::new(blob));
  archive.unpack(dir)
}

/// Write the two archive entries in their fixed order.
pub(crate) fn write_archive<W: Write>(
  writer: W,
  metadata: &Metadata,
  blob: &[u8],
) -> Result<(), FragmentError> {
  let document = serde_json::to_vec_pretty(metadata).map_err(|e| FragmentError::Format {
    message: format!("failed to encode metadata: {}", e),
  })?;
  let mut builder = tar::Builder::new(writer);
  append(&mut builder, METADATA_ENTRY, &document)?;
  append(&mut builder, WORKFLOW_ENTRY, blob)?;
  builder.finish()?;
  Ok(())
}

fn append<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> std::io::Result<()> {
  let mut header = tar::Header::new_gnu();
  header.set_size(data.len() as u64);
  header.set_mode(0o644);
  header.set_cksum();
  builder.append_data(&mut header, name, data)
}

/// Read both entries, failing when they are missing or out of order.
pub(crate) fn read_archive<R: Read>(reader: R) -> Result<(Metadata, Vec<u8>), FragmentError> {
  let mut archive = tar::Archive::new(reader);
  let mut entries = archive.entries()?;

  let document = next_entry(&mut entries, METADATA_ENTRY)?;
  let metadata = serde_json::from_slice(&document).map_err(|e| FragmentError::Format {
    message: format!("invalid metadata: {}", e),
  })?;
  let blob = next_entry(&mut entries, WORKFLOW_ENTRY)?;
  Ok((metadata, blob))
}

fn next_entry<R: Read>(
  entries: &mut tar::Entries<'_, R>,
  expected: &str,
) -> Result<Vec<u8>, FragmentError> {
  let Some(entry) = entries.next() else {
    return Err(FragmentError::Format {
      message: format!("Expected {} file in stream, got end of stream", expected),
    });
  };
  let mut entry = entry?;
  let path = entry.path()?.to_string_lossy().into_owned();
  if path != expected {
    return Err(FragmentError::Format {
      message: format!("Expected {} file in stream, got {}", expected, path),
    });
  }
  let mut data = Vec::new();
  entry.read_to_end(&mut data)?;
  Ok(data)
}
