use nix::unistd;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::CageError;
use crate::pipe::BridgePipes;

/// Final verdict of one job.
///
/// The wire format is a small integer:
/// `0=Passed, 1=Error, 2=CPULimit, 3=MemoryLimit, 4=OutputLimit, 5=UnknownError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutedStatus {
  Passed = 0,
  Error = 1,
  CPULimit = 2,
  MemoryLimit = 3,
  OutputLimit = 4,
  UnknownError = 5,
}

impl Serialize for ExecutedStatus {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(*self as u8)
  }
}

impl<'de> Deserialize<'de> for ExecutedStatus {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = u8::deserialize(deserializer)?;
    match value {
      0 => Ok(ExecutedStatus::Passed),
      1 => Ok(ExecutedStatus::Error),
      2 => Ok(ExecutedStatus::CPULimit),
      3 => Ok(ExecutedStatus::MemoryLimit),
      4 => Ok(ExecutedStatus::OutputLimit),
      5 => Ok(ExecutedStatus::UnknownError),
      _ => Err(de::Error::custom(format!(
        "unknown executed status ({})",
        value
      ))),
    }
  }
}

/// Result record of one job, produced exactly once by the parent side of
/// the managed executor and carried over the result pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedResult {
  pub used_cpu_time_sec: f32,
  pub used_memory_bytes: u64,
  pub signal: Option<i32>,
  pub return_code: i32,
  pub command_line: String,
  pub status: ExecutedStatus,
  pub system_error_message: Option<String>,
}

impl ExecutedResult {
  /// A record describing a failure of the sandbox itself, as opposed to
  /// an outcome of the user program.
  pub fn system_failure<MS: Into<String>>(message: MS) -> Self {
    ExecutedResult {
      used_cpu_time_sec: 0.0,
      used_memory_bytes: 0,
      signal: None,
      return_code: -1,
      command_line: String::new(),
      status: ExecutedStatus::UnknownError,
      system_error_message: Some(message.into()),
    }
  }

  /// Encode with field names so that readers of other versions can skip
  /// fields they do not know.
  pub fn encode(&self) -> Result<Vec<u8>, CageError> {
    let buf = rmp_serde::to_vec_named(self)?;
    Ok(buf)
  }

  pub fn decode(buf: &[u8]) -> Result<Self, CageError> {
    let result = rmp_serde::from_slice(buf)?;
    Ok(result)
  }

  /// Write this record to the result pipe, exactly once per job.
  pub fn send_to(&self, pipes: &mut BridgePipes) -> Result<(), CageError> {
    let buf = self.encode()?;

    pipes.result.close_read()?;

    let fd = pipes.result.write_fd()?;
    let size = unistd::write(fd, &buf)?;
    if size != buf.len() {
      return Err(CageError::pipe(format!(
        "couldn't write the whole result ({} of {} bytes)",
        size,
        buf.len()
      )));
    }

    pipes.result.close_write()?;
    Ok(())
  }
}
