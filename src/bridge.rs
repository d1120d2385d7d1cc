use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CageError;
use crate::executor::ResourceLimit;
use crate::pipe::BridgePipes;

/// Environment variables of the cloner invocation contract.
pub const ENV_CALLBACK_EXECUTABLE: &str = "callback_executable";
pub const ENV_PACKED_CONTENT: &str = "packed_torigoya_content";
pub const ENV_DEBUG_TAG: &str = "debug_tag";

/// The portable job description carried across the fork + exec boundary.
///
/// Descriptors travel as raw numbers inside `pipes`; they stay valid
/// because the cloner binary is launched with the three bridge pipes
/// inherited and not close-on-exec. Created in the driver, consumed once
/// by the cloner after exec, never mutated after spawn.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeMessage {
  pub chroot_path: String,
  pub home_path: String,
  pub user_id: u32,
  pub group_id: u32,
  pub callback_path: String,
  pub limits: ResourceLimit,
  pub args: Vec<String>,
  pub envs: Vec<(String, String)>,
  pub umask: u32,
  pub stdin_path: Option<String>,
  pub pipes: BridgePipes,
}

impl BridgeMessage {
  /// Encode to a base64 text that survives an environment variable.
  pub fn encode(&self) -> Result<String, CageError> {
    let buf = rmp_serde::to_vec_named(self)?;
    Ok(BASE64.encode(buf))
  }

  pub fn decode(text: &str) -> Result<Self, CageError> {
    let buf = BASE64.decode(text)?;
    let message = rmp_serde::from_slice(&buf)?;
    Ok(message)
  }

  /// Look up one variable of the job environment.
  pub fn env(&self, key: &str) -> Option<&str> {
    self
      .envs
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }
}
