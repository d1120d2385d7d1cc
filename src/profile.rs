use std::collections::HashMap;

use serde::Deserialize;

use crate::error::CageError;
use crate::utils::split_command_line;

/// One switch a user may select for a phase, with the set of values that
/// are allowed for it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectableCommand {
  #[serde(default)]
  pub default: Vec<String>,
  #[serde(default)]
  pub select: Vec<String>,
}

impl SelectableCommand {
  pub fn is_empty(&self) -> bool {
    self.default.is_empty() || self.select.is_empty()
  }
}

/// One phase (source / compile / link / run) of a language profile.
///
/// Profiles are loaded from YAML by an external collaborator; this module
/// only consumes the resolved shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseDetail {
  #[serde(default)]
  pub file: String,
  #[serde(default)]
  pub extension: String,
  #[serde(default)]
  pub command: String,
  #[serde(default)]
  pub env: HashMap<String, String>,
  #[serde(default)]
  pub allowed_command_line: HashMap<String, SelectableCommand>,
  #[serde(default)]
  pub fixed_command_line: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcProfile {
  #[serde(default)]
  pub version: String,
  #[serde(default)]
  pub is_build_required: bool,
  #[serde(default)]
  pub is_link_independent: bool,
  #[serde(default)]
  pub source: PhaseDetail,
  #[serde(default)]
  pub compile: PhaseDetail,
  #[serde(default)]
  pub link: PhaseDetail,
  #[serde(default)]
  pub run: PhaseDetail,
}

impl PhaseDetail {
  /// Assemble the full argv for this phase:
  /// `command + validated selected options + fixed options + shell-split
  /// user command line`.
  pub fn make_complete_args(
    &self,
    command_line: &str,
    selected_options: &[Vec<String>],
  ) -> Result<Vec<String>, CageError> {
    for option in selected_options {
      self.validate_option(option)?;
    }

    if self.command.is_empty() {
      return Err(CageError::cli("command can not be empty"));
    }

    let mut args = vec![self.command.clone()];

    for option in selected_options {
      args.extend(option.iter().cloned());
    }

    for fixed in &self.fixed_command_line {
      args.extend(fixed.iter().cloned());
    }

    args.extend(split_command_line(command_line)?);

    Ok(args)
  }

  fn validate_option(&self, selected: &[String]) -> Result<(), CageError> {
    if selected.len() != 1 && selected.len() != 2 {
      return Err(CageError::cli(format!(
        "length of the option should be 1 or 2 (but {})",
        selected.len()
      )));
    }

    let key = &selected[0];
    let allowed = self.allowed_command_line.get(key).ok_or_else(|| {
      CageError::cli(format!("key ({}) was not found", key))
    })?;

    if selected.len() == 2 {
      let value = &selected[1];
      if allowed.select.iter().any(|v| v == value) {
        Ok(())
      } else {
        Err(CageError::cli(format!(
          "value ({}) was not found in key ({})",
          value, key
        )))
      }
    } else if allowed.is_empty() {
      // 只有 key，且没有可选值
      Ok(())
    } else {
      Err(CageError::cli("nil value can not be selected"))
    }
  }
}
