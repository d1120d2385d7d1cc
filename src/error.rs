use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

pub enum CageError {
  Fork(String),
  Pipe(String),
  Jail(String),
  Exec(String),
  Codec(String),
  Invoke(String),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
}

#[allow(unused)]
pub enum CageExit {
  Ok,
  Err(CageError),
}

impl CageError {
  pub fn fork<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Fork(msg.into())
  }

  pub fn pipe<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Pipe(msg.into())
  }

  pub fn jail<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Jail(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Exec(msg.into())
  }

  pub fn codec<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Codec(msg.into())
  }

  pub fn invoke<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Invoke(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> CageError {
    CageError::Cli(msg.into())
  }
}

impl Debug for CageError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for CageError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      CageError::Fork(msg) => f.write_fmt(format_args!("Cage Fork Error: {}", msg)),
      CageError::Pipe(msg) => f.write_fmt(format_args!("Cage Pipe Error: {}", msg)),
      CageError::Jail(msg) => f.write_fmt(format_args!("Cage Jail Error: {}", msg)),
      CageError::Exec(msg) => f.write_fmt(format_args!("Cage Exec Error: {}", msg)),
      CageError::Codec(msg) => f.write_fmt(format_args!("Cage Codec Error: {}", msg)),
      CageError::Invoke(msg) => f.write_fmt(format_args!("Cage Invoke Error: {}", msg)),
      CageError::Nix(errno) => f.write_fmt(format_args!("Cage Nix Error: {}", errno)),
      CageError::Fs(msg) => f.write_fmt(format_args!("Cage File System Error: {}", msg)),
      CageError::Cli(msg) => f.write_fmt(format_args!("Cage CLI Error: {}", msg)),
      CageError::Logger(err) => f.write_fmt(format_args!("Cage Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for CageError {
  fn from(errno: Errno) -> Self {
    CageError::Nix(errno)
  }
}

impl From<std::io::Error> for CageError {
  fn from(err: std::io::Error) -> Self {
    CageError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for CageError {
  fn from(err: FlexiLoggerError) -> Self {
    CageError::Logger(err)
  }
}

impl From<rmp_serde::encode::Error> for CageError {
  fn from(err: rmp_serde::encode::Error) -> Self {
    CageError::Codec(err.to_string())
  }
}

impl From<rmp_serde::decode::Error> for CageError {
  fn from(err: rmp_serde::decode::Error) -> Self {
    CageError::Codec(err.to_string())
  }
}

impl From<base64::DecodeError> for CageError {
  fn from(err: base64::DecodeError) -> Self {
    CageError::Codec(err.to_string())
  }
}

impl Error for CageError {}

impl Termination for CageExit {
  fn report(self) -> ExitCode {
    match self {
      CageExit::Ok => ExitCode::SUCCESS.report(),
      CageExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!(
                "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
                prefix, message
              )
            }
          }
          None => {
            format!("{}", err)
          }
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}
