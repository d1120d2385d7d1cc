use std::os::unix::prelude::RawFd;

use nix::{
  fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
  unistd::{self, pipe2},
};
use serde::{Deserialize, Serialize};

use crate::error::CageError;

/// A uni-directional byte channel with explicit read / write ends.
///
/// Both ends are raw descriptors so that the pair survives a fork + exec
/// boundary by number. An end is closed at most once: closing marks the
/// field invalid, and a second close of the same end is a no-op because
/// both the parent and the child may defensively close the same end.
#[derive(Debug, Serialize, Deserialize)]
pub struct Pipe {
  read_fd: Option<RawFd>,
  write_fd: Option<RawFd>,
}

/// The three named pipes of one job, handed from parent to child at spawn.
#[derive(Debug, Serialize, Deserialize)]
pub struct BridgePipes {
  pub stdout: Pipe,
  pub stderr: Pipe,
  pub result: Pipe,
}

/// Create a plain blocking pipe.
pub fn make_pipe() -> Result<Pipe, CageError> {
  Pipe::create(OFlag::empty())
}

/// Create a pipe whose both ends are closed on exec.
pub fn make_pipe_close_on_exec() -> Result<Pipe, CageError> {
  Pipe::create(OFlag::O_CLOEXEC)
}

/// Create a pipe whose read end does not block.
///
/// Only the read end is marked nonblocking: the write end is inherited by
/// the user program as its stdout / stderr and must stay blocking, or the
/// program would observe partial writes when the buffer fills.
pub fn make_pipe_nonblocking() -> Result<Pipe, CageError> {
  let pipe = Pipe::create(OFlag::empty())?;
  let read_fd = pipe.read_fd()?;
  let flags = fcntl(read_fd, FcntlArg::F_GETFL)?;
  let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
  fcntl(read_fd, FcntlArg::F_SETFL(flags))?;
  Ok(pipe)
}

impl Pipe {
  /// A placeholder with no descriptors, to be replaced before spawn.
  pub fn empty() -> Self {
    Pipe {
      read_fd: None,
      write_fd: None,
    }
  }

  fn create(flags: OFlag) -> Result<Self, CageError> {
    let (read_fd, write_fd) = pipe2(flags)?;
    Ok(Pipe {
      read_fd: Some(read_fd),
      write_fd: Some(write_fd),
    })
  }

  pub fn read_fd(&self) -> Result<RawFd, CageError> {
    self
      .read_fd
      .ok_or_else(|| CageError::pipe("read end is already closed"))
  }

  pub fn write_fd(&self) -> Result<RawFd, CageError> {
    self
      .write_fd
      .ok_or_else(|| CageError::pipe("write end is already closed"))
  }

  /// Close the read end. The second call is a no-op.
  pub fn close_read(&mut self) -> Result<(), CageError> {
    if let Some(fd) = self.read_fd.take() {
      unistd::close(fd)?;
    }
    Ok(())
  }

  /// Close the write end. The second call is a no-op.
  pub fn close_write(&mut self) -> Result<(), CageError> {
    if let Some(fd) = self.write_fd.take() {
      unistd::close(fd)?;
    }
    Ok(())
  }

  /// Close both ends.
  pub fn close(&mut self) -> Result<(), CageError> {
    self.close_read()?;
    self.close_write()?;
    Ok(())
  }

  /// Mark every still-open end close-on-exec.
  pub fn to_close_on_exec(&mut self) -> Result<(), CageError> {
    for fd in [self.read_fd, self.write_fd].into_iter().flatten() {
      let flags = fcntl(fd, FcntlArg::F_GETFD)?;
      let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
      fcntl(fd, FcntlArg::F_SETFD(flags))?;
    }
    Ok(())
  }
}

impl Drop for Pipe {
  fn drop(&mut self) {
    // 忽略关闭错误
    let _ = self.close();
  }
}

impl BridgePipes {
  pub fn new(stdout: Pipe, stderr: Pipe, result: Pipe) -> Self {
    BridgePipes {
      stdout,
      stderr,
      result,
    }
  }

  pub fn empty() -> Self {
    BridgePipes {
      stdout: Pipe::empty(),
      stderr: Pipe::empty(),
      result: Pipe::empty(),
    }
  }

  /// Mark every still-open end of all three pipes close-on-exec.
  pub fn to_close_on_exec(&mut self) -> Result<(), CageError> {
    self.stdout.to_close_on_exec()?;
    self.stderr.to_close_on_exec()?;
    self.result.to_close_on_exec()?;
    Ok(())
  }
}
