use std::os::unix::prelude::RawFd;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, Pid};

use crate::bridge::{BridgeMessage, ENV_CALLBACK_EXECUTABLE, ENV_DEBUG_TAG, ENV_PACKED_CONTENT};
use crate::error::CageError;
use crate::executor::FORK_LOCK;
use crate::pipe::{make_pipe, make_pipe_nonblocking, BridgePipes};
use crate::result::ExecutedResult;

/// Size of one drained chunk.
pub const READ_LENGTH: usize = 8096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
  Stdout,
  Stderr,
}

/// One chunk of the user program output. Ordering is preserved within a
/// source but not across the two sources.
#[derive(Debug, Clone)]
pub struct StreamOutput {
  pub source: StreamSource,
  pub buffer: Vec<u8>,
}

/// Driver-level deadlines.
#[derive(Debug, Clone, Copy)]
pub struct InvokeConfig {
  /// How long to wait for the encoded result after the cloner exited.
  pub result_timeout: Duration,
  /// Hard bound on the whole invocation.
  pub overall_deadline: Duration,
}

impl Default for InvokeConfig {
  fn default() -> Self {
    InvokeConfig {
      result_timeout: Duration::from_secs(5),
      overall_deadline: Duration::from_secs(500),
    }
  }
}

/// Launch the cloner binary for the job of `bm`, stream its stdout and
/// stderr into `output`, and wait for the one encoded result.
///
/// The extra process hop keeps chroot and setuid out of the calling
/// process: only the short-lived cloner ever degrades itself.
pub fn invoke_cloner(
  cloner_path: &Path,
  bm: &mut BridgeMessage,
  output: Sender<StreamOutput>,
  debug_tag: &str,
  config: &InvokeConfig,
) -> Result<ExecutedResult, CageError> {
  info!("{}: Cloner path: {}", debug_tag, cloner_path.to_string_lossy());

  // A failed encode or spawn must still release every descriptor the job
  // pipes hold; anything already moved into `bm.pipes` is closed here on
  // the way out.
  let (mut child, stdout_fd, stderr_fd) = match spawn_cloner(cloner_path, bm, debug_tag) {
    Ok(spawned) => spawned,
    Err(err) => {
      let _ = bm.pipes.stdout.close();
      let _ = bm.pipes.stderr.close();
      let _ = bm.pipes.result.close();
      return Err(err);
    }
  };
  let cloner_pid = child.id();

  let (wait_tx, wait_rx) = bounded(1);
  thread::spawn(move || {
    let status = child.wait();
    let _ = wait_tx.send(status);
  });

  let (stdout_close_tx, stdout_close_rx) = bounded::<()>(1);
  let (stderr_close_tx, stderr_close_rx) = bounded::<()>(1);
  let stdout_sink = output.clone();
  let stdout_drainer =
    thread::spawn(move || read_pipe_async(stdout_fd, StreamSource::Stdout, stdout_close_rx, stdout_sink));
  let stderr_drainer =
    thread::spawn(move || read_pipe_async(stderr_fd, StreamSource::Stderr, stderr_close_rx, output));

  let mut outcome = wait_for_result(&mut bm.pipes, wait_rx, cloner_pid, debug_tag, config);

  // Tear the drainers down before any descriptor is closed, keeping the
  // bytes that already arrived.
  let _ = stdout_close_tx.send(());
  let _ = stderr_close_tx.send(());
  let drains = [
    ("stdout", stdout_drainer.join()),
    ("stderr", stderr_drainer.join()),
  ];

  if let Ok(result) = &mut outcome {
    let mut notes = vec![];
    for (name, drain) in drains {
      match drain {
        Ok(Ok(())) => {}
        Ok(Err(err)) => notes.push(format!("{} drain: {}", name, err)),
        Err(_) => notes.push(format!("{} drainer panicked", name)),
      }
    }
    if !notes.is_empty() {
      let annex = notes.join("; ");
      result.system_error_message = Some(match result.system_error_message.take() {
        Some(message) => format!("{}; {}", message, annex),
        None => annex,
      });
    }
  }

  let _ = bm.pipes.stdout.close();
  let _ = bm.pipes.stderr.close();
  let _ = bm.pipes.result.close();

  outcome
}

/// Build the three job pipes, encode the message and launch the cloner.
///
/// The lock covers pipe creation through the close-on-exec marking, so a
/// concurrent spawn can never inherit this job's descriptors. On failure
/// the pipes are either still local (closed on drop) or already inside
/// `bm.pipes`, where the caller closes them.
fn spawn_cloner(
  cloner_path: &Path,
  bm: &mut BridgeMessage,
  debug_tag: &str,
) -> Result<(std::process::Child, RawFd, RawFd), CageError> {
  let _guard = FORK_LOCK
    .lock()
    .unwrap_or_else(|poisoned| poisoned.into_inner());

  let stdout_pipe = make_pipe_nonblocking()?;
  let stderr_pipe = make_pipe_nonblocking()?;
  let result_pipe = make_pipe()?;
  bm.pipes = BridgePipes::new(stdout_pipe, stderr_pipe, result_pipe);

  // Encode while every descriptor is still open: the numbers inside the
  // message must be valid in the spawned cloner.
  let content = bm.encode()?;

  let mut command = Command::new(cloner_path);
  command
    .env(ENV_CALLBACK_EXECUTABLE, &bm.callback_path)
    .env(ENV_PACKED_CONTENT, &content)
    .env(ENV_DEBUG_TAG, debug_tag);

  let child = command
    .spawn()
    .map_err(|err| CageError::invoke(format!("spawn process cloner: {}", err)))?;

  bm.pipes.stdout.close_write()?;
  bm.pipes.stderr.close_write()?;
  bm.pipes.result.close_write()?;
  bm.pipes.to_close_on_exec()?;

  let stdout_fd = bm.pipes.stdout.read_fd()?;
  let stderr_fd = bm.pipes.stderr.read_fd()?;

  Ok((child, stdout_fd, stderr_fd))
}

fn wait_for_result(
  pipes: &mut BridgePipes,
  wait_rx: Receiver<std::io::Result<std::process::ExitStatus>>,
  cloner_pid: u32,
  debug_tag: &str,
  config: &InvokeConfig,
) -> Result<ExecutedResult, CageError> {
  match wait_rx.recv_timeout(config.overall_deadline) {
    Ok(Ok(status)) => {
      debug!("{}: process cloner is finished: {}", debug_tag, status);
      if !status.success() {
        return Err(CageError::invoke(format!(
          "{}: process cloner finished with failed state: {}",
          debug_tag, status
        )));
      }

      // The reader owns a dup of the descriptor so a late thread can
      // never touch a reused fd number.
      let result_fd = unistd::dup(pipes.result.read_fd()?)?;
      let (result_tx, result_rx) = bounded(1);
      thread::spawn(move || {
        let buf = read_pipe_blocking(result_fd);
        let _ = unistd::close(result_fd);
        let _ = result_tx.send(buf);
      });

      match result_rx.recv_timeout(config.result_timeout) {
        Ok(Ok(buf)) => {
          let result = ExecutedResult::decode(&buf)?;
          debug!("{}: got a result: {:?}", debug_tag, result);
          Ok(result)
        }
        Ok(Err(errno)) => Err(CageError::invoke(format!(
          "{}: read result pipe: {}",
          debug_tag, errno
        ))),
        Err(_) => Err(CageError::invoke(format!(
          "{}: timeout, failed to get a result",
          debug_tag
        ))),
      }
    }
    Ok(Err(err)) => Err(CageError::invoke(format!(
      "{}: wait process cloner: {}",
      debug_tag, err
    ))),
    Err(_) => {
      error!("{}: process cloner hit the overall deadline", debug_tag);
      // The cloner leads its own process group, so this takes the jailed
      // child down with it.
      let group = Pid::from_raw(-(cloner_pid as i32));
      if kill(group, Signal::SIGKILL).is_err() {
        let _ = kill(Pid::from_raw(cloner_pid as i32), Signal::SIGKILL);
      }
      Err(CageError::invoke(format!(
        "{}: process cloner timeouted",
        debug_tag
      )))
    }
  }
}

/// Drain one nonblocking stream in chunks, publishing to the sink, until
/// end of stream, a read error, or the force-close signal.
///
/// The signal is only honored while the pipe is empty, so bytes that are
/// already buffered always reach the sink.
fn read_pipe_async(
  fd: RawFd,
  source: StreamSource,
  force_close: Receiver<()>,
  sink: Sender<StreamOutput>,
) -> Result<(), CageError> {
  let mut buffer = vec![0u8; READ_LENGTH];

  loop {
    match unistd::read(fd, &mut buffer) {
      Ok(0) => return Ok(()),
      Ok(size) => {
        let chunk = StreamOutput {
          source,
          buffer: buffer[..size].to_vec(),
        };
        if sink.send(chunk).is_err() {
          // 接收端已关闭
          return Ok(());
        }
      }
      Err(Errno::EAGAIN) => {
        if force_close.try_recv().is_ok() {
          return Ok(());
        }
        thread::sleep(Duration::from_millis(1));
      }
      Err(errno) => return Err(errno.into()),
    }
  }
}

fn read_pipe_blocking(fd: RawFd) -> Result<Vec<u8>, Errno> {
  let mut result = vec![];
  let mut buffer = vec![0u8; READ_LENGTH];

  loop {
    match unistd::read(fd, &mut buffer) {
      Ok(0) => return Ok(result),
      Ok(size) => result.extend_from_slice(&buffer[..size]),
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(errno),
    }
  }
}
