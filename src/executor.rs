use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, bounded, select};
use lazy_static::lazy_static;
use log::{debug, error, info};
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::sys::resource::{getrusage, setrlimit, Resource, Usage, UsageWho};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, access, dup2, execve, fork, AccessFlags, ForkResult};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeMessage;
use crate::error::CageError;
use crate::jail::{enter_jail, leave_jail};
use crate::pipe::{make_pipe_close_on_exec, Pipe};
use crate::result::{ExecutedResult, ExecutedStatus};
use crate::utils::into_c_string;

/// User-tunable kernel limits, applied in the child just before exec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimit {
  /// RLIMIT_CPU, seconds
  pub cpu: u64,
  /// RLIMIT_AS, bytes
  pub address_space: u64,
  /// RLIMIT_FSIZE, bytes
  pub fsize: u64,
}

/// Marker written to the error pipe when the child dies between fork and
/// exec. Fewer than four bytes on that pipe means the exec was reached.
pub const ERROR_SEQUENCE: [u8; 4] = [0x0d, 0x0e, 0x0a, 0x0d];

lazy_static! {
  /// Serializes every fork / spawn in this process so no other task can
  /// observe a half-forked state or carry a lock into the child.
  pub(crate) static ref FORK_LOCK: Mutex<()> = Mutex::new(());
}

/// Fork, jail and exec the user command of `bm`, then reap and classify.
///
/// Returns the outcome of the user program; an `Err` always means the
/// sandbox itself failed, never the program under test.
pub fn managed_exec(bm: &mut BridgeMessage) -> Result<ExecutedResult, CageError> {
  let mut error_pipe = make_pipe_close_on_exec()?;

  bm.pipes.to_close_on_exec()?;

  let fork_result = {
    let _guard = FORK_LOCK
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    unsafe { fork() }
  };

  match fork_result {
    Ok(ForkResult::Child) => {
      let err = match managed_exec_child(bm) {
        Err(err) => err,
        Ok(never) => match never {},
      };

      // 通过 error pipe 报告 sandbox 错误
      let _ = error_pipe.close_read();
      if let Ok(fd) = error_pipe.write_fd() {
        let _ = unistd::write(fd, &ERROR_SEQUENCE);
        let _ = unistd::write(fd, format!("{}", err).as_bytes());
      }
      let _ = error_pipe.close_write();

      unsafe { libc::_exit(-1) };
    }
    Ok(ForkResult::Parent { child, .. }) => {
      debug!("Supervising child process (pid = {})", child);

      let _jail = JailGuard {
        chroot: PathBuf::from(&bm.chroot_path),
      };

      bm.pipes.stdout.close()?;
      bm.pipes.stderr.close()?;
      bm.pipes.result.close_read()?;
      error_pipe.close_write()?;

      let (reap_tx, reap_rx) = bounded(1);
      thread::spawn(move || {
        let status = waitpid(child, None);
        let usage = getrusage(UsageWho::RUSAGE_CHILDREN);
        let _ = reap_tx.send((status, usage));
      });

      let cpu = bm.limits.cpu;
      let (pass_kill_tx, pass_kill_rx) = bounded::<()>(1);
      thread::spawn(move || {
        select! {
          recv(pass_kill_rx) -> _ => {}
          recv(after(Duration::from_secs(cpu + 5))) -> _ => {
            info!("Kill a sleeping process ({})", child);
            if let Err(err) = kill(child, Signal::SIGKILL) {
              error!("Failed to kill a sleeping process ({}): {}", child, err);
            }
          }
        }
      });

      let deadline = Duration::from_secs(2 * cpu + 10);
      let (status, usage) = match reap_rx.recv_timeout(deadline) {
        Ok((status, usage)) => {
          let _ = pass_kill_tx.send(());
          (status?, usage?)
        }
        Err(_) => {
          return Err(CageError::exec("unexpected timeout while waiting for the child"));
        }
      };
      debug!("Child process is reaped: {:?}", status);

      match read_error_report(&mut error_pipe)? {
        None => Ok(classify(status, &usage, &bm.limits, &bm.args)),
        Some(message) => Err(CageError::exec(message)),
      }
    }
    Err(_) => Err(CageError::fork("Fork failed")),
  }
}

/// Everything the child does between fork and exec. Never returns on
/// success; the caller reports the error through the error pipe.
fn managed_exec_child(bm: &mut BridgeMessage) -> Result<Infallible, CageError> {
  enter_jail(
    Path::new(&bm.chroot_path),
    Path::new(&bm.home_path),
    bm.user_id,
    bm.group_id,
  )?;

  // limit (1/2)
  set_limit(Resource::RLIMIT_CORE, 0)?;
  set_limit(Resource::RLIMIT_NOFILE, 512)?;
  set_limit(Resource::RLIMIT_NPROC, 30)?;
  set_limit(Resource::RLIMIT_MEMLOCK, 1024)?;

  umask(Mode::from_bits_truncate(bm.umask));

  if let Some(path) = bm.env("PATH") {
    env::set_var("PATH", path);
  }

  if bm.args.is_empty() {
    return Err(CageError::exec("args must contain at least one element"));
  }
  let exec_path = look_path(&bm.args[0])?;

  if let Some(stdin_path) = &bm.stdin_path {
    let fd = open(Path::new(stdin_path), OFlag::O_RDONLY, Mode::empty())
      .map_err(|e| CageError::exec(format!("open stdin {}: {}", stdin_path, e)))?;
    dup2(fd, 0)?;
    unistd::close(fd)?;
  }

  // redirect stdout
  bm.pipes.stdout.close_read()?;
  dup2(bm.pipes.stdout.write_fd()?, 1)?;
  bm.pipes.stdout.close_write()?;

  // redirect stderr
  bm.pipes.stderr.close_read()?;
  dup2(bm.pipes.stderr.write_fd()?, 2)?;
  bm.pipes.stderr.close_write()?;

  // 子进程不会写 result pipe
  bm.pipes.result.close()?;

  // limit (2/2), CPU soft +1 / hard +2 so SIGXCPU arrives before SIGKILL
  set_limit_soft_hard(Resource::RLIMIT_CPU, bm.limits.cpu + 1, bm.limits.cpu + 2)?;
  set_limit(Resource::RLIMIT_AS, bm.limits.address_space)?;
  set_limit(Resource::RLIMIT_FSIZE, bm.limits.fsize)?;

  let path = into_c_string(&exec_path.to_string_lossy());
  let args = bm
    .args
    .iter()
    .map(|a| into_c_string(a))
    .collect::<Vec<CString>>();
  let envs = bm
    .envs
    .iter()
    .map(|(k, v)| into_c_string(&format!("{}={}", k, v)))
    .collect::<Vec<CString>>();

  let err = execve(&path, &args, &envs).unwrap_err();
  Err(CageError::exec(format!(
    "failed to exec {}: {}",
    exec_path.to_string_lossy(),
    err
  )))
}

/// Read the error pipe after the reap. Fewer than four bytes means the
/// child reached exec and the wait status is a user-program outcome.
fn read_error_report(error_pipe: &mut Pipe) -> Result<Option<String>, CageError> {
  let fd = error_pipe.read_fd()?;
  let mut buf = vec![0u8; 128];
  let len = unistd::read(fd, &mut buf).unwrap_or(0);

  if len < ERROR_SEQUENCE.len() {
    return Ok(None);
  }
  if buf[..ERROR_SEQUENCE.len()] != ERROR_SEQUENCE {
    return Err(CageError::exec("invalid error byte sequence"));
  }

  let mut message = String::from_utf8_lossy(&buf[ERROR_SEQUENCE.len()..len]).into_owned();
  loop {
    match unistd::read(fd, &mut buf) {
      Ok(0) | Err(_) => break,
      Ok(size) => message.push_str(&String::from_utf8_lossy(&buf[..size])),
    }
  }

  Ok(Some(message))
}

/// Map a wait status and its rusage onto the verdict.
fn classify(
  status: WaitStatus,
  usage: &Usage,
  limits: &ResourceLimit,
  args: &[String],
) -> ExecutedResult {
  let cpu_time = seconds(usage.user_time()) + seconds(usage.system_time());
  // maxrss is reported in KiB
  let memory = usage.max_rss() as u64 * 1024;

  let (signal, return_code) = match status {
    WaitStatus::Exited(_, code) => (None, code),
    WaitStatus::Signaled(_, signal, _) => (Some(signal as i32), -1),
    _ => (None, -1),
  };

  let verdict = if signal == Some(Signal::SIGXCPU as i32) || cpu_time > limits.cpu as f32 {
    ExecutedStatus::CPULimit
  } else if (signal == Some(Signal::SIGSEGV as i32) || signal == Some(Signal::SIGABRT as i32))
    && memory >= limits.address_space
  {
    ExecutedStatus::MemoryLimit
  } else if signal == Some(Signal::SIGXFSZ as i32) {
    ExecutedStatus::OutputLimit
  } else if matches!(status, WaitStatus::Exited(_, 0)) {
    ExecutedStatus::Passed
  } else {
    ExecutedStatus::Error
  };

  ExecutedResult {
    used_cpu_time_sec: cpu_time,
    used_memory_bytes: memory,
    signal,
    return_code,
    command_line: args.join(" "),
    status: verdict,
    system_error_message: None,
  }
}

/// Resolve a command on PATH to an absolute executable path.
fn look_path(command: &str) -> Result<PathBuf, CageError> {
  if command.contains('/') {
    let path = Path::new(command)
      .absolutize()
      .map_err(|e| CageError::exec(format!("LookPath {}: {}", command, e)))?;
    if is_executable(&path) {
      return Ok(path.into_owned());
    }
    return Err(CageError::exec(format!(
      "LookPath: {} is not an executable file",
      command
    )));
  }

  let path_var = env::var("PATH").unwrap_or_default();
  for dir in path_var.split(':').filter(|dir| !dir.is_empty()) {
    let candidate = Path::new(dir).join(command);
    if is_executable(&candidate) {
      return Ok(candidate);
    }
  }
  Err(CageError::exec(format!(
    "LookPath: no {} found in PATH",
    command
  )))
}

fn is_executable(path: &Path) -> bool {
  path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn set_limit(resource: Resource, value: u64) -> Result<(), CageError> {
  setrlimit(resource, value, value)?;
  Ok(())
}

fn set_limit_soft_hard(resource: Resource, soft: u64, hard: u64) -> Result<(), CageError> {
  setrlimit(resource, soft, hard)?;
  Ok(())
}

fn seconds(val: TimeVal) -> f32 {
  val.tv_sec() as f32 + val.tv_usec() as f32 / 1e6
}

/// Undoes the jail mounts on every exit path of `managed_exec`.
struct JailGuard {
  chroot: PathBuf,
}

impl Drop for JailGuard {
  fn drop(&mut self) {
    leave_jail(&self.chroot);
  }
}
