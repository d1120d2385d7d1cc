use std::fs::{self, create_dir_all, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, Once};

use crossbeam_channel::unbounded;
use flexi_logger::Logger;
use log::info;
use nix::unistd::{Uid, User};
use tempfile::tempdir;

use cagej::{
  invoke_cloner, BridgeMessage, BridgePipes, ExecutedResult, ExecutedStatus, InvokeConfig,
  ResourceLimit, StreamSource,
};

static INIT: Once = Once::new();

fn setup_logger() {
  INIT.call_once(|| {
    Logger::try_with_str("cagej=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// Jail scenarios need chroot and setuid.
fn has_privileges() -> bool {
  if !Uid::effective().is_root() {
    eprintln!("skipped: this test requires root");
    return false;
  }
  true
}

struct TestJail {
  root: PathBuf,
  home: PathBuf,
}

fn setup_jail() -> TestJail {
  let root = tempdir().unwrap().into_path();
  fs::set_permissions(&root, Permissions::from_mode(0o755)).unwrap();

  let home = root.join("home/cagej");
  create_dir_all(&home).unwrap();
  fs::set_permissions(&home, Permissions::from_mode(0o777)).unwrap();

  TestJail { root, home }
}

fn compile(jail: &TestJail, source: &str) -> String {
  let executable = jail.home.join("Main.out");

  let output = Command::new("gcc")
    .arg(format!("./fixtures/{}", source))
    .arg("-o")
    .arg(executable.to_str().unwrap())
    .output()
    .expect("gcc should be available");
  assert!(
    output.status.success(),
    "compile {} failed: {}",
    source,
    String::from_utf8_lossy(&output.stderr)
  );

  fs::set_permissions(&executable, Permissions::from_mode(0o755)).unwrap();

  // the path as the jailed process sees it
  "/home/cagej/Main.out".to_string()
}

fn nobody() -> u32 {
  User::from_name("nobody")
    .ok()
    .flatten()
    .map(|user| user.uid.as_raw())
    .unwrap_or(65534)
}

fn make_message(jail: &TestJail, args: Vec<String>, limits: ResourceLimit) -> BridgeMessage {
  BridgeMessage {
    chroot_path: jail.root.to_string_lossy().into_owned(),
    home_path: "/home/cagej".to_string(),
    user_id: nobody(),
    group_id: 65534,
    callback_path: String::new(),
    limits,
    args,
    envs: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
    umask: 0o022,
    stdin_path: None,
    pipes: BridgePipes::empty(),
  }
}

fn default_limits() -> ResourceLimit {
  ResourceLimit {
    cpu: 10,
    address_space: 1 << 30,
    fsize: 5 << 20,
  }
}

// 串行执行 jail 场景
static RUN_LOCK: Mutex<()> = Mutex::new(());

fn run_message(mut message: BridgeMessage) -> (ExecutedResult, Vec<u8>, Vec<u8>) {
  let _guard = RUN_LOCK.lock().unwrap_or_else(|err| err.into_inner());

  let cloner = PathBuf::from(env!("CARGO_BIN_EXE_cagej-cloner"));
  let (output_tx, output_rx) = unbounded();

  let result = invoke_cloner(
    &cloner,
    &mut message,
    output_tx,
    "test",
    &InvokeConfig::default(),
  )
  .unwrap();

  let mut stdout = vec![];
  let mut stderr = vec![];
  for chunk in output_rx.try_iter() {
    match chunk.source {
      StreamSource::Stdout => stdout.extend(chunk.buffer),
      StreamSource::Stderr => stderr.extend(chunk.buffer),
    }
  }

  (result, stdout, stderr)
}

#[test]
fn it_should_run_hello() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "hello.c");
  let message = make_message(&jail, vec![program], default_limits());

  let (result, stdout, _) = run_message(message);

  info!("hello result: {:?}", result);
  assert_eq!(result.status, ExecutedStatus::Passed);
  assert_eq!(result.return_code, 0);
  assert_eq!(result.signal, None);
  assert_eq!(stdout, b"hi\n");
}

#[test]
fn it_should_report_nonzero_exit() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "exit7.c");
  let message = make_message(&jail, vec![program], default_limits());

  let (result, _, _) = run_message(message);

  assert_eq!(result.status, ExecutedStatus::Error);
  assert_eq!(result.return_code, 7);
  assert_eq!(result.signal, None);
}

#[test]
fn it_should_stop_cpu_loop() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "cpuloop.c");
  let mut limits = default_limits();
  limits.cpu = 1;
  let message = make_message(&jail, vec![program], limits);

  let (result, _, _) = run_message(message);

  info!("cpu loop result: {:?}", result);
  assert_eq!(result.status, ExecutedStatus::CPULimit);
  assert!(result.used_cpu_time_sec >= 1.0 && result.used_cpu_time_sec <= 3.0);
}

#[test]
fn it_should_fail_on_missing_executable() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let message = make_message(&jail, vec!["/no/such/bin".to_string()], default_limits());

  let (result, _, _) = run_message(message);

  assert_eq!(result.status, ExecutedStatus::UnknownError);
  let message = result.system_error_message.expect("diagnostic expected");
  assert!(message.contains("LookPath"), "unexpected message: {}", message);
}

#[test]
fn it_should_redirect_stdin() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "echo.c");

  let stdin_file = jail.home.join("stdin.txt");
  fs::write(&stdin_file, "abc").unwrap();
  fs::set_permissions(&stdin_file, Permissions::from_mode(0o644)).unwrap();

  let mut message = make_message(&jail, vec![program], default_limits());
  message.stdin_path = Some("/home/cagej/stdin.txt".to_string());

  let (result, stdout, _) = run_message(message);

  assert_eq!(result.status, ExecutedStatus::Passed);
  assert_eq!(stdout, b"abc");
}

#[test]
fn it_should_not_run_fork_storm() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "forkstorm.c");
  let message = make_message(&jail, vec![program], default_limits());

  let (result, _, _) = run_message(message);

  info!("fork storm result: {:?}", result);
  // the fixture exits 1 as soon as a fork fails under the process budget
  assert_eq!(result.status, ExecutedStatus::Error);
  assert_eq!(result.return_code, 1);
  assert_eq!(result.signal, None);
}

#[test]
fn it_should_stop_huge_output() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "fsize.c");
  let mut limits = default_limits();
  limits.fsize = 1 << 20;
  let message = make_message(&jail, vec![program], limits);

  let (result, _, _) = run_message(message);

  info!("fsize result: {:?}", result);
  assert_eq!(result.status, ExecutedStatus::OutputLimit);
  assert_eq!(result.signal, Some(nix::sys::signal::Signal::SIGXFSZ as i32));
}

#[test]
fn it_should_stop_memory_hog() {
  setup_logger();
  if !has_privileges() {
    return;
  }

  let jail = setup_jail();
  let program = compile(&jail, "memhog.c");
  let mut limits = default_limits();
  limits.address_space = 256 << 20;
  let message = make_message(&jail, vec![program], limits);

  let (result, _, _) = run_message(message);

  info!("memory hog result: {:?}", result);
  assert_ne!(result.status, ExecutedStatus::Passed);
}
