use cagej::{BridgeMessage, BridgePipes, ExecutedResult, ExecutedStatus, ResourceLimit};

fn sample_result(status: ExecutedStatus) -> ExecutedResult {
  ExecutedResult {
    used_cpu_time_sec: 0.75,
    used_memory_bytes: 12 * 1024 * 1024,
    signal: Some(9),
    return_code: -1,
    command_line: "./Main.out --flag".to_string(),
    status,
    system_error_message: None,
  }
}

#[test]
fn result_roundtrips_every_status() {
  for status in [
    ExecutedStatus::Passed,
    ExecutedStatus::Error,
    ExecutedStatus::CPULimit,
    ExecutedStatus::MemoryLimit,
    ExecutedStatus::OutputLimit,
    ExecutedStatus::UnknownError,
  ] {
    let result = sample_result(status);
    let decoded = ExecutedResult::decode(&result.encode().unwrap()).unwrap();
    assert_eq!(decoded, result);
  }
}

#[test]
fn result_roundtrips_optional_fields() {
  let mut result = sample_result(ExecutedStatus::Passed);
  result.signal = None;
  result.return_code = 0;
  let decoded = ExecutedResult::decode(&result.encode().unwrap()).unwrap();
  assert_eq!(decoded, result);

  let mut result = sample_result(ExecutedStatus::UnknownError);
  result.system_error_message = Some("Cage Jail Error: chroot: EPERM".to_string());
  let decoded = ExecutedResult::decode(&result.encode().unwrap()).unwrap();
  assert_eq!(decoded, result);
}

#[test]
fn status_wire_mapping_is_stable() {
  let expected = [
    (ExecutedStatus::Passed, 0u8),
    (ExecutedStatus::Error, 1),
    (ExecutedStatus::CPULimit, 2),
    (ExecutedStatus::MemoryLimit, 3),
    (ExecutedStatus::OutputLimit, 4),
    (ExecutedStatus::UnknownError, 5),
  ];
  for (status, code) in expected {
    // a bare status encodes as one positive fixint
    let buf = rmp_serde::to_vec(&status).unwrap();
    assert_eq!(buf, vec![code]);
    let decoded: ExecutedStatus = rmp_serde::from_slice(&buf).unwrap();
    assert_eq!(decoded, status);
  }
}

#[test]
fn unknown_status_byte_is_rejected() {
  let decoded: Result<ExecutedStatus, _> = rmp_serde::from_slice(&[0x06]);
  assert!(decoded.is_err());
}

#[test]
fn bridge_message_roundtrips_through_env_transport() {
  let message = BridgeMessage {
    chroot_path: "/srv/sandbox/job42".to_string(),
    home_path: "/home/cagej".to_string(),
    user_id: 65534,
    group_id: 65534,
    callback_path: "/opt/cagej/callback".to_string(),
    limits: ResourceLimit {
      cpu: 10,
      address_space: 1 << 30,
      fsize: 5 << 20,
    },
    args: vec!["./Main.out".to_string(), "--flag".to_string()],
    envs: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
    umask: 0o022,
    stdin_path: Some("/home/cagej/stdin/1.in".to_string()),
    pipes: BridgePipes::empty(),
  };

  let encoded = message.encode().unwrap();
  // must survive an environment variable
  assert!(encoded.is_ascii());

  let decoded = BridgeMessage::decode(&encoded).unwrap();
  assert_eq!(decoded.chroot_path, message.chroot_path);
  assert_eq!(decoded.home_path, message.home_path);
  assert_eq!(decoded.user_id, message.user_id);
  assert_eq!(decoded.group_id, message.group_id);
  assert_eq!(decoded.callback_path, message.callback_path);
  assert_eq!(decoded.limits.cpu, message.limits.cpu);
  assert_eq!(decoded.limits.address_space, message.limits.address_space);
  assert_eq!(decoded.limits.fsize, message.limits.fsize);
  assert_eq!(decoded.args, message.args);
  assert_eq!(decoded.envs, message.envs);
  assert_eq!(decoded.umask, message.umask);
  assert_eq!(decoded.stdin_path, message.stdin_path);
}
