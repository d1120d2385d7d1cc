use std::env;
use std::process::exit;

use flexi_logger::{FileSpec, Logger};
use log::{error, info};
use nix::unistd::{setpgid, Pid};

use cagej::utils::default_format;
use cagej::{
  managed_exec, BridgeMessage, ExecutedResult, ENV_CALLBACK_EXECUTABLE, ENV_DEBUG_TAG,
  ENV_PACKED_CONTENT,
};

fn init_logger() {
  // 没有日志也要继续运行
  let _ = Logger::try_with_str("cagej=info").map(|logger| {
    logger
      .log_to_file(
        FileSpec::default()
          .directory(env::var("CAGEJ_LOG").unwrap_or("./logs/".into()))
          .basename("cagej-cloner")
          .discriminant(format!(
            "{}",
            chrono::offset::Local::now().format("%Y-%m-%d")
          ))
          .suppress_timestamp(),
      )
      .append()
      .format_for_files(default_format)
      .start()
  });
}

fn main() {
  init_logger();

  // Lead a fresh process group so the driver can take the whole jail
  // down with one signal.
  let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

  let (callback_path, packed_content, debug_tag) = match (
    env::var(ENV_CALLBACK_EXECUTABLE),
    env::var(ENV_PACKED_CONTENT),
    env::var(ENV_DEBUG_TAG),
  ) {
    (Ok(callback), Ok(packed), Ok(tag)) => (callback, packed, tag),
    _ => {
      eprintln!("A number of parameters is not enough.");
      exit(1);
    }
  };

  let mut message = match BridgeMessage::decode(&packed_content) {
    Ok(message) => message,
    Err(err) => {
      error!("{}: broken bridge message: {}", debug_tag, err);
      eprintln!("broken bridge message: {}", err);
      exit(1);
    }
  };

  info!(
    "{}: process cloner started (callback: {})",
    debug_tag, callback_path
  );

  let result = match managed_exec(&mut message) {
    Ok(result) => result,
    Err(err) => {
      error!("{}: sandbox failure: {}", debug_tag, err);
      let mut result = ExecutedResult::system_failure(format!("{}", err));
      result.command_line = message.args.join(" ");
      result
    }
  };

  if let Err(err) = result.send_to(&mut message.pipes) {
    error!("{}: failed to send the result: {}", debug_tag, err);
    eprintln!("failed to send the result: {}", err);
    exit(1);
  }

  info!("{}: sent a result", debug_tag);
}
