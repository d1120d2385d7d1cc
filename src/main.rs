use std::env;
use std::fs::create_dir_all;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use flexi_logger::{FileSpec, Logger};
use log::{error, info, warn};
use nix::unistd::{chown, Gid, Group, Uid, User};

use cagej::utils::default_format;
use cagej::{
  invoke_cloner, BridgeMessage, BridgePipes, CageError, CageExit, ExecutedResult, ExecutedStatus,
  InvokeConfig, ResourceLimit, StreamOutput, StreamSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short, long, help = "Output report")]
  report: bool,

  #[arg(long, requires = "report", help = "Output JSON format report")]
  json: bool,

  #[arg(short, long, default_value_t = 10, help = "CPU time limit (unit: s)")]
  time: u64,

  #[arg(short, long, default_value_t = 1 << 30, help = "Address space limit (unit: byte)")]
  memory: u64,

  #[arg(short, long, default_value_t = 5 << 20, help = "Output file size limit (unit: byte)")]
  fsize: u64,

  #[arg(long, value_name = "KEY=VALUE", help = "Pass environment variables")]
  env: Vec<String>,

  #[arg(long, help = "Jailed process uid [default: nobody]")]
  uid: Option<u32>,

  #[arg(long, help = "Jailed process gid [default: nogroup]")]
  gid: Option<u32>,

  #[arg(long, help = "Path of the process cloner binary")]
  cloner: Option<PathBuf>,

  #[arg(long, help = "Correlation tag for logs")]
  debug_tag: Option<String>,

  #[arg(long, default_value_t = 5, help = "Result read timeout after cloner exit (unit: s)")]
  result_timeout: u64,

  #[arg(long, default_value_t = 500, help = "Overall driver deadline (unit: s)")]
  deadline: u64,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run user program inside the jail")]
  Run {
    #[arg(help = "Program to be executed")]
    program: String,

    #[arg(help = "Arguments")]
    arguments: Vec<String>,

    #[arg(long, help = "Jail root directory [default: a fresh temp dir]")]
    chroot: Option<PathBuf>,

    #[arg(long, default_value = "/home/cagej", help = "Working directory inside the jail")]
    home: String,

    #[arg(short = 'i', long, help = "Redirect stdin from a file inside the jail")]
    stdin: Option<String>,

    #[arg(long, default_value = "022", help = "Umask of the jailed process (octal)")]
    umask: String,

    #[arg(long, help = "User-phase callback executable")]
    callback: Option<String>,
  },
}

impl Cli {
  fn resolve(self) -> Result<(BridgeMessage, PathBuf, InvokeConfig, String), CageError> {
    let uid = match self.uid {
      Some(uid) => uid,
      None => User::from_name("nobody")?
        .map(|user| user.uid.as_raw())
        .unwrap_or(65534),
    };
    let gid = match self.gid {
      Some(gid) => gid,
      None => Group::from_name("nogroup")?
        .map(|group| group.gid.as_raw())
        .unwrap_or(65534),
    };

    let mut envs = vec![(
      "PATH".to_string(),
      env::var("PATH").unwrap_or("".to_string()),
    )];
    for env_var in self.env {
      envs.push(cagej::utils::parse_env(env_var)?);
    }

    let cloner_path = match self.cloner {
      Some(path) => path,
      None => {
        let current = env::current_exe()?;
        let dir = current
          .parent()
          .ok_or_else(|| CageError::cli("cannot locate the cloner binary"))?;
        dir.join("cagej-cloner")
      }
    };

    let config = InvokeConfig {
      result_timeout: Duration::from_secs(self.result_timeout),
      overall_deadline: Duration::from_secs(self.deadline),
    };

    let debug_tag = self
      .debug_tag
      .unwrap_or_else(|| format!("cagej-{}", std::process::id()));

    match self.command {
      Commands::Run {
        program,
        arguments,
        chroot,
        home,
        stdin,
        umask,
        callback,
      } => {
        let chroot = match chroot {
          Some(path) => path,
          None => tempfile::tempdir()?.into_path(),
        };

        let umask = u32::from_str_radix(&umask, 8)
          .map_err(|_| CageError::cli("umask should be an octal number"))?;

        prepare_home(&chroot, Path::new(&home), uid, gid)?;

        let args = [vec![program], arguments].concat();
        let message = BridgeMessage {
          chroot_path: chroot.to_string_lossy().into_owned(),
          home_path: home,
          user_id: uid,
          group_id: gid,
          callback_path: callback.unwrap_or_default(),
          limits: ResourceLimit {
            cpu: self.time,
            address_space: self.memory,
            fsize: self.fsize,
          },
          args,
          envs,
          umask,
          stdin_path: stdin,
          pipes: BridgePipes::empty(),
        };

        Ok((message, cloner_path, config, debug_tag))
      }
    }
  }
}

/// Make sure the working directory exists inside the jail root and is
/// owned by the jailed user.
fn prepare_home(chroot: &Path, home: &Path, uid: u32, gid: u32) -> Result<(), CageError> {
  let relative = home.strip_prefix(Path::new("/")).unwrap_or(home);
  let target = chroot.join(relative);
  create_dir_all(&target)?;
  if let Err(err) = chown(&target, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
    warn!("Fails chown {}: {}", target.to_string_lossy(), err);
  }
  Ok(())
}

fn report_result(result: &ExecutedResult, json: bool) {
  let status = result.status;
  if json {
    println!(
      "{{\n  \"status\": {},\n  \"time\": {:.3},\n  \"memory\": {},\n  \"return_code\": {},\n  \"signal\": {}\n}}",
      status as u8,
      result.used_cpu_time_sec,
      result.used_memory_bytes,
      result.return_code,
      result
        .signal
        .map(|s| s.to_string())
        .unwrap_or("null".to_string()),
    );
  } else {
    println!("status: {:?}", status);
    println!("time: {:.3} s", result.used_cpu_time_sec);
    println!("memory: {} bytes", result.used_memory_bytes);
    println!("return code: {}", result.return_code);
    if let Some(signal) = result.signal {
      println!("signal: {}", signal);
    }
    if status == ExecutedStatus::UnknownError {
      if let Some(message) = &result.system_error_message {
        println!("system error: {}", message);
      }
    }
  }
}

fn bootstrap() -> Result<(), CageError> {
  Logger::try_with_str("cagej=info")?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("CAGEJ_LOG").unwrap_or("./logs/".into()))
        .basename("cagej")
        .discriminant(format!(
          "{}",
          chrono::offset::Local::now().format("%Y-%m-%d")
        ))
        .suppress_timestamp(),
    )
    .append()
    .format_for_files(default_format)
    .start()?;

  info!("Start running cagej");

  let cli = Cli::parse();
  let report = cli.report;
  let json_format = cli.json;
  let (mut message, cloner_path, config, debug_tag) = cli.resolve()?;

  let (output_tx, output_rx) = unbounded::<StreamOutput>();
  let printer = thread::spawn(move || {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    for chunk in output_rx.iter() {
      match chunk.source {
        StreamSource::Stdout => {
          let _ = stdout.write_all(&chunk.buffer);
          let _ = stdout.flush();
        }
        StreamSource::Stderr => {
          let _ = stderr.write_all(&chunk.buffer);
          let _ = stderr.flush();
        }
      }
    }
  });

  let result = invoke_cloner(&cloner_path, &mut message, output_tx, &debug_tag, &config);
  let _ = printer.join();

  match result {
    Ok(result) => {
      info!("Running cagej finished: {:?}", result.status);
      if report {
        report_result(&result, json_format);
      }
      Ok(())
    }
    Err(err) => {
      error!("Running cagej failed: {}", err);
      Err(err)
    }
  }
}

fn main() -> CageExit {
  match bootstrap() {
    Ok(_) => CageExit::Ok,
    Err(err) => CageExit::Err(err),
  }
}
