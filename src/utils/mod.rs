use std::env;
use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::{error, info, Record};

use crate::error::CageError;

pub mod mount;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Sent a result to the driver```
#[allow(unused)]
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string(string: &str) -> CString {
  CString::new(string).expect("Convert &str to CString should work")
}

pub fn parse_env(text: String) -> Result<(String, String), CageError> {
  let arr = text.split('=').collect::<Vec<&str>>();
  if arr.len() == 2 {
    let key = arr.first().unwrap();
    let value = arr.get(1).unwrap();
    Ok((key.to_string(), value.to_string()))
  } else if arr.len() == 1 {
    let key = arr.first().unwrap();
    let value = env::var(key).unwrap_or("".to_string());
    info!("Read environment variable {} = {}", key, value);
    Ok((key.to_string(), value.to_string()))
  } else {
    error!("Wrong environment variable string ({}) format", &text);
    Err(CageError::cli("Wrong environment variable string format"))
  }
}

/// Split a user command line the way a POSIX shell tokenizes words:
/// whitespace separates, single / double quotes group, backslash escapes
/// the next character outside single quotes.
pub fn split_command_line(text: &str) -> Result<Vec<String>, CageError> {
  let mut words = vec![];
  let mut current = String::new();
  let mut in_word = false;
  let mut chars = text.chars();

  while let Some(ch) = chars.next() {
    match ch {
      ' ' | '\t' | '\n' => {
        if in_word {
          words.push(std::mem::take(&mut current));
          in_word = false;
        }
      }
      '\\' => {
        in_word = true;
        match chars.next() {
          Some(escaped) => current.push(escaped),
          None => return Err(CageError::cli("trailing backslash in command line")),
        }
      }
      '\'' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('\'') => break,
            Some(inner) => current.push(inner),
            None => return Err(CageError::cli("unclosed single quote in command line")),
          }
        }
      }
      '"' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
              Some(escaped) => current.push(escaped),
              None => return Err(CageError::cli("trailing backslash in command line")),
            },
            Some(inner) => current.push(inner),
            None => return Err(CageError::cli("unclosed double quote in command line")),
          }
        }
      }
      _ => {
        in_word = true;
        current.push(ch);
      }
    }
  }

  if in_word {
    words.push(current);
  }

  Ok(words)
}
