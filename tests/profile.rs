use std::collections::HashMap;

use cagej::profile::{PhaseDetail, SelectableCommand};
use cagej::utils::split_command_line;

fn run_phase() -> PhaseDetail {
  let mut allowed = HashMap::new();
  allowed.insert(
    "-std".to_string(),
    SelectableCommand {
      default: vec!["-std=c++14".to_string()],
      select: vec!["-std=c++11".to_string(), "-std=c++14".to_string()],
    },
  );
  allowed.insert(
    "-Wall".to_string(),
    SelectableCommand {
      default: vec![],
      select: vec![],
    },
  );

  PhaseDetail {
    file: "prog.cpp".to_string(),
    extension: "cpp".to_string(),
    command: "g++".to_string(),
    env: HashMap::new(),
    allowed_command_line: allowed,
    fixed_command_line: vec![
      vec!["-o".to_string(), "prog.out".to_string()],
      vec!["-O2".to_string()],
    ],
  }
}

#[test]
fn it_assembles_args_in_order() {
  let phase = run_phase();
  let selected = vec![vec!["-std".to_string(), "-std=c++11".to_string()]];
  let args = phase.make_complete_args("prog.cpp 'extra arg'", &selected).unwrap();

  assert_eq!(
    args,
    vec![
      "g++",
      "-std",
      "-std=c++11",
      "-o",
      "prog.out",
      "-O2",
      "prog.cpp",
      "extra arg",
    ]
  );
}

#[test]
fn it_rejects_unknown_option_key() {
  let phase = run_phase();
  let selected = vec![vec!["-fsanitize".to_string(), "address".to_string()]];
  assert!(phase.make_complete_args("", &selected).is_err());
}

#[test]
fn it_rejects_value_outside_select_set() {
  let phase = run_phase();
  let selected = vec![vec!["-std".to_string(), "-std=c++23".to_string()]];
  assert!(phase.make_complete_args("", &selected).is_err());
}

#[test]
fn it_accepts_bare_key_without_values() {
  let phase = run_phase();
  let selected = vec![vec!["-Wall".to_string()]];
  let args = phase.make_complete_args("", &selected).unwrap();
  assert_eq!(args[1], "-Wall");
}

#[test]
fn it_rejects_bare_key_with_value_set() {
  let phase = run_phase();
  let selected = vec![vec!["-std".to_string()]];
  assert!(phase.make_complete_args("", &selected).is_err());
}

#[test]
fn it_rejects_wrong_option_arity() {
  let phase = run_phase();
  let selected = vec![vec![
    "-std".to_string(),
    "-std=c++11".to_string(),
    "-std=c++14".to_string(),
  ]];
  assert!(phase.make_complete_args("", &selected).is_err());
}

#[test]
fn it_rejects_empty_command() {
  let mut phase = run_phase();
  phase.command = String::new();
  assert!(phase.make_complete_args("", &[]).is_err());
}

#[test]
fn it_splits_command_lines_like_a_shell() {
  assert_eq!(
    split_command_line("a b  c").unwrap(),
    vec!["a", "b", "c"]
  );
  assert_eq!(
    split_command_line("a 'b c' \"d e\"").unwrap(),
    vec!["a", "b c", "d e"]
  );
  assert_eq!(
    split_command_line("a\\ b \"c \\\" d\"").unwrap(),
    vec!["a b", "c \" d"]
  );
  assert_eq!(split_command_line("").unwrap(), Vec::<String>::new());
  assert!(split_command_line("unclosed 'quote").is_err());
  assert!(split_command_line("unclosed \"quote").is_err());
  assert!(split_command_line("trailing \\").is_err());
}
