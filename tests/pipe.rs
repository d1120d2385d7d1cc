use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd;

use cagej::{make_pipe, make_pipe_close_on_exec, make_pipe_nonblocking};

#[test]
fn it_carries_bytes_end_to_end() {
  let mut pipe = make_pipe().unwrap();

  let written = unistd::write(pipe.write_fd().unwrap(), b"ping").unwrap();
  assert_eq!(written, 4);
  pipe.close_write().unwrap();

  let mut buf = [0u8; 16];
  let read = unistd::read(pipe.read_fd().unwrap(), &mut buf).unwrap();
  assert_eq!(&buf[..read], b"ping");

  // write end gone, so end of stream
  let read = unistd::read(pipe.read_fd().unwrap(), &mut buf).unwrap();
  assert_eq!(read, 0);
}

#[test]
fn it_closes_each_end_at_most_once() {
  let mut pipe = make_pipe().unwrap();

  pipe.close_read().unwrap();
  // the second close is a no-op, not a double close
  pipe.close_read().unwrap();
  assert!(pipe.read_fd().is_err());

  // the other end is unaffected
  assert!(pipe.write_fd().is_ok());

  pipe.close_write().unwrap();
  pipe.close_write().unwrap();
  assert!(pipe.write_fd().is_err());

  pipe.close().unwrap();
}

#[test]
fn it_reports_closed_ends_deterministically() {
  let mut pipe = make_pipe().unwrap();
  pipe.close().unwrap();

  assert!(pipe.read_fd().is_err());
  assert!(pipe.write_fd().is_err());
}

#[test]
fn nonblocking_read_end_never_blocks() {
  let pipe = make_pipe_nonblocking().unwrap();

  let mut buf = [0u8; 16];
  let err = unistd::read(pipe.read_fd().unwrap(), &mut buf).unwrap_err();
  assert_eq!(err, Errno::EAGAIN);

  // the write end stays blocking for the jailed program
  let flags = fcntl(pipe.write_fd().unwrap(), FcntlArg::F_GETFL).unwrap();
  assert_eq!(flags & nix::libc::O_NONBLOCK, 0);
}

#[test]
fn close_on_exec_marks_both_ends() {
  let pipe = make_pipe_close_on_exec().unwrap();

  for fd in [pipe.read_fd().unwrap(), pipe.write_fd().unwrap()] {
    let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
    let flags = FdFlag::from_bits_truncate(flags);
    assert!(flags.contains(FdFlag::FD_CLOEXEC));
  }
}

#[test]
fn plain_pipe_can_be_upgraded_to_close_on_exec() {
  let mut pipe = make_pipe().unwrap();

  let flags = fcntl(pipe.read_fd().unwrap(), FcntlArg::F_GETFD).unwrap();
  assert!(!FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));

  pipe.to_close_on_exec().unwrap();

  for fd in [pipe.read_fd().unwrap(), pipe.write_fd().unwrap()] {
    let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
    assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
  }
}
