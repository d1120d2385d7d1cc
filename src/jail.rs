use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, chroot, setgid, setgroups, setuid, Gid, Uid};

use crate::error::CageError;
use crate::utils::mount::MountPoint;

/// Mount the per-job view, chroot into it, then drop privilege.
///
/// The caller has already populated `chroot_path` with the job home
/// directory; this function only adds the system views and a private
/// tmpfs `/tmp` on top of it.
pub fn enter_jail(
  chroot_path: &Path,
  home_path: &Path,
  uid: u32,
  gid: u32,
) -> Result<(), CageError> {
  info!("Mount new root: {}", chroot_path.to_string_lossy());

  mount::<Path, Path, Path, Path>(
    Some(chroot_path),
    chroot_path,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REC,
    None,
  )
  .map_err(|e| CageError::jail(format!("bind new root: {}", e)))?;

  mount::<Path, Path, Path, Path>(
    None,
    chroot_path,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_REC,
    None,
  )
  .map_err(|e| CageError::jail(format!("remount new root: {}", e)))?;

  for mount_point in MountPoint::defaults() {
    if !mount_point.src().is_dir() {
      debug!(
        "Skip missing mount source {}",
        mount_point.src().to_string_lossy()
      );
      continue;
    }

    let target = jail_target(chroot_path, mount_point.dst());
    create_dir_all(&target)?;
    debug!("Mount directory {:?} -> {:?}", mount_point.src(), &target);

    mount::<PathBuf, PathBuf, PathBuf, PathBuf>(
      Some(mount_point.src()),
      &target,
      None,
      MsFlags::MS_BIND | MsFlags::MS_REC,
      None,
    )
    .map_err(|e| CageError::jail(format!("bind {:?}: {}", mount_point.dst(), e)))?;

    if mount_point.read_only() {
      mount::<PathBuf, PathBuf, PathBuf, PathBuf>(
        None,
        &target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
        None,
      )
      .map_err(|e| CageError::jail(format!("remount ro {:?}: {}", mount_point.dst(), e)))?;
    }
  }

  // 挂载私有 /tmp
  let tmp = chroot_path.join("tmp");
  create_dir_all(&tmp)?;
  mount::<str, PathBuf, str, str>(
    Some("tmpfs"),
    &tmp,
    Some("tmpfs"),
    MsFlags::empty(),
    None,
  )
  .map_err(|e| CageError::jail(format!("mount tmpfs /tmp: {}", e)))?;

  chroot(chroot_path).map_err(|e| CageError::jail(format!("chroot: {}", e)))?;
  chdir(home_path).map_err(|e| CageError::jail(format!("chdir {:?}: {}", home_path, e)))?;

  // 降低权限
  setgroups(&[]).map_err(|e| CageError::jail(format!("setgroups: {}", e)))?;
  setgid(Gid::from_raw(gid)).map_err(|e| CageError::jail(format!("setgid {}: {}", gid, e)))?;
  setuid(Uid::from_raw(uid)).map_err(|e| CageError::jail(format!("setuid {}: {}", uid, e)))?;

  // 必须无法取回 root
  if setuid(Uid::from_raw(0)).is_ok() {
    return Err(CageError::jail(
      "privilege drop verification failed: setuid(0) succeeded",
    ));
  }

  Ok(())
}

/// Unmount, in reverse order, everything `enter_jail` mounted.
///
/// Runs only in the supervising parent, after the child has been reaped.
/// Failures are logged and do not change the job verdict; the caller may
/// garbage-collect the directory out-of-band.
pub fn leave_jail(chroot_path: &Path) {
  let mut targets = vec![chroot_path.join("tmp")];
  for mount_point in MountPoint::defaults().iter().rev() {
    targets.push(jail_target(chroot_path, mount_point.dst()));
  }
  targets.push(chroot_path.to_path_buf());

  for target in targets {
    if !target.exists() {
      continue;
    }
    debug!("Unmount directory {:?}", &target);
    if let Err(err) = umount2(&target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
      if err == nix::errno::Errno::EINVAL {
        // 不是挂载点
        debug!("Not a mount point: {}", target.to_string_lossy());
      } else {
        error!("Fails umount {}: {}", target.to_string_lossy(), err);
      }
    }
  }
}

fn jail_target(chroot_path: &Path, dst: &Path) -> PathBuf {
  let relative = dst.strip_prefix(Path::new("/")).unwrap_or(dst);
  chroot_path.join(relative)
}
