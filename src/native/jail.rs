use std::{
    io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use nix::{
    mount::{MntFlags, MsFlags, mount, umount2},
    sched::{CloneFlags, unshare},
    sys::statvfs::{FsFlags, statvfs},
    unistd::{chdir, pivot_root},
};
use tempfile::TempDir;

/// Host paths every sandbox sees read-only, when they exist.
const SYSTEM_PATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/libx32",
    "/etc/alternatives",
    "/etc/ld.so.cache",
];

const DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
];

/// A host path reproduced inside every jail.
#[derive(Debug, Clone)]
pub struct HostPath {
    path: PathBuf,
    kind: HostPathKind,
}

#[derive(Debug, Clone)]
enum HostPathKind {
    Link(PathBuf),
    Dir(MsFlags),
    File(MsFlags),
    Device,
}

/// Looks up the system paths plus `extra` on the host.
///
/// Missing paths are skipped. Symlinks are recreated as symlinks, so
/// `/bin -> usr/bin` keeps working once `/usr` is bound.
pub fn host_paths(extra: &[PathBuf]) -> io::Result<Vec<HostPath>> {
    let mut found = Vec::new();
    let system = SYSTEM_PATHS.iter().map(PathBuf::from);
    for path in system.chain(extra.iter().cloned()) {
        if !path.is_absolute() {
            tracing::warn!(path = %path.display(), "Ignoring relative sandbox path");
            continue;
        }
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        let kind = if meta.file_type().is_symlink() {
            HostPathKind::Link(std::fs::read_link(&path)?)
        } else if meta.is_dir() {
            HostPathKind::Dir(locked_flags(&path)?)
        } else {
            HostPathKind::File(locked_flags(&path)?)
        };
        found.push(HostPath { path, kind });
    }
    for device in DEVICES {
        if Path::new(device).exists() {
            found.push(HostPath {
                path: PathBuf::from(device),
                kind: HostPathKind::Device,
            });
        }
    }
    Ok(found)
}

/// Mount flags the kernel refuses to clear on a bind remount inside a user
/// namespace. A read-only remount has to repeat them.
fn locked_flags(path: &Path) -> io::Result<MsFlags> {
    let flags = statvfs(path)?.flags();
    let mut locked = MsFlags::empty();
    for (fs, ms) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if flags.contains(fs) {
            locked |= ms;
        }
    }
    if !flags.intersects(FsFlags::ST_NOATIME | FsFlags::ST_RELATIME) {
        locked |= MsFlags::MS_STRICTATIME;
    }
    Ok(locked)
}

#[derive(Debug, Clone)]
struct BindMount {
    source: PathBuf,
    target: PathBuf,
    recursive: bool,
    remount: Option<MsFlags>,
}

/// Everything a forked child needs to switch into the jail, computed up front
/// so the child only issues syscalls.
#[derive(Debug, Clone)]
pub struct JailLayout {
    root: PathBuf,
    proc: PathBuf,
    root_flags: MsFlags,
    mounts: Vec<BindMount>,
    workdir: PathBuf,
}

/// An empty root directory with mount points for the host paths and the
/// working directory. Removed on drop.
#[derive(Debug)]
pub struct Jail {
    _dir: TempDir,
    layout: JailLayout,
}

impl Jail {
    pub fn layout(&self) -> &JailLayout {
        &self.layout
    }
}

/// Builds a jail under `scratch_root` that exposes `workdir`, writable, at its
/// host path.
pub fn prepare(scratch_root: &Path, host: &[HostPath], workdir: &Path) -> io::Result<Jail> {
    let dir = tempfile::Builder::new().prefix("jail-").tempdir_in(scratch_root)?;
    let root = dir.path().to_path_buf();
    let mut mounts = Vec::new();

    for entry in host {
        let target = inside(&root, &entry.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match &entry.kind {
            HostPathKind::Link(to) => symlink(to, &target)?,
            HostPathKind::Dir(locked) => {
                std::fs::create_dir_all(&target)?;
                mounts.push(read_only(&entry.path, target, *locked));
            }
            HostPathKind::File(locked) => {
                std::fs::File::create(&target)?;
                mounts.push(read_only(&entry.path, target, *locked));
            }
            HostPathKind::Device => {
                std::fs::File::create(&target)?;
                mounts.push(BindMount {
                    source: entry.path.clone(),
                    target,
                    recursive: false,
                    remount: None,
                });
            }
        }
    }

    let inner = inside(&root, workdir);
    std::fs::create_dir_all(&inner)?;
    // Not recursive: the jail itself may live below the working directory.
    mounts.push(BindMount {
        source: workdir.to_path_buf(),
        target: inner,
        recursive: false,
        remount: Some(MsFlags::MS_NOSUID | MsFlags::MS_NODEV | locked_flags(workdir)?),
    });

    let proc = root.join("proc");
    std::fs::create_dir_all(&proc)?;
    std::fs::create_dir_all(root.join("tmp"))?;

    let layout = JailLayout {
        root_flags: locked_flags(&root)?,
        root,
        proc,
        mounts,
        workdir: workdir.to_path_buf(),
    };
    Ok(Jail { _dir: dir, layout })
}

fn read_only(source: &Path, target: PathBuf, locked: MsFlags) -> BindMount {
    BindMount {
        source: source.to_path_buf(),
        target,
        recursive: true,
        remount: Some(MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | locked),
    }
}

fn inside(root: &Path, host: &Path) -> PathBuf {
    root.join(host.strip_prefix("/").unwrap_or(host))
}

impl JailLayout {
    /// Moves the calling process into a private mount namespace rooted at the
    /// jail and changes into the working directory.
    ///
    /// Needs `CAP_SYS_ADMIN` over the current user namespace and membership
    /// of the pid namespace whose `/proc` should be visible.
    pub fn enter(&self) -> io::Result<()> {
        const NONE: Option<&str> = None;

        unshare(CloneFlags::CLONE_NEWNS)?;
        mount(NONE, "/", NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE)?;
        mount(
            Some(self.root.as_path()),
            self.root.as_path(),
            NONE,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            NONE,
        )?;

        for bind in &self.mounts {
            let mut flags = MsFlags::MS_BIND;
            if bind.recursive {
                flags |= MsFlags::MS_REC;
            }
            mount(
                Some(bind.source.as_path()),
                bind.target.as_path(),
                NONE,
                flags,
                NONE,
            )?;
            if let Some(flags) = bind.remount {
                mount(
                    NONE,
                    bind.target.as_path(),
                    NONE,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
                    NONE,
                )?;
            }
        }

        mount(
            Some("proc"),
            self.proc.as_path(),
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            NONE,
        )?;
        mount(
            NONE,
            self.root.as_path(),
            NONE,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | self.root_flags,
            NONE,
        )?;

        chdir(self.root.as_path())?;
        pivot_root(".", ".")?;
        // The old root is stacked on top of the new one until detached.
        umount2(".", MntFlags::MNT_DETACH)?;
        chdir(self.workdir.as_path())?;
        Ok(())
    }
}
