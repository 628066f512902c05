use std::{
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::{
    sched::{CloneFlags, unshare},
    sys::{
        prctl,
        resource::{Resource, setrlimit},
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork, getegid, geteuid},
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::oneshot,
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::Isolation,
    core::{
        domain::{ExecutionOutcome, ExecutionSpec, Scratch, TerminationReason},
        traits::sandbox::{Sandbox, SandboxError},
    },
    native::{
        jail::{self, HostPath, Jail, JailLayout},
        tree::{self, ProcessTree},
    },
};

const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const MAX_FILE_BYTES: u64 = 256 * 1024 * 1024;
/// Tasks, threads included, one sandboxed run may have at once.
const MAX_PROCESSES: u64 = 128;
/// Headroom for address space that is reserved but never touched.
const ADDRESS_SPACE_SLACK: u64 = 256 * 1024 * 1024;
/// Id the sandboxed program runs as inside its user namespace.
const SANDBOX_ID: u32 = 1000;
/// Exit code of a failed isolation check whose error carries no errno.
const EXIT_UNKNOWN: i32 = 255;

/// Runs commands as descendants of the judge, one process tree per
/// invocation.
///
/// Each invocation gets a scratch directory under `scratch_root` and an
/// environment holding only the variables listed in the [`ExecutionSpec`].
/// When namespaces are available the program also gets its own user, pid,
/// network and mount namespace, rooted in a jail that shows the system paths
/// read-only and the working directory writable.
#[derive(Clone, Debug)]
pub struct NativeSandbox {
    scratch_root: PathBuf,
    namespaces: Option<Namespaces>,
}

#[derive(Clone, Debug)]
struct Namespaces {
    host: Vec<HostPath>,
    maps: IdMaps,
}

/// Contents of `uid_map` and `gid_map` for a new user namespace.
#[derive(Clone, Debug)]
struct IdMaps {
    uid: Vec<u8>,
    gid: Vec<u8>,
}

impl IdMaps {
    fn current() -> Self {
        Self {
            uid: format!("{SANDBOX_ID} {} 1", geteuid()).into_bytes(),
            gid: format!("{SANDBOX_ID} {} 1", getegid()).into_bytes(),
        }
    }
}

impl NativeSandbox {
    /// Checks once whether namespaces can be created here.
    ///
    /// With [`Isolation::Required`] a failed check is an error. With
    /// [`Isolation::BestEffort`] it is logged and programs run without
    /// namespaces, contained by the process tree alone.
    pub fn new<T>(
        scratch_root: T,
        isolation: Isolation,
        sandbox_paths: &[PathBuf],
    ) -> Result<Self, SandboxError>
    where
        T: AsRef<Path>,
    {
        let scratch_root = scratch_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&scratch_root).map_err(SandboxError::Workspace)?;
        let mut sandbox = NativeSandbox {
            scratch_root,
            namespaces: None,
        };
        if isolation == Isolation::Off {
            tracing::info!("Sandbox namespaces are off");
            return Ok(sandbox);
        }

        let namespaces = Namespaces {
            host: jail::host_paths(sandbox_paths).map_err(SandboxError::Isolation)?,
            maps: IdMaps::current(),
        };
        match check_isolation(&sandbox.scratch_root, &namespaces) {
            Ok(()) => {
                tracing::info!(
                    host_paths = namespaces.host.len(),
                    "Sandboxed programs run in private namespaces"
                );
                sandbox.namespaces = Some(namespaces);
            }
            Err(e) if isolation == Isolation::Required => {
                return Err(SandboxError::Isolation(e));
            }
            Err(e) => tracing::warn!(
                error = %e,
                "Namespaces unavailable, sandboxed programs share the judge's filesystem, network and pid space"
            ),
        }
        Ok(sandbox)
    }

    pub fn is_isolated(&self) -> bool {
        self.namespaces.is_some()
    }

    async fn prepare(&self, scratch: &Scratch) -> Result<WorkDir, SandboxError> {
        match scratch {
            Scratch::InPlace(dir) => Ok(WorkDir::Borrowed(dir.clone())),
            Scratch::Fresh { seed } => {
                tokio::fs::create_dir_all(&self.scratch_root)
                    .await
                    .map_err(SandboxError::Workspace)?;
                let root = self.scratch_root.clone();
                let seed = seed.clone();
                let dir = tokio::task::spawn_blocking(move || -> io::Result<TempDir> {
                    let dir = tempfile::Builder::new().prefix("run-").tempdir_in(root)?;
                    copy_dir(&seed, dir.path())?;
                    Ok(dir)
                })
                .await
                .map_err(|e| SandboxError::Workspace(io::Error::other(e)))?
                .map_err(SandboxError::Workspace)?;
                Ok(WorkDir::Owned(dir))
            }
        }
    }

    async fn prepare_jail(&self, host: &[HostPath], workdir: &Path) -> Result<Jail, SandboxError> {
        let root = self.scratch_root.clone();
        let host = host.to_vec();
        let workdir = workdir.to_path_buf();
        tokio::task::spawn_blocking(move || jail::prepare(&root, &host, &workdir))
            .await
            .map_err(|e| SandboxError::Workspace(io::Error::other(e)))?
            .map_err(SandboxError::Workspace)
    }
}

#[async_trait::async_trait]
impl Sandbox for NativeSandbox {
    #[tracing::instrument(skip_all, fields(program = %spec.command.program.display()))]
    async fn execute(&self, spec: &ExecutionSpec) -> Result<ExecutionOutcome, SandboxError> {
        let workdir = self.prepare(&spec.scratch).await?;
        let dir = workdir.path();
        let jail = match &self.namespaces {
            Some(namespaces) => Some(self.prepare_jail(&namespaces.host, dir).await?),
            None => None,
        };

        let program = if spec.command.program.is_relative()
            && spec.command.program.components().count() > 1
        {
            dir.join(&spec.command.program)
        } else {
            spec.command.program.clone()
        };

        let mut command = Command::new(&program);
        command
            .args(&spec.command.args)
            .current_dir(dir)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .env("HOME", dir)
            .env("TMPDIR", dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let launch = Launch {
            namespaces: self
                .namespaces
                .as_ref()
                .zip(jail.as_ref())
                .map(|(namespaces, jail)| (namespaces.maps.clone(), jail.layout().clone())),
            cpu_secs: spec.limits.time_ms.div_ceil(1000) + 1,
            address_space: spec
                .limits
                .memory_bytes
                .map(|bytes| bytes.saturating_mul(4).saturating_add(ADDRESS_SPACE_SLACK)),
        };
        // SAFETY: the hook runs between fork and exec. It forks again and only
        // makes syscalls on data prepared above.
        unsafe {
            command.pre_exec(move || launch.run());
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SandboxError::Wait(io::Error::other("child exited before it was tracked")));
        };
        let mut tree = ProcessTree::new(pid, self.is_isolated());
        tracing::debug!(pid, isolated = self.is_isolated(), "Spawned sandboxed process");

        let stdin = child.stdin.take().map(|mut pipe| {
            let input = spec.stdin.clone().into_bytes();
            tokio::spawn(async move {
                // The program may exit without reading its input.
                let _ = pipe.write_all(&input).await;
            })
        });
        let stdout = child
            .stdout
            .take()
            .map(|pipe| Drain::start(pipe, spec.limits.output_bytes));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| Drain::start(pipe, spec.limits.output_bytes));

        let deadline = tokio::time::sleep(spec.limits.wall_time());
        tokio::pin!(deadline);
        let mut memory_poll = tokio::time::interval(MEMORY_POLL_INTERVAL);
        let mut peak_memory_bytes = 0;

        let (status, killed_for) = loop {
            tokio::select! {
                status = child.wait() => break (status.map_err(SandboxError::Wait)?, None),
                _ = &mut deadline => {
                    tree.kill();
                    break (child.wait().await.map_err(SandboxError::Wait)?, Some(TerminationReason::TimedOut));
                }
                _ = memory_poll.tick() => {
                    // procfs reads do not block on disk.
                    peak_memory_bytes = peak_memory_bytes.max(tree.peak_resident_bytes());
                    if spec.limits.memory_bytes.is_some_and(|limit| peak_memory_bytes > limit) {
                        tree.kill();
                        break (child.wait().await.map_err(SandboxError::Wait)?, Some(TerminationReason::MemoryExceeded));
                    }
                }
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        // The keeper swept the tree before exiting, and its pid is free again.
        tree.disarm();

        if let Some(handle) = stdin {
            handle.abort();
        }
        let stdout = Drain::collect(stdout).await;
        let stderr = Drain::collect(stderr).await;

        let over_memory = spec
            .limits
            .memory_bytes
            .is_some_and(|limit| peak_memory_bytes > limit);
        let reason = match killed_for {
            Some(reason) => reason,
            None if status.success() => TerminationReason::Completed,
            // Allocation failures under the address-space cap.
            None if over_memory => TerminationReason::MemoryExceeded,
            None => TerminationReason::ProcessError,
        };
        tracing::debug!(?reason, ?status, elapsed_ms, peak_memory_bytes, "Sandboxed process finished");

        Ok(ExecutionOutcome {
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            exit_code: status.code(),
            signal: status.signal(),
            elapsed_ms,
            peak_memory_bytes,
            reason,
        })
    }
}

/// What the spawned child does before it execs the program.
struct Launch {
    namespaces: Option<(IdMaps, JailLayout)>,
    cpu_secs: u64,
    address_space: Option<u64>,
}

impl Launch {
    fn run(&self) -> io::Result<()> {
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some((maps, _)) = &self.namespaces {
            enter_namespaces(maps)?;
        }
        // SAFETY: called from the pre-exec hook.
        unsafe { tree::supervise(self.namespaces.is_some()) }?;

        if let Some((_, jail)) = &self.namespaces {
            jail.enter()?;
            // Counted per user namespace, so only this run's tasks add up.
            setrlimit(Resource::RLIMIT_NPROC, MAX_PROCESSES, MAX_PROCESSES)?;
        }
        setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        prctl::set_no_new_privs()?;
        Ok(())
    }
}

/// Unshares user, network and pid namespaces. The caller stays in its pid
/// namespace; its next child becomes pid 1 of the new one.
fn enter_namespaces(maps: &IdMaps) -> io::Result<()> {
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWPID)?;
    write_id_maps(maps)
}

/// Maps the caller's own ids into a freshly unshared user namespace.
/// Without a mapping the kernel refuses to create files.
fn write_id_maps(maps: &IdMaps) -> io::Result<()> {
    std::fs::write("/proc/self/setgroups", b"deny")?;
    std::fs::write("/proc/self/uid_map", &maps.uid)?;
    std::fs::write("/proc/self/gid_map", &maps.gid)
}

/// Goes through namespace creation and the jail switch in throwaway
/// children, without exec'ing anything.
fn check_isolation(scratch_root: &Path, namespaces: &Namespaces) -> io::Result<()> {
    let workdir = tempfile::Builder::new().prefix("check-").tempdir_in(scratch_root)?;
    let jail = jail::prepare(scratch_root, &namespaces.host, workdir.path())?;

    // SAFETY: the children only make syscalls and leave through _exit.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => wait_for_check(child),
        ForkResult::Child => {
            let result = enter_namespaces(&namespaces.maps).and_then(|()| {
                // SAFETY: as above.
                match unsafe { fork() }? {
                    ForkResult::Parent { child } => wait_for_check(child),
                    ForkResult::Child => {
                        let code = check_exit_code(jail.layout().enter());
                        // SAFETY: skips the judge's atexit handlers.
                        unsafe { nix::libc::_exit(code) }
                    }
                }
            });
            // SAFETY: as above.
            unsafe { nix::libc::_exit(check_exit_code(result)) }
        }
    }
}

fn check_exit_code(result: io::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e
            .raw_os_error()
            .filter(|errno| (1..EXIT_UNKNOWN).contains(errno))
            .unwrap_or(EXIT_UNKNOWN),
    }
}

fn wait_for_check(child: Pid) -> io::Result<()> {
    match waitpid(child, None)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(_, EXIT_UNKNOWN) => Err(io::Error::other("namespace setup failed")),
        WaitStatus::Exited(_, errno) => Err(io::Error::from_raw_os_error(errno)),
        other => Err(io::Error::other(format!("namespace setup ended with {other:?}"))),
    }
}

enum WorkDir {
    Owned(TempDir),
    Borrowed(PathBuf),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Owned(dir) => dir.path(),
            WorkDir::Borrowed(dir) => dir,
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Reads the stream until EOF or until told to stop, keeping at most `cap`
/// bytes. Stopping early marks the capture truncated.
async fn read_capped<R>(
    mut reader: R,
    cap: usize,
    mut stop: oneshot::Receiver<()>,
) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = tokio::select! {
            n = reader.read(&mut buf) => n?,
            _ = &mut stop => {
                captured.truncated = true;
                return Ok(captured);
            }
        };
        if n == 0 {
            return Ok(captured);
        }
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
}

/// A background read of one output pipe.
struct Drain {
    handle: JoinHandle<io::Result<Captured>>,
    stop: oneshot::Sender<()>,
}

impl Drain {
    fn start<R>(reader: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        Self {
            handle: tokio::spawn(read_capped(reader, cap, stopped)),
            stop,
        }
    }

    /// Waits briefly for EOF, then keeps whatever arrived so far.
    async fn collect(drain: Option<Drain>) -> Captured {
        let Some(Drain { mut handle, stop }) = drain else {
            return Captured::default();
        };
        let result = match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Output pipe still open after the run, keeping partial output");
                let _ = stop.send(());
                handle.await
            }
        };
        match result {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read sandboxed output");
                Captured::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Output reader task failed");
                Captured::default()
            }
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir(&target)?;
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
