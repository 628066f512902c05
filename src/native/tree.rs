use std::{
    collections::{HashSet, VecDeque},
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        prctl,
        signal::{SigHandler, Signal, kill, raise, signal},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, close, fork, getpid, pipe2},
};

/// Exit code reported when the supervised child vanished without a status.
const EXIT_LOST: i32 = 125;

/// How a supervised child ended, in a form that fits through a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Code(i32),
    Signaled(Signal),
}

impl Exit {
    fn encode(self) -> [u8; 2] {
        match self {
            Exit::Code(code) => [0, code as u8],
            Exit::Signaled(signal) => [1, signal as i32 as u8],
        }
    }

    fn decode(bytes: [u8; 2]) -> Option<Exit> {
        match bytes {
            [0, code] => Some(Exit::Code(code.into())),
            [1, signal] => Signal::try_from(i32::from(signal)).ok().map(Exit::Signaled),
            _ => None,
        }
    }
}

/// Splits the freshly spawned keeper into a supervisor and the payload.
///
/// The keeper becomes a child subreaper, so every process the payload leaves
/// behind is reparented to it and killed once the payload exits. With
/// `pid_namespace` the keeper has already unshared a pid namespace: an extra
/// init process sits between keeper and payload, and the whole namespace dies
/// with it.
///
/// Only the payload returns, and it goes on to exec. The keeper and the init
/// process exit with the payload's status, so the judge sees it as the status
/// of its direct child.
///
/// # Safety
///
/// Must only be called between fork and exec, in the process spawned by the
/// judge.
pub unsafe fn supervise(pid_namespace: bool) -> io::Result<()> {
    // Handlers inherited from the judge would write to fds that get reused.
    // SAFETY: restoring the default disposition installs no handler.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }?;
    prctl::set_child_subreaper(true)?;

    if !pid_namespace {
        // SAFETY: the child only makes syscalls before exec.
        return match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                close_inherited_fds(&[]);
                keep(child, None)
            }
            ForkResult::Child => Ok(()),
        };
    }

    let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: as above.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(writer);
            close_inherited_fds(&[reader.as_raw_fd()]);
            keep(child, Some(reader))
        }
        ForkResult::Child => {
            drop(reader);
            prctl::set_pdeathsig(Signal::SIGKILL)?;
            // SAFETY: as above.
            match unsafe { fork() }? {
                ForkResult::Parent { child } => {
                    close_inherited_fds(&[writer.as_raw_fd()]);
                    init(child, writer)
                }
                ForkResult::Child => {
                    drop(writer);
                    Ok(())
                }
            }
        }
    }
}

/// Waits for `child`, kills whatever it left behind and exits like it did.
fn keep(child: Pid, status: Option<OwnedFd>) -> ! {
    let own = reap_until(child);
    sweep_children();
    let reported = status.and_then(|fd| {
        let mut bytes = [0u8; 2];
        File::from(fd).read_exact(&mut bytes).ok()?;
        Exit::decode(bytes)
    });
    exit_like(reported.unwrap_or(own))
}

/// Runs as pid 1 of the sandbox's pid namespace. Leaving takes every other
/// process in the namespace down with it.
fn init(child: Pid, status: OwnedFd) -> ! {
    let exit = reap_until(child);
    let _ = File::from(status).write_all(&exit.encode());
    // SAFETY: _exit skips the judge's atexit handlers, which do not belong here.
    unsafe { nix::libc::_exit(0) }
}

fn reap_until(child: Pid) -> Exit {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == child => return Exit::Code(code),
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == child => {
                return Exit::Signaled(signal);
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return Exit::Code(EXIT_LOST),
        }
    }
}

/// Kills and reaps children until none are left.
fn sweep_children() {
    let me = getpid();
    loop {
        for pid in children_of(me) {
            let _ = kill(pid, Signal::SIGKILL);
        }
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(1)),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return,
        }
    }
}

fn exit_like(exit: Exit) -> ! {
    let code = match exit {
        Exit::Code(code) => code,
        Exit::Signaled(sig) => {
            // SAFETY: restoring the default disposition installs no handler.
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
            let _ = raise(sig);
            128 + sig as i32
        }
    };
    // SAFETY: as in `init`.
    unsafe { nix::libc::_exit(code) }
}

/// Closes every descriptor except `keep`. The judge's sockets and the pipes of
/// other sandboxes must not outlive their owners in here.
fn close_inherited_fds(keep: &[RawFd]) {
    let fds: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => return,
    };
    for fd in fds.into_iter().filter(|fd| !keep.contains(fd)) {
        // EBADF for the directory handle read above.
        let _ = close(fd);
    }
}

/// Direct children of `parent`, across all of its threads.
pub fn children_of(parent: Pid) -> Vec<Pid> {
    let mut children = Vec::new();
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{parent}/task")) else {
        return children;
    };
    for task in tasks.flatten() {
        match std::fs::read_to_string(task.path().join("children")) {
            Ok(list) => children.extend(
                list.split_whitespace()
                    .filter_map(|pid| pid.parse().ok())
                    .map(Pid::from_raw),
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return children_by_scan(parent),
            Err(_) => {}
        }
    }
    children
}

/// Slow path for kernels built without `/proc/<pid>/task/<tid>/children`.
fn children_by_scan(parent: Pid) -> Vec<Pid> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| parse_ppid(&stat))
                == Some(parent.as_raw())
        })
        .map(Pid::from_raw)
        .collect()
}

fn parse_ppid(stat: &str) -> Option<i32> {
    // The command name may itself contain parentheses and spaces.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// The processes started for one execution, seen from the judge.
///
/// `keeper` is the judge's direct child. Everything below it belongs to the
/// run. Dropping an armed tree kills it.
#[derive(Debug)]
pub struct ProcessTree {
    keeper: Pid,
    /// Depth of the sandboxed program below the keeper.
    payload_depth: usize,
    armed: bool,
}

impl ProcessTree {
    pub fn new(keeper: u32, pid_namespace: bool) -> Self {
        Self {
            keeper: Pid::from_raw(keeper as i32),
            payload_depth: if pid_namespace { 2 } else { 1 },
            armed: true,
        }
    }

    /// Descendants of the keeper, parents before children, with their depth.
    fn members(&self) -> Vec<(Pid, usize)> {
        let mut members = Vec::new();
        let mut seen = HashSet::from([self.keeper]);
        let mut queue = VecDeque::from([(self.keeper, 0)]);
        while let Some((pid, depth)) = queue.pop_front() {
            for child in children_of(pid) {
                if seen.insert(child) {
                    members.push((child, depth + 1));
                    queue.push_back((child, depth + 1));
                }
            }
        }
        members
    }

    /// SIGKILLs everything below the keeper. The keeper then reaps, sweeps
    /// the stragglers and exits.
    pub fn kill(&self) {
        for (pid, _) in self.members() {
            // ESRCH just means it is already gone.
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    /// Sum of the peak resident set sizes of the sandboxed processes.
    ///
    /// The keeper and the namespace init are forks of the judge that never
    /// exec, so they are left out.
    pub fn peak_resident_bytes(&self) -> u64 {
        self.members()
            .into_iter()
            .filter(|(_, depth)| *depth >= self.payload_depth)
            .filter_map(|(pid, _)| {
                let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
                parse_vm_hwm(&status)
            })
            .sum()
    }

    /// Stops the drop guard once the keeper is reaped and its pid may be reused.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
            let _ = kill(self.keeper, Signal::SIGKILL);
        }
    }
}

fn parse_vm_hwm(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmHWM:"))?;
    let kib: u64 = line
        .trim_start_matches("VmHWM:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}
