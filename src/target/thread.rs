use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Bookkeeping of one traced thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    pub tid: Pid,
    /// Last status collected with `wait`.
    pub status: WaitStatus,
    /// Whether the last status has been collected and the thread not resumed since.
    pub waited: bool,
}

impl ThreadRecord {
    pub(crate) fn stopped(tid: Pid, status: WaitStatus) -> Self {
        ThreadRecord {
            tid,
            status,
            waited: true,
        }
    }

    pub(crate) fn running(tid: Pid) -> Self {
        ThreadRecord {
            tid,
            status: WaitStatus::StillAlive,
            waited: false,
        }
    }

    pub fn name(&self) -> Option<String> {
        procfs::process::Process::new(self.tid.as_raw())
            .and_then(|p| p.stat())
            .map(|stat| stat.comm)
            .ok()
    }
}
