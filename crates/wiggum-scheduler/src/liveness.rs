//! Process liveness: the only OS capability the state store needs.

/// Answers "is this process identifier still alive?".
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

impl<F> ProcessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// Probes with signal 0: delivers nothing, only checks existence.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            let Ok(raw) = i32::try_from(pid) else {
                return false;
            };
            // pid 0 would address our own process group
            if raw <= 0 {
                return false;
            }
            kill(Pid::from_raw(raw), None).is_ok()
        }

        #[cfg(not(unix))]
        {
            // No cheap existence check here: treat as gone
            let _ = pid;
            false
        }
    }
}
