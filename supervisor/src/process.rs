//! Process-group handling for the worker.
//!
//! The worker may fork helpers (daemons, compilers). It is spawned as the
//! leader of a new session so a forced stop can take the whole group down.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Killed,
}

/// Kill the process group led by `pid` (Unix) or the process itself (Windows).
pub fn kill_process_group(pid: u32) -> std::io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return Ok(KillOutcome::NotRunning);
        };
        // SAFETY: killpg has no memory-safety preconditions.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(KillOutcome::NotRunning);
            }
            return Err(err);
        }
        Ok(KillOutcome::Killed)
    }

    #[cfg(windows)]
    {
        windows_terminate(pid)
    }
}

#[cfg(windows)]
fn windows_terminate(pid: u32) -> std::io::Result<KillOutcome> {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

    // SAFETY: Win32 API call.
    let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) } as HANDLE;
    if handle.is_null() {
        return Ok(KillOutcome::NotRunning);
    }
    // SAFETY: handle is valid until closed below.
    let ok = unsafe { TerminateProcess(handle, 1) };
    let err = std::io::Error::last_os_error();
    // SAFETY: always close the handle we opened.
    unsafe {
        CloseHandle(handle);
    }
    if ok == 0 {
        return Err(err);
    }
    Ok(KillOutcome::Killed)
}

/// Make the spawned worker the leader of a new session, so its pid is also
/// its process group id.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Linux-only: take the worker down with us if we die without a teardown.
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_new_session(_cmd: &mut tokio::process::Command) {}
