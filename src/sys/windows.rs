use std::fs::File;
use std::io;
use std::os::windows::io::{AsRawHandle, IntoRawHandle};
use std::os::windows::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::error::{DaemonError, DaemonResult};
use crate::roles::READY_EXIT_CODE;
use crate::stdio::StdStream;

mod win_api {
    use std::ffi::c_void;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        pub fn OpenProcess(dwDesiredAccess: u32, bInheritHandle: i32, dwProcessId: u32) -> *mut c_void;
        pub fn TerminateProcess(hProcess: *mut c_void, uExitCode: u32) -> i32;
        pub fn GetExitCodeProcess(hProcess: *mut c_void, lpExitCode: *mut u32) -> i32;
        pub fn WaitForSingleObject(hHandle: *mut c_void, dwMilliseconds: u32) -> u32;
        pub fn GetStdHandle(nStdHandle: u32) -> *mut c_void;
        pub fn SetStdHandle(nStdHandle: u32, hHandle: *mut c_void) -> i32;
        pub fn CloseHandle(hObject: *mut c_void) -> i32;
        pub fn GetLastError() -> u32;
        pub fn ExitProcess(uExitCode: u32) -> !;
    }

    pub const PROCESS_TERMINATE: u32 = 0x0001;
    pub const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    pub const STILL_ACTIVE: u32 = 259;
    pub const INFINITE: u32 = 0xFFFF_FFFF;
    pub const WAIT_FAILED: u32 = 0xFFFF_FFFF;

    pub const STD_INPUT_HANDLE: u32 = -10i32 as u32;
    pub const STD_OUTPUT_HANDLE: u32 = -11i32 as u32;
    pub const STD_ERROR_HANDLE: u32 = -12i32 as u32;
    pub const INVALID_HANDLE_VALUE: *mut c_void = -1isize as *mut c_void;
}

const DETACHED_PROCESS: u32 = 0x0000_0008;
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;

struct ScopedHandle(*mut std::ffi::c_void);

impl ScopedHandle {
    fn open(pid: u32, access: u32) -> io::Result<Self> {
        let handle = unsafe { win_api::OpenProcess(access, 0, pid) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(ScopedHandle(handle))
    }

    fn terminate(&self, code: u32) -> io::Result<()> {
        if unsafe { win_api::TerminateProcess(self.0, code) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.0.is_null() {
                win_api::CloseHandle(self.0);
            }
        }
    }
}

/// Windows has no advisory lock here; creating the file is the lock.
pub(crate) fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

/// Signal `0` only checks that the process is alive. Anything else
/// terminates it with the signal number as exit status.
pub(crate) fn send_signal(pid: u32, signum: i32) -> io::Result<()> {
    if signum == 0 {
        let process = ScopedHandle::open(pid, win_api::PROCESS_QUERY_LIMITED_INFORMATION)?;
        let mut code = 0u32;
        if unsafe { win_api::GetExitCodeProcess(process.0, &mut code) } == 0 {
            return Err(io::Error::last_os_error());
        }
        if code != win_api::STILL_ACTIVE {
            return Err(io::Error::new(io::ErrorKind::NotFound, "process has exited"));
        }
        return Ok(());
    }
    ScopedHandle::open(pid, win_api::PROCESS_TERMINATE)?.terminate(signum as u32)
}

pub(crate) fn kill_process(pid: u32) -> io::Result<()> {
    ScopedHandle::open(pid, win_api::PROCESS_TERMINATE)?.terminate(1)
}

/// Ends the shielding worker with the readiness status.
pub(crate) fn notify_ready(worker: u32) -> DaemonResult<()> {
    ScopedHandle::open(worker, win_api::PROCESS_TERMINATE)
        .and_then(|process| process.terminate(READY_EXIT_CODE as u32))
        .map_err(|source| DaemonError::Syscall {
            call: "TerminateProcess",
            source,
        })
}

/// The daemon terminates the worker directly, so nothing ever sets this.
pub(crate) fn arm_ready_flag() -> io::Result<Arc<AtomicBool>> {
    Ok(Arc::new(AtomicBool::new(false)))
}

pub(crate) fn detach_command(command: &mut Command) {
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

pub(crate) fn reset_signal_dispositions() {}

pub(crate) fn set_umask(_mask: u32) {}

pub(crate) fn await_exit(child: &Child) -> io::Result<()> {
    let handle = child.as_raw_handle();
    if unsafe { win_api::WaitForSingleObject(handle, win_api::INFINITE) } == win_api::WAIT_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Console control events (`CTRL_C_EVENT`, `CTRL_BREAK_EVENT`) and the
/// Ctrl-C exit status all count as SIGINT.
pub(crate) fn received_signal(status: ExitStatus) -> i32 {
    match status.code() {
        Some(0) | Some(1) => signal_hook::consts::SIGINT,
        Some(code) if code as u32 == STATUS_CONTROL_C_EXIT => signal_hook::consts::SIGINT,
        Some(code) => code,
        None => 0,
    }
}

pub(crate) fn has_std_streams() -> bool {
    let handle = unsafe { win_api::GetStdHandle(win_api::STD_OUTPUT_HANDLE) };
    !handle.is_null() && handle != win_api::INVALID_HANDLE_VALUE
}

pub(crate) fn replace_std_stream(stream: StdStream, file: &File) -> DaemonResult<()> {
    let id = match stream {
        StdStream::Stdin => win_api::STD_INPUT_HANDLE,
        StdStream::Stdout => win_api::STD_OUTPUT_HANDLE,
        StdStream::Stderr => win_api::STD_ERROR_HANDLE,
    };
    // The standard handle owns its own duplicate from here on.
    let handle = file.try_clone()?.into_raw_handle();
    if unsafe { win_api::SetStdHandle(id, handle) } == 0 {
        return Err(DaemonError::Win32(unsafe { win_api::GetLastError() }));
    }
    Ok(())
}

pub(crate) fn exit_immediately(code: i32) -> ! {
    super::flush_std();
    unsafe { win_api::ExitProcess(code as u32) }
}
