use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, close, dup2, setpgid, Pid};
use tracing::warn;

use crate::error::{Error, Result};
use crate::parse::JobConfig;

const EXIT_CHDIR_FAILED: i32 = 126;
const EXIT_EXEC_FAILED: i32 = 127;

/*
    @@@
    @ExecImage;
    . Everything the forked child needs, converted to C strings before fork().
    . argv/envp are kept alive next to their NUL-terminated pointer arrays so execve() can be called without allocating.
*/
pub struct ExecImage {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    working_dir: CString,
    stdout: Option<CString>,
    stderr: Option<CString>,
    umask: Mode,
}

fn nul_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// `argv[0]` with a slash is taken as-is, anything else is looked up in the daemon's PATH.
pub fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    let found = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    });
    found.unwrap_or_else(|| {
        warn!(program, "executable not found in PATH");
        PathBuf::from(program)
    })
}

impl ExecImage {
    pub fn new(config: &JobConfig) -> Result<Self> {
        let to_c = |bytes: Vec<u8>| {
            CString::new(bytes).map_err(|e| Error::InvalidJob {
                name: config.name.clone(),
                reason: e.to_string(),
            })
        };
        let path_to_c = |path: &Path| to_c(path.as_os_str().as_bytes().to_vec());

        let args = config.argv()?;
        let path = path_to_c(&resolve_program(&args[0]))?;
        let argv = args
            .into_iter()
            .map(|arg| to_c(arg.into_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let envp = config
            .env
            .iter()
            .map(|(key, value)| to_c(format!("{key}={value}").into_bytes()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            argv_ptrs: nul_terminated(&argv),
            envp_ptrs: nul_terminated(&envp),
            path,
            argv,
            envp,
            working_dir: path_to_c(&config.working_dir)?,
            stdout: config.stdout.as_deref().map(path_to_c).transpose()?,
            stderr: config.stderr.as_deref().map(path_to_c).transpose()?,
            umask: Mode::from_bits_truncate(config.umask as libc::mode_t),
        })
    }

    pub fn path(&self) -> &CStr {
        &self.path
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }

    /*
        @@@
        @exec_child();
        . Runs in the forked child only: joins the job's process group (or leads its own), restores SIGPIPE,
          redirects stdout/stderr, chdir()s, applies the umask and execve()s.
        . Never returns; any failure exits the child with 126 (chdir) or 127 (exec).
        . Only async-signal-safe calls here: no logging, no allocation.
    */
    pub(crate) fn exec_child(&self, pgid: i32) -> ! {
        let own = Pid::from_raw(0);
        if setpgid(own, Pid::from_raw(pgid)).is_err() {
            let _ = setpgid(own, own);
        }
        // std ignores SIGPIPE and ignored dispositions survive exec
        let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };

        if let Some(path) = &self.stdout {
            redirect(libc::STDOUT_FILENO, path);
        }
        if let Some(path) = &self.stderr {
            redirect(libc::STDERR_FILENO, path);
        }
        if chdir(self.working_dir.as_c_str()).is_err() {
            unsafe { libc::_exit(EXIT_CHDIR_FAILED) }
        }
        umask(self.umask);

        unsafe {
            libc::execve(self.path.as_ptr(), self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr());
        }
        unsafe { libc::_exit(EXIT_EXEC_FAILED) }
    }
}

fn redirect(target: RawFd, path: &CStr) {
    let flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND;
    if let Ok(fd) = open(path, flags, Mode::from_bits_truncate(0o644)) {
        if fd != target {
            let _ = dup2(fd, target);
            let _ = close(fd);
        }
    }
}
