//! Spawning the child behind the PTY: environment scrubbing, user context,
//! the exec-selection ladder and the launcher pidfd rendezvous.

use anyhow::{Context, Result};
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::args::TermArgs;
use crate::term::pty::{open_pair, Pty};

/// Frameserver-internal variables the child must never see.
const SCRUB: [&str; 11] = [
    "COLUMNS",
    "LINES",
    "TERMCAP",
    "ARCAN_ARG",
    "ARCAN_APPLPATH",
    "ARCAN_APPLTEMPPATH",
    "ARCAN_FRAMESERVER_LOGDIR",
    "ARCAN_RESOURCEPATH",
    "ARCAN_SHMKEY",
    "ARCAN_SOCKIN_FD",
    "ARCAN_STATEPATH",
];

const DEFAULT_PATH: &str = "/usr/local/bin:/bin:/usr/bin:/usr/local/sbin:/usr/sbin:/sbin";

#[cfg(target_os = "openbsd")]
const DEFAULT_TERM: &str = "wsvt25";
#[cfg(not(target_os = "openbsd"))]
const DEFAULT_TERM: &str = "xterm-256color";

/// Launcher-provided overrides, snapshotted so selection stays testable.
pub struct LaunchEnv {
    pub terminal_exec: Option<String>,
    pub terminal_argv: Option<String>,
    pub shell: String,
}

impl LaunchEnv {
    pub fn from_env() -> Self {
        LaunchEnv {
            terminal_exec: std::env::var("ARCAN_TERMINAL_EXEC").ok(),
            terminal_argv: std::env::var("ARCAN_TERMINAL_ARGV").ok(),
            shell: user_shell(),
        }
    }
}

/// What ends up in the execve call.
#[derive(Debug, PartialEq, Eq)]
pub struct ExecPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// The exec-selection ladder, in priority order: launcher/packed exec
/// override, then login, then the user's interactive shell.
pub fn exec_plan(args: &TermArgs, env: &LaunchEnv) -> Result<ExecPlan> {
    let exec_arg = args.exec.clone().or_else(|| env.terminal_exec.clone());

    if let Some(exec_arg) = exec_arg {
        if let Some(argv) = &env.terminal_argv {
            let split = shell_words::split(argv)
                .with_context(|| format!("malformed ARCAN_TERMINAL_ARGV: {}", argv))?;
            return Ok(ExecPlan { program: PathBuf::from(exec_arg), args: split });
        }
        return Ok(ExecPlan {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), exec_arg],
        });
    }

    if let Some(user) = &args.login {
        let program = find_login().context("login prompt requested but none was found")?;
        let mut argv = vec!["-p".to_string()];
        if let Some(user) = user {
            argv.push(user.clone());
        }
        return Ok(ExecPlan { program, args: argv });
    }

    let mut argv = vec!["-i".to_string()];
    if let Some(cmd) = &args.cmd {
        argv.push(cmd.clone());
    }
    Ok(ExecPlan { program: PathBuf::from(&env.shell), args: argv })
}

fn find_login() -> Option<PathBuf> {
    ["/bin/login", "/usr/bin/login"]
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

struct UserEntry {
    name: String,
    shell: String,
    home: String,
}

fn cstr_field(ptr: *const libc::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn user_entry() -> Option<UserEntry> {
    // getpwuid is fine here: called once at startup, single-threaded use
    let pw = unsafe { libc::getpwuid(libc::getuid()) };
    if pw.is_null() {
        return None;
    }
    unsafe {
        Some(UserEntry {
            name: cstr_field((*pw).pw_name)?,
            shell: cstr_field((*pw).pw_shell).unwrap_or_else(|| "/bin/sh".to_string()),
            home: cstr_field((*pw).pw_dir).unwrap_or_else(|| "/".to_string()),
        })
    }
}

fn user_shell() -> String {
    if let Some(entry) = user_entry() {
        return entry.shell;
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Assemble the child `Command`: scrub, defaults, user context, overrides.
pub fn build_command(plan: &ExecPlan, args: &TermArgs) -> Command {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);

    for var in SCRUB {
        cmd.env_remove(var);
    }
    // The launcher rendezvous variables are consumed, never inherited
    for var in [
        "ARCAN_TERMINAL_EXEC",
        "ARCAN_TERMINAL_ARGV",
        "ARCAN_TERMINAL_PIDFD_IN",
        "ARCAN_TERMINAL_PIDFD_OUT",
    ] {
        cmd.env_remove(var);
    }

    if std::env::var_os("LANG").is_none() {
        cmd.env("LANG", "en_GB.UTF-8");
    }
    if std::env::var_os("LC_CTYPE").is_none() {
        cmd.env("LC_CTYPE", "en_GB.UTF-8");
    }
    cmd.env("TERM", DEFAULT_TERM);
    if std::env::var_os("PATH").is_none() {
        cmd.env("PATH", DEFAULT_PATH);
    }

    if let Some(entry) = user_entry() {
        cmd.env("LOGNAME", &entry.name);
        cmd.env("USER", &entry.name);
        if std::env::var_os("SHELL").is_none() {
            cmd.env("SHELL", &entry.shell);
        }
        if std::env::var_os("HOME").is_none() {
            cmd.env("HOME", &entry.home);
        }
    }

    for (key, val) in &args.env_overrides {
        cmd.env(key, val);
    }
    if let Some(dir) = &args.chdir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Parsed pidfd rendezvous descriptors from the launcher, if both are set.
fn pidfd_pair() -> Option<(i32, i32)> {
    let infd = std::env::var("ARCAN_TERMINAL_PIDFD_IN").ok()?.parse().ok()?;
    let outfd = std::env::var("ARCAN_TERMINAL_PIDFD_OUT").ok()?.parse().ok()?;
    Some((infd, outfd))
}

/// Open the PTY and fork+exec the child with the slave as its controlling
/// terminal. Returns the master wrapper with the child attached.
pub fn spawn(args: &TermArgs, cols: u16, rows: u16) -> Result<Pty> {
    let env = LaunchEnv::from_env();
    let plan = exec_plan(args, &env)?;
    spawn_with_plan(&plan, args, cols, rows)
}

pub fn spawn_with_plan(plan: &ExecPlan, args: &TermArgs, cols: u16, rows: u16) -> Result<Pty> {
    let (master, slave) = open_pair(cols, rows).context("openpty failed")?;
    let slave_raw = slave.as_raw_fd();
    let master_raw = master.as_raw_fd();
    let pidfds = pidfd_pair();

    let mut cmd = build_command(plan, args);
    // Hand the slave to all three stdio slots (dup so the child setup code
    // below still sees the original descriptor number)
    unsafe {
        cmd.stdin(Stdio::from_raw_fd(libc::dup(slave_raw)))
            .stdout(Stdio::from_raw_fd(libc::dup(slave_raw)))
            .stderr(Stdio::from_raw_fd(libc::dup(slave_raw)));
    }

    unsafe {
        cmd.pre_exec(move || {
            // New session, then adopt the slave as controlling terminal
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::close(slave_raw);
            libc::close(master_raw);

            // Empty signal mask, every disposition back to default
            const NSIG: libc::c_int = 32;
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
            for sig in 1..NSIG {
                libc::signal(sig, libc::SIG_DFL);
            }

            // Launcher rendezvous: publish our pid, hold until poked
            if let Some((infd, outfd)) = pidfds {
                let pid = libc::getpid();
                libc::write(
                    outfd,
                    &pid as *const libc::pid_t as *const libc::c_void,
                    std::mem::size_of::<libc::pid_t>(),
                );
                let mut byte = 0u8;
                libc::read(infd, &mut byte as *mut u8 as *mut libc::c_void, 1);
                libc::close(infd);
                libc::close(outfd);
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("exec of {} failed", plan.program.display()))?;
    let pid = child.id() as libc::pid_t;
    log::info!(
        "child spawned: pid={}, program={}, cols={}, rows={}",
        pid,
        plan.program.display(),
        cols,
        rows
    );
    drop(slave);
    Ok(Pty::new(master, pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{PackedArgs, TermArgs};

    fn term_args(packed: &str) -> TermArgs {
        TermArgs::from_packed(&PackedArgs::parse(packed))
    }

    fn launch_env(exec: Option<&str>, argv: Option<&str>) -> LaunchEnv {
        LaunchEnv {
            terminal_exec: exec.map(str::to_string),
            terminal_argv: argv.map(str::to_string),
            shell: "/bin/bash".to_string(),
        }
    }

    #[test]
    fn default_is_interactive_shell() {
        let plan = exec_plan(&term_args(""), &launch_env(None, None)).unwrap();
        assert_eq!(plan.program, PathBuf::from("/bin/bash"));
        assert_eq!(plan.args, vec!["-i"]);
    }

    #[test]
    fn cmd_is_passed_to_the_shell() {
        let plan = exec_plan(&term_args("cmd=htop"), &launch_env(None, None)).unwrap();
        assert_eq!(plan.args, vec!["-i", "htop"]);
    }

    #[cfg(not(feature = "noexec"))]
    #[test]
    fn exec_routes_through_bin_sh() {
        let plan =
            exec_plan(&term_args("exec=/bin/echo hi"), &launch_env(None, None)).unwrap();
        assert_eq!(plan.program, PathBuf::from("/bin/sh"));
        assert_eq!(plan.args, vec!["-c", "/bin/echo hi"]);
    }

    #[test]
    fn launcher_exec_with_argv_goes_direct() {
        let env = launch_env(Some("/usr/bin/env"), Some("-i \"a b\" c"));
        let plan = exec_plan(&term_args(""), &env).unwrap();
        assert_eq!(plan.program, PathBuf::from("/usr/bin/env"));
        assert_eq!(plan.args, vec!["-i", "a b", "c"]);
    }

    #[test]
    fn launcher_exec_without_argv_uses_sh() {
        let env = launch_env(Some("ls -la"), None);
        let plan = exec_plan(&term_args(""), &env).unwrap();
        assert_eq!(plan.program, PathBuf::from("/bin/sh"));
        assert_eq!(plan.args, vec!["-c", "ls -la"]);
    }

    #[cfg(not(feature = "noexec"))]
    #[test]
    fn packed_exec_wins_over_shell_and_login() {
        let env = launch_env(None, None);
        let plan = exec_plan(&term_args("exec=true:login"), &env).unwrap();
        assert_eq!(plan.program, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn login_plan_uses_preserve_flag() {
        // Only meaningful where a login binary exists
        if find_login().is_none() {
            return;
        }
        let plan = exec_plan(&term_args("login"), &launch_env(None, None)).unwrap();
        assert!(plan.program.ends_with("login"));
        assert_eq!(plan.args[0], "-p");
        let plan = exec_plan(&term_args("login=guest"), &launch_env(None, None)).unwrap();
        assert_eq!(plan.args, vec!["-p", "guest"]);
    }

    #[test]
    fn scrub_list_is_applied() {
        let plan = exec_plan(&term_args(""), &launch_env(None, None)).unwrap();
        let cmd = build_command(&plan, &term_args(""));
        let removed: Vec<&std::ffi::OsStr> = cmd
            .get_envs()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k)
            .collect();
        for var in SCRUB {
            assert!(removed.contains(&std::ffi::OsStr::new(var)), "{} not scrubbed", var);
        }
        assert!(removed.contains(&std::ffi::OsStr::new("ARCAN_TERMINAL_EXEC")));
    }

    #[test]
    fn term_is_forced_and_overrides_apply() {
        let args = term_args("env=FOO=bar");
        let plan = exec_plan(&args, &launch_env(None, None)).unwrap();
        let cmd = build_command(&plan, &args);
        let envs: Vec<(String, Option<String>)> = cmd
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.map(|v| v.to_string_lossy().into_owned()),
                )
            })
            .collect();
        assert!(envs.contains(&("TERM".to_string(), Some(DEFAULT_TERM.to_string()))));
        assert!(envs.contains(&("FOO".to_string(), Some("bar".to_string()))));
    }
}
