use std::{
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use portos_types::ResourceKind;

use super::{
    argv::command_line,
    pipe::{wrap, Pipe, PipeEnd},
};
use crate::{
    arena::Arena,
    handle::{Descriptor, Handle, Resource},
    Error, Result,
};

/// A child process, configured before and controlled after [`exec`](Process).
pub type Process = Handle<ProcessState>;

/// How long [`KillMode::Timeout`] waits between the polite and the forceful
/// signal.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// How the program is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmdType {
    /// Through `/bin/sh -c` with an empty environment. The program string
    /// is passed to the shell as is, the arguments are quoted.
    Shell,
    /// Through `/bin/sh -c`, inheriting our environment
    ShellEnv,
    /// Directly, with an empty environment
    Program,
    /// Directly, inheriting our environment
    ProgramEnv,
    /// Directly, searched on `PATH`, inheriting our environment
    #[default]
    ProgramEnvPath,
}

impl CmdType {
    fn uses_shell(self) -> bool {
        matches!(self, CmdType::Shell | CmdType::ShellEnv)
    }

    fn inherits_env(self) -> bool {
        !matches!(self, CmdType::Shell | CmdType::Program)
    }
}

impl FromStr for CmdType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shell" => Ok(CmdType::Shell),
            "shell/env" => Ok(CmdType::ShellEnv),
            "program" => Ok(CmdType::Program),
            "program/env" => Ok(CmdType::ProgramEnv),
            "program/env/path" => Ok(CmdType::ProgramEnvPath),
            _ => Err(Error::invalid(format!("invalid command type '{s}'"))),
        }
    }
}

/// What happens to one of the child's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Shared with this process
    #[default]
    None,
    /// A pipe, blocking on both sides
    FullBlock,
    /// A pipe, non-blocking on both sides
    FullNonblock,
    /// A pipe that blocks on our side only
    ParentBlock,
    /// A pipe that blocks on the child's side only
    ChildBlock,
    /// Connected to the null device
    Discard,
}

impl IoMode {
    fn stdio(self) -> Stdio {
        match self {
            IoMode::None => Stdio::inherit(),
            IoMode::Discard => Stdio::null(),
            _ => Stdio::piped(),
        }
    }

    /// Whether our end of the pipe is non-blocking.
    fn parent_nonblocking(self) -> bool {
        matches!(self, IoMode::FullNonblock | IoMode::ChildBlock)
    }
}

impl FromStr for IoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(IoMode::None),
            "full-block" => Ok(IoMode::FullBlock),
            "full-nonblock" => Ok(IoMode::FullNonblock),
            "parent-block" => Ok(IoMode::ParentBlock),
            "child-block" => Ok(IoMode::ChildBlock),
            "discard" => Ok(IoMode::Discard),
            _ => Err(Error::invalid(format!("invalid I/O mode '{s}'"))),
        }
    }
}

/// What to do with a child that is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillMode {
    /// Leave it alone
    #[default]
    Never,
    /// Kill it outright
    Always,
    /// Ask it to stop, and kill it when it has not after a grace period
    Timeout,
    /// Wait for it to finish
    Wait,
    /// Ask it to stop, then wait
    Once,
}

impl FromStr for KillMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(KillMode::Never),
            "always" => Ok(KillMode::Always),
            "timeout" => Ok(KillMode::Timeout),
            "wait" => Ok(KillMode::Wait),
            "once" => Ok(KillMode::Once),
            _ => Err(Error::invalid(format!("invalid kill mode '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exit,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus {
    /// `false` when a non-blocking wait found the child still running
    pub finished: bool,
    pub reason: ExitReason,
    /// Exit code or signal number
    pub code: i32,
}

impl WaitStatus {
    const RUNNING: WaitStatus = WaitStatus {
        finished: false,
        reason: ExitReason::Exit,
        code: 0,
    };

    fn from_exit(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self {
                finished: true,
                reason: ExitReason::Exit,
                code,
            };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self {
                    finished: true,
                    reason: ExitReason::Signal,
                    code: signal,
                };
            }
        }
        Self {
            finished: true,
            reason: ExitReason::Exit,
            code: -1,
        }
    }

    pub fn success(&self) -> bool {
        self.finished && self.reason == ExitReason::Exit && self.code == 0
    }
}

/// The parts of a started child that outlive the handle lock.
#[derive(Debug)]
struct ChildShared {
    pid: u32,
    child: Mutex<Option<Child>>,
    status: Mutex<Option<WaitStatus>>,
}

impl ChildShared {
    fn finished(&self) -> Option<WaitStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, block: bool) -> Result<WaitStatus> {
        if let Some(status) = self.finished() {
            return Ok(status);
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let child = child
            .as_mut()
            .ok_or_else(|| Error::closed(ResourceKind::Process))?;
        let status = if block {
            Some(child.wait()?)
        } else {
            child.try_wait()?
        };
        match status {
            Some(status) => {
                let status = WaitStatus::from_exit(status);
                tracing::debug!(pid = self.pid, ?status, "child finished");
                *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
                Ok(status)
            }
            None => Ok(WaitStatus::RUNNING),
        }
    }

    /// Sends a polite or forceful stop request.
    fn signal(&self, forceful: bool) -> Result<()> {
        if self.finished().is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let signal = if forceful { libc::SIGKILL } else { libc::SIGTERM };
            // SAFETY: plain syscall on a pid we spawned and have not reaped
            if unsafe { libc::kill(self.pid as libc::pid_t, signal) } != 0 {
                let err = std::io::Error::last_os_error();
                // Already gone
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err.into());
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = forceful;
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            match child.as_mut() {
                Some(child) => Ok(child.kill()?),
                None => Ok(()),
            }
        }
    }

    /// Applies `mode` to the child.
    fn stop(&self, mode: KillMode) -> Result<()> {
        match mode {
            KillMode::Never => Ok(()),
            KillMode::Always => {
                self.signal(true)?;
                self.wait(true).map(drop)
            }
            KillMode::Once => {
                self.signal(false)?;
                self.wait(true).map(drop)
            }
            KillMode::Wait => self.wait(true).map(drop),
            KillMode::Timeout => {
                self.signal(false)?;
                let deadline = Instant::now() + KILL_GRACE;
                while Instant::now() < deadline {
                    if self.wait(false)?.finished {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                self.signal(true)?;
                self.wait(true).map(drop)
            }
        }
    }
}

#[derive(Debug)]
pub struct ProcessState {
    program: String,
    cmdtype: CmdType,
    env: Option<Vec<(String, String)>>,
    dir: Option<PathBuf>,
    io: [IoMode; 3],
    kill_mode: Arc<Mutex<KillMode>>,
    arena: Option<Arena>,
    argv: Vec<Bytes>,
    child: Option<Arc<ChildShared>>,
    pipes: [Option<Pipe>; 3],
    descriptor: Descriptor,
}

impl Resource for ProcessState {
    const KIND: ResourceKind = ResourceKind::Process;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn close(&mut self) -> Result<()> {
        // Our references to the pipes go first, so the teardown can run as
        // soon as the caller has released theirs.
        self.pipes = [None, None, None];
        if let Some(arena) = self.arena.take() {
            arena.destroy();
        }
        Ok(())
    }
}

/// Prepares a child process running `program`. Nothing is started before
/// [`exec`](Process).
pub fn proc_create(program: impl Into<String>) -> Result<Process> {
    let program = program.into();
    if program.is_empty() {
        return Err(Error::invalid("program name must not be empty"));
    }
    Ok(Handle::new(ProcessState {
        program,
        cmdtype: CmdType::default(),
        env: None,
        dir: None,
        io: [IoMode::None; 3],
        kill_mode: Arc::new(Mutex::new(KillMode::default())),
        arena: Some(Arena::new("process")),
        argv: Vec::new(),
        child: None,
        pipes: [None, None, None],
        descriptor: Descriptor::unique(),
    }))
}

/// Forking the interpreter is not supported; use [`proc_create`].
pub fn proc_fork() -> Result<Process> {
    Err(Error::not_implemented("fork"))
}

impl ProcessState {
    fn configurable(&mut self) -> Result<&mut Self> {
        if self.child.is_some() {
            return Err(Error::invalid("process has already been started"));
        }
        Ok(self)
    }

    fn started(&self) -> Result<Arc<ChildShared>> {
        self.child
            .clone()
            .ok_or_else(|| Error::invalid("process has not been started"))
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = if self.cmdtype.uses_shell() {
            // The program is shell text of its own; only the arguments
            // get quoted
            let line = if args.is_empty() {
                self.program.clone()
            } else {
                format!("{} {}", self.program, command_line(args))
            };
            #[cfg(unix)]
            let command = {
                let mut command = Command::new("/bin/sh");
                command.arg("-c").arg(line);
                command
            };
            #[cfg(not(unix))]
            let command = {
                let mut command = Command::new("cmd");
                command.arg("/C").arg(line);
                command
            };
            command
        } else {
            let program = Path::new(&self.program);
            // Only the PATH searching type looks beyond the working directory
            let program = if self.cmdtype != CmdType::ProgramEnvPath
                && program.components().count() == 1
            {
                Path::new(".").join(program)
            } else {
                program.to_path_buf()
            };
            let mut command = Command::new(program);
            command.args(args);
            command
        };

        if self.env.is_some() || !self.cmdtype.inherits_env() {
            command.env_clear();
        }
        if let Some(env) = &self.env {
            command.envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
            .stdin(self.io[0].stdio())
            .stdout(self.io[1].stdio())
            .stderr(self.io[2].stdio());
        command
    }

    fn exec(&mut self, args: &[String]) -> Result<()> {
        self.configurable()?;
        let arena = self
            .arena
            .as_ref()
            .ok_or_else(|| Error::closed(ResourceKind::Process))?;

        let mut child = self.command(args).spawn().map_err(|err| {
            Error::new(
                Error::from(&err).code(),
                format!("could not start '{}': {err}", self.program),
            )
        })?;
        let pid = child.id();
        tracing::debug!(pid, program = %self.program, cmdtype = ?self.cmdtype, "process started");

        self.argv = std::iter::once(self.program.as_str())
            .chain(args.iter().map(String::as_str))
            .map(|arg| arena.alloc_str(arg))
            .collect();

        let ends = [
            child.stdin.take().map(PipeEnd::ChildStdin),
            child.stdout.take().map(PipeEnd::ChildStdout),
            child.stderr.take().map(PipeEnd::ChildStderr),
        ];
        for (slot, (end, mode)) in ends.into_iter().zip(self.io).enumerate() {
            let Some(end) = end else { continue };
            let pipe = wrap(end, Some(arena.reference()));
            if mode.parent_nonblocking() {
                pipe.with(|stream| stream.source().set_nonblocking(true))?;
            }
            self.pipes[slot] = Some(pipe);
        }

        let shared = Arc::new(ChildShared {
            pid,
            child: Mutex::new(Some(child)),
            status: Mutex::new(None),
        });
        let teardown = shared.clone();
        let kill_mode = self.kill_mode.clone();
        arena.on_destroy(move || {
            let mode = *kill_mode.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = teardown.stop(mode) {
                tracing::warn!(pid = teardown.pid, ?mode, error = %err, "failed to stop child");
            }
            // Dropping the child without waiting is what `Never` asks for
            teardown
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        });
        self.child = Some(shared);
        Ok(())
    }

    fn pipe(&self, slot: usize, name: &str) -> Result<Pipe> {
        self.started()?;
        self.pipes[slot].clone().ok_or_else(|| {
            Error::invalid(format!("{name} of the child is not redirected to a pipe"))
        })
    }
}

impl Handle<ProcessState> {
    pub fn cmdtype_set(&self, cmdtype: CmdType) -> Result<()> {
        self.with(|proc| {
            proc.configurable()?.cmdtype = cmdtype;
            Ok(())
        })
    }

    /// Replaces the child's environment with exactly `env`.
    pub fn env_set<K, V>(&self, env: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let env: Vec<(String, String)> = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if env.iter().any(|(k, _)| k.is_empty() || k.contains('=')) {
            return Err(Error::invalid("invalid environment variable name"));
        }
        self.with(|proc| {
            proc.configurable()?.env = Some(env);
            Ok(())
        })
    }

    pub fn dir_set(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref().to_path_buf();
        self.with(|proc| {
            proc.configurable()?.dir = Some(dir);
            Ok(())
        })
    }

    /// Chooses what happens to stdin, stdout and stderr.
    pub fn io_set(&self, stdin: IoMode, stdout: IoMode, stderr: IoMode) -> Result<()> {
        self.with(|proc| {
            proc.configurable()?.io = [stdin, stdout, stderr];
            Ok(())
        })
    }

    /// Starts the program with `args` (not including the program name).
    pub fn exec<S: AsRef<str>>(&self, args: &[S]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|arg| arg.as_ref().to_string()).collect();
        self.with(|proc| proc.exec(&args))
    }

    /// Our end of the child's stdin.
    pub fn in_get(&self) -> Result<Pipe> {
        self.with(|proc| proc.pipe(0, "stdin"))
    }

    /// Our end of the child's stdout.
    pub fn out_get(&self) -> Result<Pipe> {
        self.with(|proc| proc.pipe(1, "stdout"))
    }

    /// Our end of the child's stderr.
    pub fn err_get(&self) -> Result<Pipe> {
        self.with(|proc| proc.pipe(2, "stderr"))
    }

    /// Waits for the child. With `block == false` a child that is still
    /// running is reported with `finished == false`.
    pub fn wait(&self, block: bool) -> Result<WaitStatus> {
        let child = self.with(|proc| proc.started())?;
        child.wait(block)
    }

    /// Stops the child according to `mode`, and makes `mode` the policy
    /// applied when the handle is finalized.
    pub fn kill(&self, mode: KillMode) -> Result<()> {
        let (child, policy) = self.with(|proc| Ok((proc.started()?, proc.kill_mode.clone())))?;
        *policy.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        child.stop(mode)
    }

    /// Sets the policy applied when the handle is finalized without
    /// touching the child now.
    pub fn kill_mode_set(&self, mode: KillMode) -> Result<()> {
        self.with(|proc| {
            *proc.kill_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
            Ok(())
        })
    }

    pub fn pid(&self) -> Result<u32> {
        self.with(|proc| Ok(proc.started()?.pid))
    }

    /// The program name followed by the arguments it was started with.
    pub fn argv(&self) -> Result<Vec<Bytes>> {
        self.with(|proc| Ok(proc.argv.clone()))
    }
}
