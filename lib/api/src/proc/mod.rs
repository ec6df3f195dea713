//! Child processes, the pipes that connect to them, and command line
//! handling.
mod argv;
mod pipe;
mod process;

pub use self::{
    argv::{command_line, quote_argument, tokenize_to_argv},
    pipe::{
        namedpipe_create, pipe_create, pipe_open_stderr, pipe_open_stdin, pipe_open_stdout, Pipe,
        PipeSource,
    },
    process::{
        proc_create, proc_fork, CmdType, ExitReason, IoMode, KillMode, Process, ProcessState,
        WaitStatus,
    },
};
