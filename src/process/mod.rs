//! Backend process handle, interpreter discovery and launch.

use std::time::Duration;

use tokio::sync::{oneshot, watch};

pub mod launcher;
pub mod python;

pub use launcher::{launch, ExitHook, LaunchSpec, SpawnStrategy};
pub use python::InterpreterResolver;

/// Exit state reported by the OS for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Running,
    /// `None` when the process was ended by a signal
    Exited(Option<i32>),
}

/// What the rest of the application sees about the backend's exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    NeverStarted,
    Running,
    Exited(Option<i32>),
}

/// Handle to a launched backend process.
///
/// The child itself is owned by a watcher task; this handle observes its exit
/// and can ask it to terminate. Dropping the handle kills a still-running child.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: Option<u32>,
    generation: u64,
    exit: watch::Receiver<ProcessExit>,
    kill: Option<oneshot::Sender<()>>,
}

impl SupervisedProcess {
    pub(crate) fn new(
        pid: Option<u32>,
        generation: u64,
        exit: watch::Receiver<ProcessExit>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            generation,
            exit,
            kill: Some(kill),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Launch counter value this process was started under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        matches!(*self.exit.borrow(), ProcessExit::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match *self.exit.borrow() {
            ProcessExit::Exited(code) => code,
            ProcessExit::Running => None,
        }
    }

    /// Ask the watcher to kill the child.
    ///
    /// Returns `false` when there was nothing left to kill: the process had
    /// already exited or termination was requested before.
    pub fn terminate(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait until the OS reports exit, at most `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        let exited = self
            .exit
            .wait_for(|state| matches!(state, ProcessExit::Exited(_)));
        matches!(tokio::time::timeout(timeout, exited).await, Ok(Ok(_)))
    }
}
