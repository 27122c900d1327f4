use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fmt, io, thread};

use tracing::warn;

/// Thread handle that joins on drop
pub struct AutoJoinHandle {
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Self::from(
            thread::Builder::new()
                .name(format!("hakeeperd-{name}"))
                .spawn(f)?,
        ))
    }

    pub fn spawn_res<F, E>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: Send + fmt::Debug + 'static,
    {
        Self::spawn(name, || f().expect("Task failed"))
    }
}

impl From<JoinHandle<()>> for AutoJoinHandle {
    fn from(value: JoinHandle<()>) -> Self {
        Self {
            join_handle: Some(value),
        }
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        self.join_handle
            .take()
            .expect("Missing join handle")
            .join()
            .expect("Task thread panicked");
    }
}

/// Shuts the whole node down if dropped without [`PanicGuard::done`]
pub struct PanicGuard {
    name: &'static str,
    is_node_shutting_down: Arc<AtomicBool>,
    is_done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, is_node_shutting_down: Arc<AtomicBool>) -> Self {
        Self {
            name,
            is_node_shutting_down,
            is_done: false,
        }
    }

    pub fn done(mut self) {
        self.is_done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.is_done {
            warn!(task = self.name, "Panic detected, shutting down the node");
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}
