use std::thread;

use log::error;

/// How an accepted connection's work is scheduled off the dispatch
/// loop. The HTTP server defaults to [`ThreadPerConnection`]; [`Inline`]
/// runs handlers on the reactor thread itself, which only suits tests
/// and single-client tools.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

pub struct ThreadPerConnection;

impl Executor for ThreadPerConnection {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        let spawned = thread::Builder::new()
            .name("multisock-worker".to_string())
            .spawn(task);
        if let Err(err) = spawned {
            error!("failed to spawn worker thread: {}", err);
        }
    }
}
