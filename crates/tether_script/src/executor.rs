//! Engine thread and task dispatch
//!
//! The engine lives on one dedicated OS thread. Every other thread talks to it by
//! sending tasks over a single FIFO channel, so tasks from one submitter run in
//! the order they were sent. Tasks receive `&mut Engine` and run to completion;
//! there is no cancellation once a task is queued.

use crate::engine::Engine;
use crate::loader::ModuleLoader;
use crate::settings::EngineSettings;
use crate::ScriptError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use tether_core::ScopeTree;
use tokio::sync::{mpsc, oneshot};

type Task = Box<dyn FnOnce(&mut Engine) + Send + 'static>;

enum Command {
    Run(Task),
    Shutdown,
}

/// Handle for submitting work to the engine thread. Cheap to clone.
#[derive(Clone)]
pub struct EngineExecutor {
    tx: mpsc::UnboundedSender<Command>,
    engine_thread: ThreadId,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineExecutor {
    /// Start the engine thread and build the engine on it.
    pub fn spawn(
        settings: &EngineSettings,
        loader: Arc<dyn ModuleLoader>,
        tree: Arc<ScopeTree>,
    ) -> Result<Self, ScriptError> {
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let (init_tx, init_rx) = std_mpsc::channel::<Result<(), ScriptError>>();
        let engine_settings = settings.clone();

        let handle = std::thread::Builder::new()
            .name(settings.thread_name.clone())
            .spawn(move || {
                let engine = match Engine::new(&engine_settings, loader, tree) {
                    Ok(engine) => {
                        let _ = init_tx.send(Ok(()));
                        engine
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                run(engine, rx);
            })
            .map_err(|err| ScriptError::Init(format!("failed to spawn engine thread: {}", err)))?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(ScriptError::Init("engine thread exited during startup".to_string())),
        }

        tracing::debug!(thread = %settings.thread_name, "engine thread started");
        Ok(Self {
            tx,
            engine_thread: handle.thread().id(),
            join: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn engine_thread_id(&self) -> ThreadId {
        self.engine_thread
    }

    pub fn is_engine_thread(&self) -> bool {
        std::thread::current().id() == self.engine_thread
    }

    /// Queue `task` and return immediately.
    pub fn dispatch<F>(&self, task: F) -> Result<(), ScriptError>
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(task)))
            .map_err(|_| ScriptError::EngineShutDown)
    }

    /// Queue `task` and block until it has run, returning its result.
    ///
    /// Calling this from the engine thread fails with [`ScriptError::Deadlock`]:
    /// the engine is busy running the caller and could never pick the task up.
    /// Engine-thread code should use the [`Engine`] it was handed instead. Do not
    /// call this from inside an async runtime; use [`dispatch_async`](Self::dispatch_async).
    pub fn dispatch_sync<F, R>(&self, task: F) -> Result<R, ScriptError>
    where
        F: FnOnce(&mut Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_engine_thread() {
            return Err(ScriptError::Deadlock);
        }

        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.dispatch(move |engine| {
            let _ = reply_tx.send(run_guarded(engine, task));
        })?;

        reply_rx.recv().map_err(|_| ScriptError::EngineShutDown)?
    }

    /// Queue `task` and await its result without blocking the caller's thread.
    ///
    /// Wrap the future in `tokio::time::timeout` to give up waiting; the task may
    /// still complete on the engine thread afterwards.
    pub async fn dispatch_async<F, R>(&self, task: F) -> Result<R, ScriptError>
    where
        F: FnOnce(&mut Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(move |engine| {
            let _ = reply_tx.send(run_guarded(engine, task));
        })?;

        reply_rx.await.map_err(|_| ScriptError::EngineShutDown)?
    }

    /// Stop the engine thread after the tasks already queued have run.
    ///
    /// Idempotent. Joins the thread unless called from the engine thread itself.
    pub fn shutdown(&self) -> Result<(), ScriptError> {
        // A closed channel means the thread is already on its way out.
        let _ = self.tx.send(Command::Shutdown);

        if self.is_engine_thread() {
            return Ok(());
        }
        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| ScriptError::TaskPanicked)?;
            tracing::debug!("engine thread joined");
        }
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }
}

fn run_guarded<F, R>(engine: &mut Engine, task: F) -> Result<R, ScriptError>
where
    F: FnOnce(&mut Engine) -> R,
{
    panic::catch_unwind(AssertUnwindSafe(|| task(engine))).map_err(|_| {
        tracing::error!("engine task panicked");
        ScriptError::TaskPanicked
    })
}

fn run(mut engine: Engine, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Run(task) => {
                engine.record_task();
                let _ = run_guarded(&mut engine, task);
            }
            Command::Shutdown => break,
        }
    }
    rx.close();
    tracing::debug!(stats = ?engine.stats(), "engine thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticModuleLoader;

    fn spawn_executor() -> EngineExecutor {
        EngineExecutor::spawn(
            &EngineSettings::default(),
            Arc::new(StaticModuleLoader::new()),
            Arc::new(ScopeTree::new("root")),
        )
        .unwrap()
    }

    #[test]
    fn tasks_run_on_the_engine_thread() {
        let executor = spawn_executor();
        let ran_on = executor
            .dispatch_sync(|_| std::thread::current().id())
            .unwrap();
        assert_eq!(ran_on, executor.engine_thread_id());
        assert_ne!(ran_on, std::thread::current().id());
    }

    #[test]
    fn dispatch_preserves_submission_order() {
        let executor = spawn_executor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            executor
                .dispatch(move |_| seen.lock().unwrap().push(i))
                .unwrap();
        }
        executor.dispatch_sync(|_| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn sync_dispatch_from_engine_thread_is_rejected() {
        let executor = spawn_executor();
        let inner = executor.clone();
        let nested = executor
            .dispatch_sync(move |_| inner.dispatch_sync(|_| 1))
            .unwrap();
        assert!(matches!(nested, Err(ScriptError::Deadlock)));
    }

    #[test]
    fn panicking_task_does_not_kill_the_engine() {
        let executor = spawn_executor();
        let result: Result<(), _> = executor.dispatch_sync(|_| panic!("boom"));
        assert!(matches!(result, Err(ScriptError::TaskPanicked)));
        assert_eq!(executor.dispatch_sync(|_| 2).unwrap(), 2);
    }

    #[test]
    fn shutdown_rejects_later_work() {
        let executor = spawn_executor();
        executor.shutdown().unwrap();
        executor.shutdown().unwrap();
        assert!(matches!(
            executor.dispatch(|_| ()),
            Err(ScriptError::EngineShutDown)
        ));
        assert!(matches!(
            executor.dispatch_sync(|_| ()),
            Err(ScriptError::EngineShutDown)
        ));
    }

    #[tokio::test]
    async fn async_dispatch_returns_engine_results() {
        let executor = spawn_executor();
        let value = executor
            .dispatch_async(|engine| engine.eval_json("[1, 2].map(x => x * 10)"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, serde_json::json!([10, 20]));
    }
}
