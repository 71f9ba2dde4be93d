use crate::aio::{AsyncIo, Completion, OpResult, Waker};
use crate::error::RuntimeError;
use crate::runtime::RuntimeConfig;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskFn, TaskIndex, TaskMeta, TaskState};
use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::time::Duration;
use tracing::{debug, error};

/// Per-thread cooperative runtime: a scheduler driving callback tasks plus
/// one OS async I/O backend.
///
/// Task bodies re-enter the runtime through the `&Runtime` they receive, so
/// every piece of state sits behind interior mutability. None of it is
/// shareable across threads; the one cross-thread door is [`Runtime::waker`].
pub struct Runtime {
    scheduler: RefCell<Scheduler>,
    aio: RefCell<Box<dyn AsyncIo>>,
    completions: RefCell<Vec<Completion>>,
    running: Cell<bool>,
}

impl Runtime {
    pub(crate) fn new(cfg: RuntimeConfig, aio: Box<dyn AsyncIo>) -> Self {
        Self {
            scheduler: RefCell::new(Scheduler::with_capacity(cfg.max_tasks as usize)),
            aio: RefCell::new(aio),
            completions: RefCell::new(Vec::with_capacity(cfg.reap_batch as usize)),
            running: Cell::new(false),
        }
    }

    /// Spawn a runnable task. It is dispatched on the next tick, with
    /// `meta.result` set to [`OpResult::None`].
    pub fn spawn<C>(&self, func: TaskFn<C>, ctx: Box<C>) -> Result<TaskIndex, RuntimeError> {
        let raw = Box::into_raw(ctx);
        match self
            .scheduler
            .borrow_mut()
            .spawn(Task::new(func, raw), TaskState::Runnable)
        {
            Ok(index) => Ok(index),
            Err(e) => {
                // Safety: the record never made it into the pool, so the box
                // comes straight back to us.
                drop(unsafe { Box::from_raw(raw) });
                Err(e)
            }
        }
    }

    /// Spawn a task that becomes runnable once `delay` has elapsed.
    pub fn spawn_delay<C>(
        &self,
        func: TaskFn<C>,
        ctx: Box<C>,
        delay: Duration,
    ) -> Result<TaskIndex, RuntimeError> {
        self.suspend(func, ctx, |aio, task, _ctx| aio.queue_timer(task, delay))
    }

    /// The suspension primitive: park `func` as a waiting continuation and
    /// let `register` queue exactly one backend operation against it.
    ///
    /// The continuation is dispatched when that operation completes, with the
    /// completion payload in `meta.result`. On registration failure the slot
    /// is rolled back, the context dropped, and the error propagates — a task
    /// body bubbling it up ends its chain.
    pub fn suspend<C, F>(
        &self,
        func: TaskFn<C>,
        ctx: Box<C>,
        register: F,
    ) -> Result<TaskIndex, RuntimeError>
    where
        F: FnOnce(&mut dyn AsyncIo, TaskIndex, &mut C) -> Result<(), RuntimeError>,
    {
        let raw = Box::into_raw(ctx);
        let index = match self
            .scheduler
            .borrow_mut()
            .spawn(Task::new(func, raw), TaskState::Waiting)
        {
            Ok(index) => index,
            Err(e) => {
                // Safety: as in `spawn`, the box never left our hands.
                drop(unsafe { Box::from_raw(raw) });
                return Err(e);
            }
        };

        let registered = {
            let mut aio = self.aio.borrow_mut();
            // Safety: `raw` came from `Box::into_raw` above and nothing else
            // aliases it until the continuation runs.
            register(aio.as_mut(), index, unsafe { &mut *raw })
        };

        if let Err(e) = registered {
            self.scheduler.borrow_mut().discard(index);
            // Safety: the discarded record will never be invoked.
            drop(unsafe { Box::from_raw(raw) });
            return Err(e);
        }

        Ok(index)
    }

    /// Cross-thread handle that unblocks a reap in [`Runtime::run`].
    pub fn waker(&self) -> Waker {
        self.aio.borrow().waker()
    }

    /// Ask the drive loop to exit. Takes effect after the current dispatch
    /// phase, before the next one starts.
    pub fn stop(&self) {
        self.running.set(false);
    }

    /// Drive tasks and I/O until stopped or quiescent.
    ///
    /// One tick: dispatch the runnable snapshot, submit pending I/O, then
    /// reap completions — blocking in the kernel only when dispatch produced
    /// no new runnables. Returns when [`Runtime::stop`] was called or when
    /// there are neither runnable tasks nor outstanding jobs left.
    pub fn run(&self) -> Result<()> {
        self.running.set(true);
        debug!("runtime started");

        while self.running.get() {
            self.dispatch();

            if !self.running.get() {
                debug!("stop requested, exiting");
                break;
            }

            self.aio.borrow_mut().submit()?;

            let wait_for_io = !self.scheduler.borrow().has_runnable();
            if wait_for_io && self.aio.borrow().pending() == 0 {
                debug!("no runnable tasks and no outstanding jobs, quiescing");
                break;
            }

            self.reap_and_deliver(wait_for_io)?;
        }

        Ok(())
    }

    /// One dispatch phase over a snapshot of the runnable set, in ascending
    /// index order. Tasks made runnable while the phase runs wait for the
    /// next tick.
    fn dispatch(&self) {
        let snapshot = self.scheduler.borrow().runnable_snapshot();

        for index in snapshot.iter() {
            let task = self.scheduler.borrow_mut().take(index);
            let meta = TaskMeta {
                index,
                result: task.result,
            };

            // Safety: the record was just taken out of the pool; its context
            // box is consumed by exactly this call.
            if let Err(e) = unsafe { task.invoke(self, &meta) } {
                // Task failure is isolated: the slot is already released and
                // the siblings in this snapshot still run.
                error!(task = index, error = %e, "task entry failed");
            }
        }
    }

    fn reap_and_deliver(&self, wait: bool) -> Result<()> {
        let mut completions = self.completions.borrow_mut();
        completions.clear();
        self.aio.borrow_mut().reap(&mut completions, wait)?;

        let mut scheduler = self.scheduler.borrow_mut();
        for completion in completions.drain(..) {
            // Wake completions only unblock the reap; no task owns them.
            if matches!(completion.result, OpResult::Wake) {
                continue;
            }
            scheduler.set_runnable(completion.task, completion.result);
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn occupied_count(&self) -> usize {
        self.scheduler.borrow().occupied_count()
    }

    #[cfg(test)]
    pub(crate) fn pending_jobs(&self) -> usize {
        self.aio.borrow().pending()
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self, index: TaskIndex) -> bool {
        self.scheduler.borrow().is_waiting(index)
    }

    /// One submit-and-reap step without the surrounding drive loop, so tests
    /// can observe a single blocked reap.
    #[cfg(test)]
    pub(crate) fn reap_once(&self, wait: bool) -> Result<()> {
        self.aio.borrow_mut().submit()?;
        self.reap_and_deliver(wait)
    }
}
