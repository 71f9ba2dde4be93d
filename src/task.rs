use crate::aio::OpResult;
use crate::runtime::Runtime;
use anyhow::Result;

/// Stable slot index identifying a task in the scheduler pool.
pub type TaskIndex = usize;

/// Entry point of a task.
///
/// `meta.result` is [`OpResult::None`] on the first call and carries the
/// completion payload on a resumption. The context box is owned by the call:
/// drop it to end the chain, or move it into [`Runtime::suspend`] /
/// [`Runtime::spawn`] to continue with fresh state.
pub type TaskFn<C> = fn(&Runtime, &TaskMeta, Box<C>) -> Result<()>;

/// Scheduling state of a task slot. Exactly one of runnable-set membership,
/// `Waiting` or `Dead` holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Runnable,
    Waiting,
    Dead,
}

/// The slice of a task record its entry point is allowed to see.
#[derive(Debug, Clone, Copy)]
pub struct TaskMeta {
    /// Slot the task occupied when it was dispatched.
    pub index: TaskIndex,

    /// Completion payload written by the backend, or `None` on first entry.
    pub result: OpResult,
}

type RawTaskFn = unsafe fn(*const (), &Runtime, &TaskMeta, *mut ()) -> Result<()>;
type RawDropFn = unsafe fn(*mut ());

/// Type-erased task record stored in the scheduler pool.
///
/// `user_fn` is the caller's [`TaskFn<C>`] cast down to a unit pointer;
/// `trampoline` is the monomorphized shim that casts it back and
/// reconstitutes the context box. `drop_fn` reclaims the context of a task
/// that is released without ever running (runtime teardown).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Task {
    pub(crate) index: TaskIndex,
    pub(crate) state: TaskState,
    pub(crate) result: OpResult,
    trampoline: RawTaskFn,
    user_fn: *const (),
    drop_fn: RawDropFn,
    context: *mut (),
}

impl Task {
    /// Build a record for `func`, taking ownership of the raw context box.
    pub(crate) fn new<C>(func: TaskFn<C>, context: *mut C) -> Self {
        Self {
            index: 0,
            state: TaskState::Dead,
            result: OpResult::None,
            trampoline: trampoline::<C>,
            user_fn: func as *const (),
            drop_fn: drop_context::<C>,
            context: context.cast(),
        }
    }

    /// Invoke the entry point.
    ///
    /// # Safety
    ///
    /// Consumes the context box: the record must have been taken out of the
    /// pool and must never be invoked (or reclaimed) again afterwards.
    pub(crate) unsafe fn invoke(&self, runtime: &Runtime, meta: &TaskMeta) -> Result<()> {
        unsafe { (self.trampoline)(self.user_fn, runtime, meta, self.context) }
    }

    /// Drop the context of a record that never ran.
    ///
    /// # Safety
    ///
    /// Same single-consumption rule as [`Task::invoke`]: one of the two may
    /// run, exactly once.
    pub(crate) unsafe fn reclaim_context(&self) {
        unsafe { (self.drop_fn)(self.context) }
    }
}

unsafe fn trampoline<C>(
    user_fn: *const (),
    runtime: &Runtime,
    meta: &TaskMeta,
    context: *mut (),
) -> Result<()> {
    // Safety: `user_fn` was erased from exactly this signature in
    // `Task::new::<C>`, and the context pointer came from `Box::into_raw`.
    let func: TaskFn<C> = unsafe { std::mem::transmute(user_fn) };
    let context = unsafe { Box::from_raw(context.cast::<C>()) };
    func(runtime, meta, context)
}

unsafe fn drop_context<C>(context: *mut ()) {
    drop(unsafe { Box::from_raw(context.cast::<C>()) });
}
