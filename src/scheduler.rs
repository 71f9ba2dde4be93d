use crate::aio::OpResult;
use crate::error::RuntimeError;
use crate::pool::{BitSet, Pool};
use crate::task::{Task, TaskIndex, TaskState};

/// Owns every task slot plus the runnable bitmap.
///
/// The runnable set is always a subset of the occupied slots: a waiting task
/// is occupied but not runnable, and releasing a slot clears both bits.
pub(crate) struct Scheduler {
    tasks: Pool<Task>,
    runnable: BitSet,
}

impl Scheduler {
    pub(crate) fn with_capacity(max_tasks: usize) -> Self {
        Self {
            tasks: Pool::with_capacity(max_tasks),
            runnable: BitSet::with_capacity(max_tasks),
        }
    }

    /// Borrow a slot for `task` and set its state bits.
    pub(crate) fn spawn(
        &mut self,
        mut task: Task,
        state: TaskState,
    ) -> Result<TaskIndex, RuntimeError> {
        debug_assert!(state != TaskState::Dead, "cannot spawn a dead task");

        task.state = state;
        let index = self
            .tasks
            .insert(task)
            .map_err(|_| RuntimeError::TaskPoolFull)?;
        self.tasks.get_mut(index).index = index;

        if state == TaskState::Runnable {
            self.runnable.set(index);
        }
        Ok(index)
    }

    /// Move a waiting task back to runnable, recording its completion payload.
    ///
    /// # Panics
    ///
    /// Panics when the task is not waiting; a completion addressed at a
    /// runnable or dead slot means the backend's job bookkeeping is broken.
    pub(crate) fn set_runnable(&mut self, index: TaskIndex, result: OpResult) {
        let task = self.tasks.get_mut(index);
        assert_eq!(
            task.state,
            TaskState::Waiting,
            "task {index} resumed while not waiting"
        );

        task.state = TaskState::Runnable;
        task.result = result;
        self.runnable.set(index);
    }

    /// Take a runnable task out for dispatch.
    ///
    /// Marks the record dead, clears both bitmap bits and frees the slot
    /// before the entry runs, so a body that immediately re-queues gets a
    /// fresh slot instead of aliasing the one being dispatched.
    pub(crate) fn take(&mut self, index: TaskIndex) -> Task {
        {
            let task = self.tasks.get_mut(index);
            assert_eq!(
                task.state,
                TaskState::Runnable,
                "task {index} dispatched while not runnable"
            );
            task.state = TaskState::Dead;
        }

        self.runnable.clear(index);
        self.tasks.release(index)
    }

    /// Roll back a spawn whose I/O registration failed. The caller keeps
    /// ownership of the context pointer; the record is simply discarded.
    pub(crate) fn discard(&mut self, index: TaskIndex) {
        self.runnable.clear(index);
        self.tasks.release(index);
    }

    /// Copy of the runnable set for one dispatch phase. Tasks made runnable
    /// while the phase runs are picked up on the next tick, not this one.
    pub(crate) fn runnable_snapshot(&self) -> BitSet {
        self.runnable.clone()
    }

    pub(crate) fn has_runnable(&self) -> bool {
        !self.runnable.is_empty()
    }

    pub(crate) fn runnable_count(&self) -> usize {
        self.runnable.count()
    }

    pub(crate) fn occupied_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self, index: TaskIndex) -> bool {
        self.tasks.contains(index) && self.tasks.get(index).state == TaskState::Waiting
    }

    #[cfg(test)]
    fn runnable_is_subset_of_occupied(&self) -> bool {
        self.runnable.iter().all(|index| self.tasks.contains(index))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Reclaim the contexts of tasks that never got to run, e.g.
        // continuations still waiting when the runtime is torn down.
        let stale: Vec<TaskIndex> = self.tasks.indices().collect();
        for index in stale {
            let task = self.tasks.release(index);
            unsafe { task.reclaim_context() };
        }
    }
}
