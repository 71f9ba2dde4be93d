use crate::aio::{AioConfig, AsyncIo, EpollBackend};
use crate::runtime::Runtime;
use anyhow::{Result, anyhow};

/// Default task pool capacity.
const MAX_TASKS: u16 = 256;

/// Default in-flight job capacity.
const MAX_JOBS: u16 = 256;

/// Default upper bound on completions harvested per reap.
const REAP_BATCH: u16 = 64;

/// Which backend drives the runtime. io_uring and kqueue are the anticipated
/// siblings; each one slots in behind the same `AsyncIo` seam.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Epoll,
}

/// Configures and constructs a [`Runtime`].
///
/// Every thread builds its own runtime; nothing here is shared.
#[derive(Debug)]
pub struct Builder {
    kind: Kind,
    max_tasks: u16,
    max_jobs: u16,
    reap_batch: u16,
}

impl Builder {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            max_tasks: MAX_TASKS,
            max_jobs: MAX_JOBS,
            reap_batch: REAP_BATCH,
        }
    }

    /// Returns a new builder with the epoll backend selected.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_epoll() -> Builder {
        Builder::new(Kind::Epoll)
    }

    /// Sets the task pool capacity. Spawning past it fails with a
    /// recoverable capacity error until a tick releases slots.
    pub fn max_tasks(mut self, val: u16) -> Self {
        self.max_tasks = val;
        self
    }

    /// Sets how many I/O operations may be in flight at once.
    pub fn max_jobs(mut self, val: u16) -> Self {
        self.max_jobs = val;
        self
    }

    /// Sets the upper bound on completions harvested by a single reap.
    /// Must not exceed `max_jobs`.
    pub fn reap_batch(mut self, val: u16) -> Self {
        self.reap_batch = val;
        self
    }

    /// Creates the configured `Runtime`, ready to spawn tasks.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;

        let aio: Box<dyn AsyncIo> = match cfg.kind {
            Kind::Epoll => Box::new(EpollBackend::try_new(&cfg.aio())?),
        };

        Ok(Runtime::new(cfg, aio))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new_epoll()
    }
}

/// Validated snapshot of a [`Builder`], consumed by the runtime and its
/// backend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuntimeConfig {
    pub(crate) kind: Kind,
    pub(crate) max_tasks: u16,
    pub(crate) max_jobs: u16,
    pub(crate) reap_batch: u16,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.max_tasks == 0 {
            return Err(anyhow!("max_tasks must be greater than 0"));
        }

        if self.max_jobs == 0 {
            return Err(anyhow!("max_jobs must be greater than 0"));
        }

        if self.reap_batch == 0 {
            return Err(anyhow!("reap_batch must be greater than 0"));
        }

        // The reap staging buffer must never be able to outgrow the job
        // pool: anything past it could not belong to a live job.
        if self.reap_batch > self.max_jobs {
            return Err(anyhow!(
                "reap_batch ({}) must not exceed max_jobs ({})",
                self.reap_batch,
                self.max_jobs
            ));
        }

        Ok(())
    }

    pub(crate) fn aio(&self) -> AioConfig {
        AioConfig {
            max_jobs: self.max_jobs as usize,
            reap_batch: self.reap_batch as usize,
        }
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            kind: builder.kind,
            max_tasks: builder.max_tasks,
            max_jobs: builder.max_jobs,
            reap_batch: builder.reap_batch,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
