use super::*;
use crate::aio::OpResult;
use crate::error::RuntimeError;
use crate::task::TaskMeta;
use anyhow::{Result, anyhow};
use std::cell::{Cell, RefCell};
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime() -> Runtime {
    Builder::new_epoll().try_build().unwrap()
}

fn noop_entry(_rt: &Runtime, _meta: &TaskMeta, _ctx: Box<()>) -> Result<()> {
    Ok(())
}

fn flag_entry(_rt: &Runtime, _meta: &TaskMeta, ctx: Box<Rc<Cell<bool>>>) -> Result<()> {
    ctx.set(true);
    Ok(())
}

struct TimerCtx {
    fired: Rc<Cell<u32>>,
}

fn timer_entry(_rt: &Runtime, meta: &TaskMeta, ctx: Box<TimerCtx>) -> Result<()> {
    assert_eq!(meta.result, OpResult::None);
    ctx.fired.set(ctx.fired.get() + 1);
    Ok(())
}

#[test]
fn test_timer_fires_once_then_quiesce() -> Result<()> {
    let runtime = runtime();
    let fired = Rc::new(Cell::new(0));

    runtime.spawn_delay(
        timer_entry,
        Box::new(TimerCtx {
            fired: Rc::clone(&fired),
        }),
        Duration::from_millis(10),
    )?;

    let started = Instant::now();
    runtime.run()?;

    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(fired.get(), 1);
    assert_eq!(runtime.occupied_count(), 0);
    assert_eq!(runtime.pending_jobs(), 0);
    Ok(())
}

struct OrderCtx {
    order: Rc<RefCell<Vec<usize>>>,
}

fn order_entry(_rt: &Runtime, meta: &TaskMeta, ctx: Box<OrderCtx>) -> Result<()> {
    ctx.order.borrow_mut().push(meta.index);
    Ok(())
}

#[test]
fn test_dispatch_order_is_ascending() -> Result<()> {
    let runtime = runtime();
    let order = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..3 {
        runtime.spawn(
            order_entry,
            Box::new(OrderCtx {
                order: Rc::clone(&order),
            }),
        )?;
    }

    runtime.run()?;

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
    Ok(())
}

struct EchoCtx {
    listener: TcpListener,
    conn: RawFd,
    buf: [u8; 16],
    received: usize,
    step: u8,
    done: Rc<Cell<bool>>,
}

fn echo_entry(rt: &Runtime, meta: &TaskMeta, mut ctx: Box<EchoCtx>) -> Result<()> {
    let step = ctx.step;
    ctx.step += 1;

    match step {
        0 => {
            assert_eq!(meta.result, OpResult::None);
            rt.suspend(echo_entry, ctx, |aio, task, c| {
                aio.queue_accept(task, c.listener.as_raw_fd())
            })?;
        }
        1 => {
            let OpResult::Socket(conn) = meta.result else {
                panic!("expected a socket, got {:?}", meta.result);
            };
            assert!(conn >= 0);
            ctx.conn = conn;
            rt.suspend(echo_entry, ctx, |aio, task, c| unsafe {
                aio.queue_recv(task, c.conn, &mut c.buf)
            })?;
        }
        2 => {
            let OpResult::Value(n) = meta.result else {
                panic!("expected a byte count, got {:?}", meta.result);
            };
            assert_eq!(n, 5);
            ctx.received = n as usize;
            assert_eq!(&ctx.buf[..5], b"hello");
            rt.suspend(echo_entry, ctx, |aio, task, c| unsafe {
                aio.queue_send(task, c.conn, &c.buf[..c.received])
            })?;
        }
        3 => {
            assert_eq!(meta.result, OpResult::Value(5));
            rt.suspend(echo_entry, ctx, |aio, task, c| aio.queue_close(task, c.conn))?;
        }
        4 => {
            assert_eq!(meta.result, OpResult::None);
            ctx.done.set(true);
        }
        _ => unreachable!("echo ran past its last step"),
    }
    Ok(())
}

#[test]
fn test_echo_once() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();

        let mut echo = [0u8; 5];
        stream.read_exact(&mut echo).unwrap();
        echo
    });

    let runtime = runtime();
    let done = Rc::new(Cell::new(false));
    runtime.spawn(
        echo_entry,
        Box::new(EchoCtx {
            listener,
            conn: -1,
            buf: [0; 16],
            received: 0,
            step: 0,
            done: Rc::clone(&done),
        }),
    )?;

    runtime.run()?;

    assert!(done.get());
    assert_eq!(&client.join().unwrap(), b"hello");
    assert_eq!(runtime.pending_jobs(), 0);
    Ok(())
}

struct FileCtx {
    path: PathBuf,
    fd: RawFd,
    buf: [u8; 6],
    step: u8,
    done: Rc<Cell<bool>>,
}

fn file_entry(rt: &Runtime, meta: &TaskMeta, mut ctx: Box<FileCtx>) -> Result<()> {
    let step = ctx.step;
    ctx.step += 1;

    match step {
        0 => {
            assert_eq!(meta.result, OpResult::None);
            rt.suspend(file_entry, ctx, |aio, task, c| aio.queue_open(task, &c.path))?;
        }
        1 => {
            let OpResult::Fd(fd) = meta.result else {
                panic!("expected a descriptor, got {:?}", meta.result);
            };
            assert!(fd >= 0);
            ctx.fd = fd;
            rt.suspend(file_entry, ctx, |aio, task, c| aio.queue_stat(task, c.fd))?;
        }
        2 => {
            let OpResult::Stat(stat) = meta.result else {
                panic!("expected metadata, got {:?}", meta.result);
            };
            assert_eq!(stat.size, 6);
            rt.suspend(file_entry, ctx, |aio, task, c| unsafe {
                aio.queue_read(task, c.fd, &mut c.buf, 0)
            })?;
        }
        3 => {
            assert_eq!(meta.result, OpResult::Value(6));
            assert_eq!(&ctx.buf, b"abcdef");
            rt.suspend(file_entry, ctx, |aio, task, c| aio.queue_close(task, c.fd))?;
        }
        4 => {
            assert_eq!(meta.result, OpResult::None);
            ctx.done.set(true);
        }
        _ => unreachable!("file chain ran past its last step"),
    }
    Ok(())
}

#[test]
fn test_open_stat_read_close() -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    tmp.write_all(b"abcdef")?;

    let runtime = runtime();
    let done = Rc::new(Cell::new(false));
    runtime.spawn(
        file_entry,
        Box::new(FileCtx {
            path: tmp.path().to_path_buf(),
            fd: -1,
            buf: [0; 6],
            step: 0,
            done: Rc::clone(&done),
        }),
    )?;

    runtime.run()?;

    assert!(done.get());
    assert_eq!(runtime.pending_jobs(), 0);
    Ok(())
}

#[test]
fn test_cross_thread_wake_leaves_timer_waiting() -> Result<()> {
    let runtime = runtime();
    let fired = Rc::new(Cell::new(0));

    let timer = runtime.spawn_delay(
        timer_entry,
        Box::new(TimerCtx {
            fired: Rc::clone(&fired),
        }),
        Duration::from_secs(3600),
    )?;

    let waker = runtime.waker();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        waker.wake().unwrap();
    });

    // Nothing is runnable, so the reap blocks in the kernel; the wake must
    // be what unblocks it, not the hour-long timer.
    let started = Instant::now();
    runtime.reap_once(true)?;
    handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fired.get(), 0);
    assert!(runtime.is_waiting(timer));
    assert_eq!(runtime.pending_jobs(), 1);
    Ok(())
}

#[test]
fn test_task_capacity_saturation() -> Result<()> {
    let runtime = Builder::new_epoll().max_tasks(4).try_build()?;
    for _ in 0..4 {
        runtime.spawn(noop_entry, Box::new(()))?;
    }

    let overflow = runtime.spawn(noop_entry, Box::new(()));
    assert!(matches!(overflow, Err(RuntimeError::TaskPoolFull)));

    // One tick runs all four bodies and releases their slots.
    runtime.run()?;
    assert_eq!(runtime.occupied_count(), 0);
    assert!(runtime.spawn(noop_entry, Box::new(())).is_ok());
    Ok(())
}

fn failing_entry(_rt: &Runtime, _meta: &TaskMeta, _ctx: Box<()>) -> Result<()> {
    Err(anyhow!("boom"))
}

#[test]
fn test_task_failure_is_isolated() -> Result<()> {
    let runtime = runtime();
    let sibling_ran = Rc::new(Cell::new(false));

    runtime.spawn(failing_entry, Box::new(()))?;
    runtime.spawn(flag_entry, Box::new(Rc::clone(&sibling_ran)))?;

    // The failing body is logged and swallowed; run itself stays healthy.
    runtime.run()?;

    assert!(sibling_ran.get());
    assert_eq!(runtime.occupied_count(), 0);
    Ok(())
}

struct StopCtx {
    sibling_ran: Rc<Cell<bool>>,
}

fn stopping_entry(rt: &Runtime, _meta: &TaskMeta, ctx: Box<StopCtx>) -> Result<()> {
    rt.stop();
    // Anything spawned now would only be dispatched next tick, which stop
    // wins.
    rt.spawn(flag_entry, Box::new(Rc::clone(&ctx.sibling_ran)))?;
    Ok(())
}

#[test]
fn test_stop_exits_before_next_dispatch() -> Result<()> {
    let runtime = runtime();
    let sibling_ran = Rc::new(Cell::new(false));

    runtime.spawn(
        stopping_entry,
        Box::new(StopCtx {
            sibling_ran: Rc::clone(&sibling_ran),
        }),
    )?;
    runtime.run()?;

    assert!(!sibling_ran.get());
    // The undispatched sibling still holds its slot; its context is
    // reclaimed when the runtime drops.
    assert_eq!(runtime.occupied_count(), 1);
    Ok(())
}

#[test]
fn test_run_on_empty_runtime_returns_immediately() -> Result<()> {
    let runtime = runtime();
    runtime.run()?;
    Ok(())
}
