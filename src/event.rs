//! Single-threaded event loop: I/O readiness watches, one-shot timers,
//! nestable loops with a thread-local "current loop" pointer.
//!
//! The driver registers at most one watch per connection socket at a time;
//! changing direction means removing the old watch and installing a new one.
//! Handlers may add and remove watches and timers re-entrantly, so the loop
//! never holds interior borrows across a handler invocation.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Direction of socket readiness a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

type IoHandler = Rc<RefCell<Box<dyn FnMut()>>>;

struct WatchEntry {
    id: u64,
    fd: RawFd,
    dir: IoDir,
    handler: IoHandler,
}

struct TimerEntry {
    id: u64,
    deadline: Instant,
    handler: Box<dyn FnOnce()>,
}

struct LoopInner {
    next_id: u64,
    watches: Vec<WatchEntry>,
    timers: Vec<TimerEntry>,
    stop_requested: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

/// A single-threaded event loop.
pub struct EventLoop {
    inner: RefCell<LoopInner>,
}

impl EventLoop {
    /// Create a new loop. Does not become current; see [`EventLoop::set_current`].
    pub fn new() -> Rc<EventLoop> {
        Rc::new(EventLoop {
            inner: RefCell::new(LoopInner {
                next_id: 1,
                watches: Vec::new(),
                timers: Vec::new(),
                stop_requested: false,
            }),
        })
    }

    /// The thread's current loop. Created lazily on first use.
    pub fn current() -> Rc<EventLoop> {
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            if cur.is_none() {
                *cur = Some(EventLoop::new());
            }
            cur.as_ref().expect("current loop just installed").clone()
        })
    }

    /// Replace the thread's current loop.
    pub fn set_current(ev: &Rc<EventLoop>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(ev.clone()));
    }

    /// Current wall-clock reading used for timer deadlines.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Install a readiness watch on `fd`. The handler fires whenever the
    /// descriptor becomes ready in the requested direction (error and hangup
    /// conditions count as ready, so the handler can observe the failure).
    pub fn watch_io(
        self: &Rc<Self>,
        fd: RawFd,
        dir: IoDir,
        handler: Box<dyn FnMut()>,
    ) -> IoWatch {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.watches.push(WatchEntry {
            id,
            fd,
            dir,
            handler: Rc::new(RefCell::new(handler)),
        });
        IoWatch {
            ev: self.clone(),
            id,
        }
    }

    /// Arm a one-shot timer. The handler fires once after `after` elapses
    /// and the timer removes itself.
    pub fn add_timer(self: &Rc<Self>, after: Duration, handler: Box<dyn FnOnce()>) -> Timer {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.timers.push(TimerEntry {
            id,
            deadline: Instant::now() + after,
            handler,
        });
        Timer {
            ev: self.clone(),
            id,
        }
    }

    /// Dispatch ready handlers until [`EventLoop::stop`] is called.
    pub fn run(self: &Rc<Self>) {
        self.inner.borrow_mut().stop_requested = false;
        loop {
            if self.inner.borrow().stop_requested {
                break;
            }
            self.iterate();
        }
    }

    /// Request the innermost `run` on this loop to return.
    pub fn stop(&self) {
        self.inner.borrow_mut().stop_requested = true;
    }

    fn iterate(self: &Rc<Self>) {
        let now = Instant::now();
        let (fds_meta, next_deadline) = {
            let inner = self.inner.borrow();
            assert!(
                !inner.watches.is_empty() || !inner.timers.is_empty(),
                "event loop has nothing to wait for"
            );
            let meta: Vec<(u64, RawFd, IoDir)> = inner
                .watches
                .iter()
                .map(|w| (w.id, w.fd, w.dir))
                .collect();
            let deadline = inner.timers.iter().map(|t| t.deadline).min();
            (meta, deadline)
        };

        let mut pollfds: Vec<PollFd> = fds_meta
            .iter()
            .map(|(_, fd, dir)| {
                let flags = match dir {
                    IoDir::Read => PollFlags::POLLIN,
                    IoDir::Write => PollFlags::POLLOUT,
                };
                // Safety: the registering code keeps the descriptor open for
                // the lifetime of the watch; the borrow lasts only for this
                // poll call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, flags)
            })
            .collect();

        let timeout = match next_deadline {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let ms = deadline.saturating_duration_since(now).as_millis();
                PollTimeout::from(ms.min(60_000) as u16)
            }
        };

        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return,
            Err(e) => panic!("poll() failed: {}", e),
        }

        let fired: Vec<u64> = pollfds
            .iter()
            .zip(&fds_meta)
            .filter_map(|(pfd, (id, _, dir))| {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                let mut want = match dir {
                    IoDir::Read => PollFlags::POLLIN,
                    IoDir::Write => PollFlags::POLLOUT,
                };
                want |= PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
                if revents.intersects(want) {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect();
        drop(pollfds);

        let now = Instant::now();
        loop {
            // Pop one due timer at a time: a handler may stop the loop, and
            // unfired timers must stay armed for the next run.
            let timer = {
                let mut inner = self.inner.borrow_mut();
                inner
                    .timers
                    .iter()
                    .position(|t| t.deadline <= now)
                    .map(|i| inner.timers.remove(i))
            };
            let Some(timer) = timer else {
                break;
            };
            (timer.handler)();
            if self.inner.borrow().stop_requested {
                return;
            }
        }

        for id in fired {
            // A previous handler may have removed this watch; re-check.
            let handler = {
                let inner = self.inner.borrow();
                inner
                    .watches
                    .iter()
                    .find(|w| w.id == id)
                    .map(|w| w.handler.clone())
            };
            if let Some(handler) = handler {
                (*handler.borrow_mut())();
            }
            if self.inner.borrow().stop_requested {
                return;
            }
        }
    }

    fn remove_watch(&self, id: u64) {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            inner
                .watches
                .iter()
                .position(|w| w.id == id)
                .map(|i| inner.watches.remove(i))
        };
        // The handler and its captures die here, with no loop borrow held,
        // so a cascading removal from a destructor cannot deadlock.
        drop(entry);
    }

    fn remove_timer(&self, id: u64) {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            inner
                .timers
                .iter()
                .position(|t| t.id == id)
                .map(|i| inner.timers.remove(i))
        };
        drop(entry);
    }
}

/// Handle to an installed I/O watch. Dropping it removes the watch.
pub struct IoWatch {
    ev: Rc<EventLoop>,
    id: u64,
}

impl IoWatch {
    /// Remove the watch. Equivalent to dropping the handle.
    pub fn remove(self) {}
}

impl Drop for IoWatch {
    fn drop(&mut self) {
        self.ev.remove_watch(self.id);
    }
}

/// Handle to an armed timer. Dropping it cancels the timer.
pub struct Timer {
    ev: Rc<EventLoop>,
    id: u64,
}

impl Timer {
    /// Cancel the timer. Equivalent to dropping the handle.
    pub fn remove(self) {}
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.ev.remove_timer(self.id);
    }
}
