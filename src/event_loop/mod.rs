//! Single-threaded event loop
//!
//! The loop multiplexes the display socket, timer descriptors and arbitrary
//! watched descriptors through `calloop`, plus a FIFO of [deferred] tasks
//! that always runs to completion before the loop may block.
//!
//! One iteration of [`Display::run`]:
//!
//! 1. drain deferred tasks, including tasks they enqueue
//! 2. dispatch protocol events that were already read
//! 3. stop if [`Display::exit_loop`] was called or a fatal error occurred
//! 4. flush; a full socket switches its interest to read+write
//! 5. block until a source is ready and run its task
//!
//! Sources are registered with level-triggered [`Generic`] sources. The
//! socket source is kept as a [`Dispatcher`] so its interest can be changed
//! while it is registered.
//!
//! Unwatching takes effect immediately, even from inside a callback: a
//! source removed while the loop is dispatching never runs again, including
//! for readiness already collected in the same poll.

pub mod deferred;
pub mod timer;

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use calloop::generic::Generic;
use calloop::{Dispatcher, EventLoop, LoopHandle, Mode, PostAction, RegistrationToken};
use log::{debug, error, info, trace, warn};

use crate::display::Display;
use crate::error::{ToolkitError, ToolkitResult, TransportError};
use crate::protocol::FlushStatus;
use crate::window::WindowId;

pub use calloop::{Interest, Readiness};
pub use deferred::{DeferredQueue, DeferredTask, TaskId};
pub use timer::TimerFd;

type SocketSource = Generic<OwnedFd>;

/// Registration state of every source the display watches.
pub(crate) struct Reactor {
    event_loop: Option<EventLoop<'static, Display>>,
    handle: LoopHandle<'static, Display>,
    socket: Dispatcher<'static, SocketSource, Display>,
    socket_token: RegistrationToken,
    pending_interest: Option<Interest>,
    watches: HashMap<RawFd, RegistrationToken>,
    dispatching: bool,
    /// Watched descriptor whose callback is running.
    running_watch: Option<RawFd>,
    /// The running callback unwatched its own descriptor.
    running_removed: bool,
}

impl Reactor {
    pub(crate) fn new(socket: BorrowedFd<'_>) -> ToolkitResult<Self> {
        let event_loop: EventLoop<'static, Display> = EventLoop::try_new()?;
        let handle = event_loop.handle();

        let fd = socket.try_clone_to_owned().map_err(TransportError::from)?;
        let socket = Dispatcher::new(
            Generic::new(fd, Interest::READ, Mode::Level),
            |readiness, _, display: &mut Display| {
                display.socket_ready(readiness);
                Ok(PostAction::Continue)
            },
        );
        let socket_token = handle.register_dispatcher(socket.clone())?;

        Ok(Self {
            event_loop: Some(event_loop),
            handle,
            socket,
            socket_token,
            pending_interest: None,
            watches: HashMap::new(),
            dispatching: false,
            running_watch: None,
            running_removed: false,
        })
    }

    fn set_socket_interest(&mut self, interest: Interest) -> ToolkitResult<()> {
        if self.dispatching {
            self.pending_interest = Some(interest);
            return Ok(());
        }
        let current = self.socket.as_source_ref().interest;
        if current.readable == interest.readable && current.writable == interest.writable {
            return Ok(());
        }
        self.socket.as_source_mut().interest = interest;
        self.handle.update(&self.socket_token)?;
        trace!(
            "Socket interest: read={} write={}",
            interest.readable,
            interest.writable
        );
        Ok(())
    }

    /// Applies a socket interest change requested while dispatching.
    fn apply_pending(&mut self) -> ToolkitResult<()> {
        if let Some(interest) = self.pending_interest.take() {
            self.set_socket_interest(interest)?;
        }
        Ok(())
    }

    fn insert_watch<F>(
        &mut self,
        fd: RawFd,
        source: Generic<OwnedFd>,
        mut callback: F,
    ) -> ToolkitResult<()>
    where
        F: FnMut(Readiness, &mut Display) + 'static,
    {
        if self.watches.contains_key(&fd) {
            return Err(ToolkitError::AlreadyWatched(fd));
        }
        let token = self
            .handle
            .insert_source(source, move |readiness, _, display: &mut Display| {
                display.reactor.enter_watch(fd);
                callback(readiness, display);
                Ok(display.reactor.leave_watch())
            })
            .map_err(|e| e.error)?;
        self.watches.insert(fd, token);
        Ok(())
    }

    /// Unregisters the source at once. A callback that unwatches its own
    /// descriptor is removed by calloop when it returns.
    fn remove_watch(&mut self, fd: RawFd) -> bool {
        let Some(token) = self.watches.remove(&fd) else {
            return false;
        };
        if self.running_watch == Some(fd) {
            self.running_removed = true;
        } else {
            self.handle.remove(token);
        }
        true
    }

    fn enter_watch(&mut self, fd: RawFd) {
        self.running_watch = Some(fd);
        self.running_removed = false;
    }

    fn leave_watch(&mut self) -> PostAction {
        self.running_watch = None;
        if std::mem::take(&mut self.running_removed) {
            PostAction::Remove
        } else {
            PostAction::Continue
        }
    }

    pub(crate) fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

impl Display {
    /// Runs the loop until [`Display::exit_loop`] is called or a fatal
    /// error occurs. Transport failures and buffer exhaustion are returned.
    pub fn run(&mut self) -> ToolkitResult<()> {
        let mut event_loop = self
            .reactor
            .event_loop
            .take()
            .ok_or(ToolkitError::LoopReentered)?;
        self.running = true;
        info!("▶️ Event loop running");

        let result = self.run_until_stopped(&mut event_loop);

        self.reactor.event_loop = Some(event_loop);
        self.running = false;
        match &result {
            Ok(()) => info!("⏹️ Event loop stopped"),
            Err(e) => error!("❌ Event loop ended: {}", e),
        }
        result
    }

    fn run_until_stopped(
        &mut self,
        event_loop: &mut EventLoop<'static, Display>,
    ) -> ToolkitResult<()> {
        loop {
            self.check_fatal()?;
            self.drain_deferred();
            self.check_fatal()?;
            self.dispatch_pending()?;
            self.check_fatal()?;

            if !self.running {
                return Ok(());
            }
            // Dispatching may have queued redraws.
            if !self.deferred.is_empty() {
                continue;
            }

            self.flush()?;

            self.reactor.dispatching = true;
            let dispatched = event_loop.dispatch(None, self);
            self.reactor.dispatching = false;
            self.reactor.apply_pending()?;
            dispatched?;
        }
    }

    /// One non-blocking pass: deferred tasks, whatever the socket holds,
    /// the tasks that queued, then a flush.
    pub fn dispatch_once(&mut self) -> ToolkitResult<()> {
        self.check_fatal()?;
        self.drain_deferred();
        self.check_fatal()?;
        self.transport.read_events()?;
        self.dispatch_pending()?;
        self.drain_deferred();
        self.check_fatal()?;
        self.flush()
    }

    /// Stops [`Display::run`] at the next iteration.
    pub fn exit_loop(&mut self) {
        debug!("Exit requested");
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Queues a task for the next idle point.
    pub fn defer<F>(&mut self, task: F) -> TaskId
    where
        F: FnOnce(&mut Display) + 'static,
    {
        self.next_task += 1;
        let id = TaskId::Anonymous(self.next_task);
        self.deferred.push(id, Box::new(task));
        id
    }

    /// Queues a task under a caller-chosen key. Returns `false` if a task
    /// with that key is already pending.
    pub fn defer_keyed<F>(&mut self, key: u64, task: F) -> bool
    where
        F: FnOnce(&mut Display) + 'static,
    {
        self.deferred.push(TaskId::Keyed(key), Box::new(task))
    }

    pub fn cancel_deferred(&mut self, id: TaskId) -> bool {
        self.deferred.cancel(id)
    }

    pub fn pending_tasks(&self) -> usize {
        self.deferred.len()
    }

    /// Runs `task` whenever `fd` is ready for `interest`. Returns the key to
    /// pass to [`Display::unwatch_descriptor`].
    pub fn watch_descriptor<F>(
        &mut self,
        fd: BorrowedFd<'_>,
        interest: Interest,
        mut task: F,
    ) -> ToolkitResult<RawFd>
    where
        F: FnMut(&mut Display, Readiness) + 'static,
    {
        let raw = fd.as_raw_fd();
        let owned = fd.try_clone_to_owned()?;
        self.reactor.insert_watch(
            raw,
            Generic::new(owned, interest, Mode::Level),
            move |readiness, display| task(display, readiness),
        )?;
        debug!("👀 Watching descriptor {}", raw);
        Ok(raw)
    }

    pub fn unwatch_descriptor(&mut self, fd: RawFd) -> bool {
        let removed = self.reactor.remove_watch(fd);
        if removed {
            debug!("Unwatched descriptor {}", fd);
        }
        removed
    }

    /// Runs `task` with the expiration count whenever `timer` fires.
    pub fn add_timer<F>(&mut self, timer: &TimerFd, mut task: F) -> ToolkitResult<RawFd>
    where
        F: FnMut(&mut Display, u64) + 'static,
    {
        let raw = timer.as_raw_fd();
        let reader = timer.try_clone()?;
        let owned = timer.as_fd().try_clone_to_owned()?;
        self.reactor.insert_watch(
            raw,
            Generic::new(owned, Interest::READ, Mode::Level),
            move |_, display| match reader.read() {
                Ok(Some(expirations)) => task(display, expirations),
                Ok(None) => trace!("Spurious wake-up of timer {}", raw),
                Err(e) => warn!("Reading timer {} failed: {}", raw, e),
            },
        )?;
        debug!("⏲️ Timer {} added", raw);
        Ok(raw)
    }

    /// Like [`Display::add_timer`], but the timer is unwatched when the
    /// window is destroyed.
    pub fn add_window_timer<F>(
        &mut self,
        window: WindowId,
        timer: &TimerFd,
        task: F,
    ) -> ToolkitResult<RawFd>
    where
        F: FnMut(&mut Display, u64) + 'static,
    {
        if !self.windows.contains_key(&window) {
            return Err(ToolkitError::UnknownWindow(window));
        }
        let raw = self.add_timer(timer, task)?;
        if let Some(window) = self.windows.get_mut(&window) {
            window.timers.push(raw);
        }
        Ok(raw)
    }

    pub(crate) fn drain_deferred(&mut self) {
        while self.fatal.is_none() {
            let Some((id, task)) = self.deferred.pop() else {
                break;
            };
            trace!("Running deferred {:?}", id);
            task(self);
        }
    }

    pub(crate) fn flush(&mut self) -> ToolkitResult<()> {
        match self.transport.flush()? {
            FlushStatus::Done => Ok(()),
            FlushStatus::WouldBlock => {
                debug!("Socket full, waiting for it to drain");
                self.reactor.set_socket_interest(Interest::BOTH)
            }
        }
    }

    fn socket_ready(&mut self, readiness: Readiness) {
        if readiness.error {
            self.fail(TransportError::Hangup.into());
            return;
        }
        if readiness.readable {
            let read = self.transport.read_events();
            if let Err(e) = read.and_then(|_| self.dispatch_pending()) {
                self.fail(e.into());
                return;
            }
        }
        if readiness.writable {
            match self.transport.flush() {
                Ok(FlushStatus::Done) => {
                    if let Err(e) = self.reactor.set_socket_interest(Interest::READ) {
                        self.fail(e);
                    }
                }
                Ok(FlushStatus::WouldBlock) => {}
                Err(e) => self.fail(e.into()),
            }
        }
    }

    /// Records a fatal error and stops the loop.
    pub(crate) fn fail(&mut self, err: ToolkitError) {
        error!("💥 Fatal: {}", err);
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        self.running = false;
    }

    fn check_fatal(&mut self) -> ToolkitResult<()> {
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
