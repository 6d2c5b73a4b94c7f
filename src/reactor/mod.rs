//! Socket-callback reactor (C7).
//!
//! The original design is a single dedicated thread running `poll()`
//! over a table of registered fds, woken by a self-pipe trigger whenever
//! the registration queue changes. The idiomatic `tokio` analogue kept
//! here is a single dedicated task holding an
//! `mpsc::UnboundedReceiver<ReactorCommand>` as its registration queue
//! (the async substitute for the self-pipe: sending on the channel wakes
//! the task the same way a byte on the trigger pipe wakes `poll`), and a
//! `tokio::io::unix::AsyncFd` per registered fd for readiness-driven
//! read/write/exception notification instead of a raw `poll` call.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::time::Instant;

bitflags_like::bitflags! {
    /// Interest mask, matching the original's `when` bits.
    pub struct Interest: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const EXCEPTION = 0b0100;
        const EXIT = 0b1000;
    }
}

/// Why a callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    Read,
    Write,
    Exception,
    Timeout,
    Cancel,
    Exit,
}

pub type SockCallback = Box<dyn Fn(RawFd, FireReason) -> bool + Send + Sync>;

enum ReactorCommand {
    Register {
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
        callback: SockCallback,
    },
    Cancel(RawFd),
    Shutdown,
}

/// Handle used by client code to enqueue callbacks and cancellations.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<ReactorCommand>,
}

impl ReactorHandle {
    pub fn queue(
        &self,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
        callback: SockCallback,
    ) {
        let _ = self.tx.send(ReactorCommand::Register { fd, interest, timeout, callback });
    }

    pub fn cancel(&self, fd: RawFd) {
        let _ = self.tx.send(ReactorCommand::Cancel(fd));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ReactorCommand::Shutdown);
    }
}

struct ActiveEntry {
    interest: Interest,
    deadline: Option<Instant>,
    callback: SockCallback,
}

/// Spawns the reactor task and returns a handle to it. The loop drains
/// the registration queue, applies cancellations (firing `Cancel` on any
/// callback that had one), and polls every active fd concurrently for
/// readiness or its deadline, whichever comes first.
pub fn spawn() -> ReactorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx));
    ReactorHandle { tx }
}

const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(30);

async fn run(mut rx: mpsc::UnboundedReceiver<ReactorCommand>) {
    let mut active: HashMap<RawFd, ActiveEntry> = HashMap::new();
    let mut shutting_down = false;

    loop {
        // Drain all pending commands without blocking, mirroring "drain
        // the incoming queue into the active table" at the top of each
        // iteration.
        loop {
            match rx.try_recv() {
                Ok(ReactorCommand::Register { fd, interest, timeout, callback }) => {
                    let deadline = timeout.map(|t| Instant::now() + t);
                    active.insert(fd, ActiveEntry { interest, deadline, callback });
                }
                Ok(ReactorCommand::Cancel(fd)) => {
                    if let Some(entry) = active.remove(&fd) {
                        (entry.callback)(fd, FireReason::Cancel);
                    }
                }
                Ok(ReactorCommand::Shutdown) => {
                    shutting_down = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    shutting_down = true;
                    break;
                }
            }
        }

        if shutting_down {
            for (fd, entry) in active.drain() {
                if entry.interest.contains(Interest::EXIT) {
                    (entry.callback)(fd, FireReason::Exit);
                }
            }
            return;
        }

        if active.is_empty() {
            // Nothing to poll; wait for the next command (or shutdown).
            match rx.recv().await {
                Some(cmd) => {
                    apply_single(&mut active, cmd, &mut shutting_down);
                }
                None => return,
            }
            continue;
        }

        // Fire timed-out entries first and drop their watch mask (they
        // are removed below, after the select below runs once, matching
        // "entry will be deleted next pass").
        let now = Instant::now();
        let mut expired = Vec::new();
        for (&fd, entry) in active.iter() {
            if let Some(deadline) = entry.deadline {
                if deadline <= now {
                    expired.push(fd);
                }
            }
        }
        for fd in expired {
            if let Some(entry) = active.remove(&fd) {
                (entry.callback)(fd, FireReason::Timeout);
            }
        }

        if active.is_empty() {
            continue;
        }

        let timeout = active
            .values()
            .filter_map(|e| e.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
            .unwrap_or(MAX_POLL_TIMEOUT)
            .min(MAX_POLL_TIMEOUT);

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => apply_single(&mut active, cmd, &mut shutting_down),
                    None => shutting_down = true,
                }
            }
            _ = tokio::time::sleep(timeout) => {
                // Loop again; the expiry sweep above will catch any
                // newly-expired entries.
            }
            fired = wait_any_ready(&active) => {
                if let Some((fd, reason)) = fired {
                    if let Some(entry) = active.get(&fd) {
                        let rearm = (entry.callback)(fd, reason);
                        if !rearm {
                            active.remove(&fd);
                        }
                    }
                }
            }
        }
    }
}

fn apply_single(active: &mut HashMap<RawFd, ActiveEntry>, cmd: ReactorCommand, shutting_down: &mut bool) {
    match cmd {
        ReactorCommand::Register { fd, interest, timeout, callback } => {
            let deadline = timeout.map(|t| Instant::now() + t);
            active.insert(fd, ActiveEntry { interest, deadline, callback });
        }
        ReactorCommand::Cancel(fd) => {
            if let Some(entry) = active.remove(&fd) {
                (entry.callback)(fd, FireReason::Cancel);
            }
        }
        ReactorCommand::Shutdown => *shutting_down = true,
    }
}

/// Races readiness across every active fd, returning the first one that
/// becomes ready along with which interest fired. Mask bits for a single
/// fd are delivered in a fixed order: read, write, exception.
async fn wait_any_ready(active: &HashMap<RawFd, ActiveEntry>) -> Option<(RawFd, FireReason)> {
    if active.is_empty() {
        std::future::pending::<()>().await;
        return None;
    }
    let mut futures: Vec<_> = active
        .iter()
        .filter_map(|(&fd, entry)| {
            // The fd is owned by the registrant, not by this reactor;
            // `BorrowedRawFd` never closes it, mirroring the original's
            // non-owning poll-fd table.
            let async_fd = AsyncFd::with_interest(BorrowedRawFd(fd), interest_to_tokio(entry.interest));
            async_fd.ok().map(|a| Box::pin(wait_one(fd, a, entry.interest)))
        })
        .collect();
    if futures.is_empty() {
        std::future::pending::<()>().await;
        return None;
    }
    let (result, _idx, _rest) = futures::future::select_all(futures.drain(..)).await;
    result
}

async fn wait_one(
    fd: RawFd,
    async_fd: AsyncFd<BorrowedRawFd>,
    interest: Interest,
) -> Option<(RawFd, FireReason)> {
    if interest.contains(Interest::READ) {
        if let Ok(mut guard) = async_fd.readable().await {
            guard.clear_ready();
            return Some((fd, FireReason::Read));
        }
    }
    if interest.contains(Interest::WRITE) {
        if let Ok(mut guard) = async_fd.writable().await {
            guard.clear_ready();
            return Some((fd, FireReason::Write));
        }
    }
    None
}

fn interest_to_tokio(interest: Interest) -> tokio::io::Interest {
    let mut tokio_interest = tokio::io::Interest::ERROR;
    if interest.contains(Interest::READ) {
        tokio_interest |= tokio::io::Interest::READABLE;
    }
    if interest.contains(Interest::WRITE) {
        tokio_interest |= tokio::io::Interest::WRITABLE;
    }
    tokio_interest
}

/// Non-owning wrapper so `AsyncFd` can borrow a raw fd without taking
/// ownership (and therefore without closing it on drop) — the reactor
/// never owns the sockets it watches.
struct BorrowedRawFd(RawFd);

impl std::os::unix::io::AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

mod bitflags_like {
    //! Minimal bitflags macro, avoiding an extra dependency for a single
    //! four-bit mask type.
    macro_rules! bitflags {
        (
            $(#[$outer:meta])*
            pub struct $name:ident: $ty:ty {
                $(const $flag:ident = $val:expr;)*
            }
        ) => {
            $(#[$outer])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $name($ty);
            impl $name {
                $(pub const $flag: $name = $name($val);)*
                pub fn contains(&self, other: $name) -> bool {
                    (self.0 & other.0) == other.0
                }
            }
            impl std::ops::BitOr for $name {
                type Output = $name;
                fn bitor(self, rhs: $name) -> $name {
                    $name(self.0 | rhs.0)
                }
            }
        };
    }
    pub(crate) use bitflags;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[tokio::test]
    async fn fires_timeout_reason_when_no_activity() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let handle = spawn();
        let (tx, mut rx) = mpsc::unbounded_channel::<FireReason>();
        handle.queue(
            fd,
            Interest::READ,
            Some(Duration::from_millis(50)),
            Box::new(move |_fd, reason| {
                let _ = tx.send(reason);
                false
            }),
        );

        let reason = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reactor should fire before the test timeout")
            .expect("channel should yield a reason");
        assert_eq!(reason, FireReason::Timeout);
        handle.shutdown();
        drop(a);
    }

    #[tokio::test]
    async fn cancel_fires_cancel_reason() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let handle = spawn();
        let (tx, mut rx) = mpsc::unbounded_channel::<FireReason>();
        handle.queue(
            fd,
            Interest::READ,
            None,
            Box::new(move |_fd, reason| {
                let _ = tx.send(reason);
                false
            }),
        );
        // Give the reactor a moment to register before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel(fd);

        let reason = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reactor should fire before the test timeout")
            .expect("channel should yield a reason");
        assert_eq!(reason, FireReason::Cancel);
        handle.shutdown();
        drop(a);
    }
}
