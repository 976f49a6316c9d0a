//! The per-device IO thread skeleton: a poll set augmented with the device's
//! message queue.
//!
//! The IO thread is an explicit state machine, not implicit coroutines. Each
//! iteration blocks on the poll set (woken early by queued messages), then
//! the driver drains its message queue, applies pending deferred volume
//! changes, and runs its hardware state machine. Implementors register their
//! own fds on [`IoLoop::registry`] and must not block anywhere else.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};

/// The token reserved for the message-queue waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// A mio poll set with a waker wired to a device message queue.
pub struct IoLoop {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl IoLoop {
    /// Creates the loop and its waker.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            waker,
        })
    }

    /// The waker to hand to [`crate::msgq::async_msgq`] so queued messages
    /// interrupt the poll.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// The registry on which drivers register their hardware fds.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Runs one poll iteration and returns the ready events.
    pub fn iterate(&mut self, timeout: Option<Duration>) -> io::Result<&Events> {
        self.events.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        Ok(&self.events)
    }
}

impl std::fmt::Debug for IoLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IoLoop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgq::async_msgq;
    use std::thread;

    #[test]
    fn queued_message_wakes_the_poll() {
        let mut ioloop = IoLoop::new().unwrap();
        let (q, rx) = async_msgq::<u32>(Some(ioloop.waker()));

        let ctl = thread::spawn(move || q.send(42));

        // Without the waker this would sleep the full timeout.
        let mut got = None;
        for _ in 0..100 {
            ioloop.iterate(Some(Duration::from_secs(5))).unwrap();
            if let Some(env) = rx.try_recv() {
                got = Some(env.msg);
                env.ack(Ok(()));
                break;
            }
        }

        assert_eq!(got, Some(42));
        ctl.join().unwrap().unwrap();
    }
}
