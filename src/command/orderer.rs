// Submission orderer - ticket based fan-in onto the GPU queue
//
// Tickets are handed out when a submit/present request is accepted. Tasks
// may run on any pool thread in any order, but only the holder of the next
// ticket may touch the queue.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Position of a submit/present request in queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    #[inline]
    pub fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct SubmissionOrderer {
    next_ticket: AtomicU64,
    next_to_complete: Mutex<u64>,
    advanced: Condvar,
    heartbeat: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    head: u64,
    heartbeat: u64,
}

/// Exclusive right to use the queue for one ticket. Dropping it completes
/// the ticket and wakes every task waiting for its turn.
#[must_use = "dropping the turn immediately completes the ticket"]
pub struct Turn<'a> {
    orderer: &'a SubmissionOrderer,
    ticket: Ticket,
}

impl SubmissionOrderer {
    pub fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            next_to_complete: Mutex::new(0),
            advanced: Condvar::new(),
            heartbeat: AtomicU64::new(0),
        }
    }

    /// Issues the next ticket. Called on the requesting thread.
    pub fn reserve(&self) -> Ticket {
        Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst))
    }

    /// Takes the turn if `ticket` is the next one to complete.
    pub fn try_advance(&self, ticket: Ticket) -> Option<Turn<'_>> {
        let current = self.next_to_complete.lock();
        self.turn_if_current(*current, ticket)
    }

    /// Like `try_advance`, but parks for up to `backoff` until the turn
    /// comes. Never waits longer, so the calling pool thread is handed back
    /// to the pool in bounded time.
    pub fn wait_turn(&self, ticket: Ticket, backoff: Duration) -> Option<Turn<'_>> {
        let mut current = self.next_to_complete.lock();
        if *current != ticket.0 && !backoff.is_zero() {
            let deadline = Instant::now() + backoff;
            while *current != ticket.0 {
                if self.advanced.wait_until(&mut current, deadline).timed_out() {
                    break;
                }
            }
        }
        self.turn_if_current(*current, ticket)
    }

    /// Marks the head ticket's task as alive while it waits on something
    /// other than its turn (its recording). No effect for other tickets.
    pub(crate) fn touch(&self, ticket: Ticket) {
        let current = self.next_to_complete.lock();
        if *current == ticket.0 {
            self.heartbeat.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Snapshot of the head ticket and its heartbeat. Unchanged snapshots
    /// across retries mean nobody is moving the queue forward.
    pub(crate) fn progress(&self) -> Progress {
        let head = *self.next_to_complete.lock();
        Progress {
            head,
            heartbeat: self.heartbeat.load(Ordering::SeqCst),
        }
    }

    /// The ticket currently allowed to use the queue.
    pub fn next_to_complete(&self) -> Ticket {
        Ticket(*self.next_to_complete.lock())
    }

    /// Reserved tickets that have not completed yet.
    pub fn pending(&self) -> u64 {
        let current = *self.next_to_complete.lock();
        self.next_ticket.load(Ordering::SeqCst) - current
    }

    /// Blocks until every ticket reserved so far has completed. Returns
    /// `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.next_to_complete.lock();
        while *current < self.next_ticket.load(Ordering::SeqCst) {
            if self.advanced.wait_until(&mut current, deadline).timed_out() {
                return *current >= self.next_ticket.load(Ordering::SeqCst);
            }
        }
        true
    }

    // The guard must only exist for the current ticket: dropping it
    // completes the ticket.
    fn turn_if_current(&self, current: u64, ticket: Ticket) -> Option<Turn<'_>> {
        if current == ticket.0 {
            Some(Turn {
                orderer: self,
                ticket,
            })
        } else {
            None
        }
    }

    fn complete(&self, ticket: Ticket) {
        let mut current = self.next_to_complete.lock();
        debug_assert_eq!(*current, ticket.0, "completed a ticket out of turn");
        *current += 1;
        drop(current);
        self.advanced.notify_all();
    }
}

impl Default for SubmissionOrderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Turn<'_> {
    pub(crate) fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.orderer.complete(self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tickets_are_issued_in_call_order() {
        let orderer = SubmissionOrderer::new();
        let tickets: Vec<u64> = (0..5).map(|_| orderer.reserve().index()).collect();
        assert_eq!(tickets, vec![0, 1, 2, 3, 4]);
        assert_eq!(orderer.pending(), 5);
    }

    #[test]
    fn only_the_next_ticket_gets_a_turn() {
        let orderer = SubmissionOrderer::new();
        let first = orderer.reserve();
        let second = orderer.reserve();

        assert!(orderer.try_advance(second).is_none());
        let turn = orderer.try_advance(first).unwrap();
        assert_eq!(turn.ticket(), first);
        // Still held, so the second ticket must wait
        assert!(orderer.try_advance(second).is_none());
        drop(turn);

        assert_eq!(orderer.next_to_complete(), second);
        drop(orderer.try_advance(second).unwrap());
        assert_eq!(orderer.pending(), 0);
    }

    #[test]
    fn polling_ahead_of_turn_leaves_the_queue_alone() {
        let orderer = Arc::new(SubmissionOrderer::new());
        let first = orderer.reserve();
        let second = orderer.reserve();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        {
            let orderer = orderer.clone();
            thread::spawn(move || {
                let early = orderer.try_advance(second).is_none();
                let waited = orderer.wait_turn(second, Duration::from_millis(5)).is_none();
                done_tx.send(early && waited).unwrap();
            });
        }

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(orderer.next_to_complete(), first);
        assert_eq!(orderer.pending(), 2);
    }

    #[test]
    fn touch_only_counts_for_the_head_ticket() {
        let orderer = SubmissionOrderer::new();
        let first = orderer.reserve();
        let second = orderer.reserve();

        let start = orderer.progress();
        orderer.touch(second);
        assert_eq!(orderer.progress(), start);
        orderer.touch(first);
        assert_ne!(orderer.progress(), start);

        let touched = orderer.progress();
        drop(orderer.try_advance(first).unwrap());
        assert_ne!(orderer.progress(), touched);
    }

    #[test]
    fn wait_turn_gives_up_after_backoff() {
        let orderer = SubmissionOrderer::new();
        let _first = orderer.reserve();
        let second = orderer.reserve();

        let start = Instant::now();
        assert!(orderer.wait_turn(second, Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_turn_wakes_when_previous_ticket_completes() {
        let orderer = Arc::new(SubmissionOrderer::new());
        let first = orderer.reserve();
        let second = orderer.reserve();

        let waiter = {
            let orderer = orderer.clone();
            thread::spawn(move || {
                let turn = orderer.wait_turn(second, Duration::from_secs(10));
                turn.is_some()
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(orderer.try_advance(first).unwrap());

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_idle_tracks_outstanding_tickets() {
        let orderer = Arc::new(SubmissionOrderer::new());
        assert!(orderer.wait_idle(Duration::ZERO));

        let ticket = orderer.reserve();
        assert!(!orderer.wait_idle(Duration::from_millis(10)));

        let completer = {
            let orderer = orderer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                drop(orderer.try_advance(ticket).unwrap());
            })
        };
        assert!(orderer.wait_idle(Duration::from_secs(10)));
        completer.join().unwrap();
    }
}
