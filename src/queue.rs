//! Bounded message queues and timers.
//!
//! Threads in this process communicate exclusively through fixed-capacity
//! queues, the same primitive the host kernel provides. A capacity-1 queue
//! doubles as a mutex (the token is the lock) and as a rendezvous slot; the
//! notification channel leans on that for its single parked long-poll.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

/// A bounded multi-producer multi-consumer queue. Cloning yields another
/// handle to the same queue.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.inner.items.lock().len())
            .finish()
    }
}

impl<T> Queue<T> {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Queue<T> {
        assert!(capacity > 0);
        Queue {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// Append a message, blocking while the queue is full.
    pub fn send(&self, msg: T) {
        let mut items = self.inner.items.lock();
        while items.len() >= self.inner.capacity {
            self.inner.not_full.wait(&mut items);
        }
        items.push_back(msg);
        self.inner.not_empty.notify_one();
    }

    /// Append a message unless the queue is full.
    pub fn try_send(&self, msg: T) -> Result<(), T> {
        let mut items = self.inner.items.lock();
        if items.len() >= self.inner.capacity {
            return Err(msg);
        }
        items.push_back(msg);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest message, blocking while the queue is empty.
    pub fn receive(&self) -> T {
        let mut items = self.inner.items.lock();
        loop {
            if let Some(msg) = items.pop_front() {
                self.inner.not_full.notify_one();
                return msg;
            }
            self.inner.not_empty.wait(&mut items);
        }
    }

    /// Take the oldest message if one is queued.
    pub fn try_receive(&self) -> Option<T> {
        let mut items = self.inner.items.lock();
        let msg = items.pop_front();
        if msg.is_some() {
            self.inner.not_full.notify_one();
        }
        msg
    }

    /// Take the oldest message, giving up after `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut items = self.inner.items.lock();
        loop {
            if let Some(msg) = items.pop_front() {
                self.inner.not_full.notify_one();
                return Some(msg);
            }
            if self
                .inner
                .not_empty
                .wait_until(&mut items, deadline)
                .timed_out()
            {
                return None;
            }
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// True when no message is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A repeating timer delivering a tick message to a queue, the analog of
/// the kernel's timer-to-message-queue binding.
#[derive(Debug)]
pub struct Timer {
    cancelled: Arc<AtomicBool>,
}

impl Timer {
    /// Start a timer posting `()` to `queue` every `period`. Ticks are
    /// dropped, not accumulated, while the queue is full.
    pub fn repeating(period: Duration, queue: Queue<()>) -> Timer {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        thread::Builder::new()
            .name("timer".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    let _ = queue.try_send(());
                }
            })
            .expect("spawn timer thread");
        Timer { cancelled }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = Queue::new(4);
        q.send(1);
        q.send(2);
        q.send(3);
        assert_eq!(q.receive(), 1);
        assert_eq!(q.receive(), 2);
        assert_eq!(q.receive(), 3);
    }

    #[test]
    fn bounded_send() {
        let q = Queue::new(1);
        q.send(1);
        assert!(q.try_send(2).is_err());
        assert_eq!(q.receive(), 1);
        assert!(q.try_send(2).is_ok());
    }

    #[test]
    fn blocks_until_sent() {
        let q = Queue::new(1);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.receive());
        thread::sleep(Duration::from_millis(10));
        q.send(7);
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn timeout_elapses() {
        let q: Queue<i32> = Queue::new(1);
        assert_eq!(q.receive_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn capacity_one_as_rendezvous() {
        let q = Queue::new(1);
        let q2 = q.clone();
        let t = thread::spawn(move || {
            q2.send(());
        });
        q.receive();
        t.join().unwrap();
    }
}
