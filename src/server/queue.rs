//! Per-server outbound command queue.
//!
//! Many producers (plugin workers), one consumer (the daemon loop). Both
//! sides take the same short mutex, so an enqueue racing a drain lands
//! either in this drain or the next one, never in neither.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::irc::Command;
use crate::net::Notifier;

/// FIFO of commands waiting for transmission.
pub struct CommandQueue {
    pending: Mutex<VecDeque<Command>>,
    notifier: Notifier,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    /// Create a queue that wakes `notifier` on every enqueue.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notifier,
        }
    }

    /// Append a command and wake the daemon loop.
    pub fn enqueue(&self, command: Command) {
        self.pending
            .lock()
            .expect("Command queue mutex poisoned")
            .push_back(command);
        self.notifier.notify();
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain_all(&self) -> Vec<Command> {
        let drained = std::mem::take(&mut *self.pending.lock().expect("Command queue mutex poisoned"));
        drained.into()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.pending.lock().expect("Command queue mutex poisoned").len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::net::Listener;

    fn msg(producer: usize, seq: usize) -> Command {
        Command::Privmsg {
            target: format!("#p{producer}"),
            text: seq.to_string(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::new(Notifier::disabled());
        queue.enqueue(msg(0, 1));
        queue.enqueue(msg(0, 2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_all(), vec![msg(0, 1), msg(0, 2)]);
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_concurrent_producers_with_drainer() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let queue = Arc::new(CommandQueue::new(Notifier::disabled()));
        let done = Arc::new(AtomicBool::new(false));

        let drainer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    seen.extend(queue.drain_all());
                    if finished {
                        break;
                    }
                    thread::yield_now();
                }
                seen
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(msg(p, i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let seen = drainer.join().unwrap();

        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER, "nothing lost or duplicated");

        // Per producer, sequence numbers appear in enqueue order.
        let mut last: HashMap<String, i64> = HashMap::new();
        for command in seen {
            let Command::Privmsg { target, text } = command else {
                panic!("unexpected command");
            };
            let seq: i64 = text.parse().unwrap();
            let prev = last.insert(target, seq).unwrap_or(-1);
            assert_eq!(seq, prev + 1);
        }
    }

    #[test]
    fn test_enqueue_wakes_blocked_wait() {
        let mut listener = Listener::new().unwrap();
        let queue = Arc::new(CommandQueue::new(listener.notifier()));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.enqueue(msg(0, 0));
            })
        };

        let started = Instant::now();
        let wait = listener.wait(Duration::from_secs(10)).unwrap();
        producer.join().unwrap();

        assert!(wait.woken);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.drain_all().len(), 1);
    }
}
