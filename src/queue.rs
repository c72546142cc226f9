//! Priority-ordered command intake queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::command::{Command, Priority};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out waiting for a command")]
pub struct QueueTimeout;

/// Thread-safe queue of commands, popped highest priority first and
/// FIFO within one priority.
#[derive(Default)]
pub struct CommandQueue {
    state: Mutex<BTreeMap<Priority, VecDeque<Command>>>,
    cv: Condvar,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: Command) {
        let mut state = self.state.lock().expect("command queue lock poisoned");
        state.entry(command.priority).or_default().push_back(command);
        drop(state);
        self.cv.notify_one();
    }

    pub fn pop(&self) -> Option<Command> {
        let mut state = self.state.lock().expect("command queue lock poisoned");
        Self::pop_locked(&mut state)
    }

    /// Block until a command is available or the timeout elapses.
    pub fn get(&self, timeout: Duration) -> Result<Command, QueueTimeout> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("command queue lock poisoned");
        loop {
            if let Some(command) = Self::pop_locked(&mut state) {
                return Ok(command);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueTimeout);
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("command queue lock poisoned");
            state = next;
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("command queue lock poisoned");
        state.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("command queue lock poisoned");
        state.clear();
    }

    fn pop_locked(state: &mut BTreeMap<Priority, VecDeque<Command>>) -> Option<Command> {
        let (&priority, bucket) = state.iter_mut().next_back()?;
        let command = bucket.pop_front()?;
        if bucket.is_empty() {
            state.remove(&priority);
        }
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;
    use std::sync::Arc;
    use std::thread;

    fn command_with_priority(priority: i64) -> Command {
        let mut request = Message::new("Status");
        request.set("priority", priority.to_string());
        Command::new(request)
    }

    #[test]
    fn pops_highest_priority_first_fifo_within() {
        let queue = CommandQueue::new();
        let mut normal_a = command_with_priority(500);
        normal_a.id = "a".to_string();
        let mut normal_b = command_with_priority(500);
        normal_b.id = "b".to_string();
        queue.push(normal_a);
        queue.push(command_with_priority(750));
        queue.push(normal_b);

        assert_eq!(queue.pop().unwrap().priority, Priority::High);
        assert_eq!(queue.pop().unwrap().id, "a");
        assert_eq!(queue.pop().unwrap().id, "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn get_times_out_when_empty() {
        let queue = CommandQueue::new();
        let err = queue.get(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, QueueTimeout);
    }

    #[test]
    fn get_wakes_on_push() {
        let queue = Arc::new(CommandQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(command_with_priority(500));
        let command = waiter.join().unwrap().expect("push wakes the waiter");
        assert_eq!(command.priority, Priority::Normal);
        assert!(queue.is_empty());
    }
}
