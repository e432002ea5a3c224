use std::collections::VecDeque;

use parking_lot::Mutex;

/// Control messages from the UI / correlation driver to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Switch the stimulated core; the processor discards all accumulated
    /// eye state.
    ChangeVictimCore(i32),
    /// Change the per-bin accumulation cap; existing queues are trimmed at
    /// the next finalization.
    ChangeAccumulations(usize),
}

/// Mutex-guarded FIFO of control commands.
///
/// Enqueue is unconditional; the processor drains opportunistically once
/// per outer loop iteration. Order is preserved.
#[derive(Default)]
pub struct CommandQueue {
    queue: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, cmd: Command) {
        self.queue.lock().push_back(cmd);
    }

    pub fn try_pop(&self) -> Option<Command> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
