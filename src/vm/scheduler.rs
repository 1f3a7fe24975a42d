//! Cooperative coroutine support for the CyberBasic VM.
//!
//! This module provides:
//! - Execution contexts (instruction pointer, operand stack, call frames)
//! - A coroutine registry addressed by id, in creation order
//! - Suspension states for `Yield` and `WaitSeconds`
//!
//! Nothing here runs code; the VM drives contexts and reports back how each
//! slice ended.

use super::Value;

pub type CoroutineId = usize;

/// Scheduling state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoroutineState {
    /// Created, has not run yet
    Ready,
    /// Currently executing a slice
    Running,
    /// Yielded; resumes on the next pass
    SuspendedYield,
    /// Waiting until the host clock reaches the given time
    SuspendedTimer(f64),
    /// Returned from its body
    Done,
}

impl CoroutineState {
    /// Whether a context in this state gets a slice in a pass at `now`.
    pub fn is_runnable(&self, now: f64) -> bool {
        match self {
            CoroutineState::Ready | CoroutineState::SuspendedYield => true,
            CoroutineState::SuspendedTimer(wake_at) => now >= *wake_at,
            CoroutineState::Running | CoroutineState::Done => false,
        }
    }
}

/// A call frame pushed by `CallUser`.
#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    /// Instruction to resume at in the caller
    pub return_ip: usize,
    /// Stack index of the first argument
    pub base: usize,
    /// Qualified function name, for stack traces
    pub name: String,
}

/// An independently suspendable execution context.
#[derive(Debug, Clone, Default)]
pub(crate) struct Context {
    pub ip: usize,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
}

impl Context {
    pub fn at(ip: usize) -> Self {
        Self {
            ip,
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
        }
    }

    /// Stack index of local slot 0 for the innermost frame.
    pub fn base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }
}

#[derive(Debug)]
pub(crate) struct Coroutine {
    pub id: CoroutineId,
    pub name: String,
    pub context: Context,
    pub state: CoroutineState,
}

/// Registry of live coroutines in creation order.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    coroutines: Vec<Coroutine>,
    next_id: CoroutineId,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a coroutine in the `Ready` state starting at `entry`.
    pub fn spawn(&mut self, name: &str, entry: usize) -> CoroutineId {
        let id = self.next_id;
        self.next_id += 1;
        self.coroutines.push(Coroutine {
            id,
            name: name.to_string(),
            context: Context::at(entry),
            state: CoroutineState::Ready,
        });
        id
    }

    /// Ids of coroutines that get a slice in a pass at `now`, in ready order.
    pub fn runnable(&self, now: f64) -> Vec<CoroutineId> {
        self.coroutines
            .iter()
            .filter(|c| c.state.is_runnable(now))
            .map(|c| c.id)
            .collect()
    }

    pub fn get_mut(&mut self, id: CoroutineId) -> Option<&mut Coroutine> {
        self.coroutines.iter_mut().find(|c| c.id == id)
    }

    pub fn state(&self, id: CoroutineId) -> Option<CoroutineState> {
        self.coroutines.iter().find(|c| c.id == id).map(|c| c.state)
    }

    /// Drop finished coroutines.
    pub fn reap(&mut self) {
        self.coroutines.retain(|c| c.state != CoroutineState::Done);
    }

    pub fn clear(&mut self) {
        self.coroutines.clear();
    }

    pub fn len(&self) -> usize {
        self.coroutines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coroutines.is_empty()
    }

    /// Earliest pending timer wake-up, if any coroutine is sleeping.
    pub fn next_wake(&self) -> Option<f64> {
        self.coroutines
            .iter()
            .filter_map(|c| match c.state {
                CoroutineState::SuspendedTimer(t) => Some(t),
                _ => None,
            })
            .reduce(f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runnable_states() {
        assert!(CoroutineState::Ready.is_runnable(0.0));
        assert!(CoroutineState::SuspendedYield.is_runnable(0.0));
        assert!(!CoroutineState::SuspendedTimer(1.0).is_runnable(0.5));
        assert!(CoroutineState::SuspendedTimer(1.0).is_runnable(1.0));
        assert!(!CoroutineState::Done.is_runnable(10.0));
    }

    #[test]
    fn test_spawn_order_and_reap() {
        let mut sched = Scheduler::new();
        let a = sched.spawn("a", 10);
        let b = sched.spawn("b", 20);
        assert_eq!(sched.runnable(0.0), vec![a, b]);

        sched.get_mut(a).unwrap().state = CoroutineState::Done;
        sched.get_mut(b).unwrap().state = CoroutineState::SuspendedTimer(2.0);
        assert!(sched.runnable(1.0).is_empty());
        assert_eq!(sched.next_wake(), Some(2.0));

        sched.reap();
        assert_eq!(sched.len(), 1);
        assert_eq!(sched.state(b), Some(CoroutineState::SuspendedTimer(2.0)));
    }

    #[test]
    fn test_context_base() {
        let mut ctx = Context::at(0);
        assert_eq!(ctx.base(), 0);
        ctx.frames.push(CallFrame {
            return_ip: 5,
            base: 3,
            name: "f".into(),
        });
        assert_eq!(ctx.base(), 3);
    }
}
