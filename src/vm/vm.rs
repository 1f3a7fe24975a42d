use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{self, Write};
use std::iter;
use std::mem;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use super::builtins::{self, Builtins};
use super::events::{EventKind, EventRegistration, EventTable};
use super::foreign::ForeignRegistry;
use super::host::Host;
use super::scheduler::{CallFrame, Context, CoroutineId, CoroutineState, Scheduler};
use super::{ArrayData, Chunk, DictData, Op, Value, VmError};
use crate::config::{DivisionPolicy, ForeignPolicy, RuntimeConfig};

/// Result of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Main or at least one coroutine still has work
    Running,
    /// Main halted and no coroutines remain, or `Quit` ran
    Finished,
}

/// How a slice of execution ended.
#[derive(Debug)]
enum Slice {
    Yielded,
    Waiting(f64),
    Finished(Value),
    Quit,
}

/// The kind of context being executed.
#[derive(Debug, Clone)]
enum Role {
    Main,
    Coroutine(CoroutineId, String),
    Handler(EventRegistration),
    Host(String),
}

impl Role {
    fn label(&self) -> String {
        match self {
            Role::Main => "<main>".to_string(),
            Role::Coroutine(id, name) => format!("coroutine #{} {}", id, name),
            Role::Handler(reg) => format!("on {}(\"{}\")", reg.kind, reg.key),
            Role::Host(name) => format!("<host call {}>", name),
        }
    }

    fn check_suspend(&self) -> Result<(), String> {
        match self {
            Role::Main | Role::Coroutine(..) => Ok(()),
            Role::Handler(_) => Err("cannot suspend inside an event handler".to_string()),
            Role::Host(_) => Err("cannot suspend inside a host call".to_string()),
        }
    }
}

/// The CyberBasic virtual machine.
///
/// A VM owns one compiled chunk and is driven by the host one scheduling
/// pass at a time. Each pass runs main to its next suspension point, then
/// gives every runnable coroutine one slice, then dispatches triggered
/// event handlers.
pub struct VM {
    chunk: Rc<Chunk>,
    config: RuntimeConfig,
    /// Variable slots, indexed by `Chunk::variables`
    slots: Vec<Value>,
    /// Dynamic globals by lowercase name
    globals: HashMap<String, Value>,
    foreign: ForeignRegistry,
    builtins: Builtins,
    scheduler: Scheduler,
    events: EventTable,
    main: Option<Context>,
    main_state: CoroutineState,
    /// Host clock at the start of the current pass
    now: f64,
    pass_count: u64,
    failed: Option<VmError>,
    last_trace: Vec<String>,
    /// Output stream for print statements
    output: Box<dyn Write>,
}

impl VM {
    pub fn new(chunk: Chunk) -> Self {
        Self::with_config(chunk, RuntimeConfig::default(), Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(chunk: Chunk, output: Box<dyn Write>) -> Self {
        Self::with_config(chunk, RuntimeConfig::default(), output)
    }

    /// Create a VM with full configuration. The foreign registry starts with
    /// the standard dict helpers and `assert`.
    pub fn with_config(chunk: Chunk, config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        let slots = vec![Value::Nil; chunk.variables.len()];
        Self {
            chunk: Rc::new(chunk),
            config,
            slots,
            globals: HashMap::new(),
            foreign: ForeignRegistry::with_std(),
            builtins: Builtins::new(),
            scheduler: Scheduler::new(),
            events: EventTable::new(),
            main: Some(Context::at(0)),
            main_state: CoroutineState::Ready,
            now: 0.0,
            pass_count: 0,
            failed: None,
            last_trace: Vec::new(),
            output,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register (or replace) a foreign function.
    pub fn register_foreign<F>(&mut self, name: &str, f: F)
    where
        F: FnMut(&[Value]) -> Result<Value, String> + 'static,
    {
        self.foreign.register(name, f);
    }

    pub fn foreign_mut(&mut self) -> &mut ForeignRegistry {
        &mut self.foreign
    }

    /// Make `Random` deterministic.
    pub fn seed_random(&mut self, seed: u64) {
        self.builtins.seed(seed);
    }

    /// Read a slot variable or dynamic global by case-insensitive name.
    pub fn global(&self, name: &str) -> Option<Value> {
        if let Some(slot) = self.chunk.lookup_variable(name) {
            return Some(self.load_slot(slot));
        }
        self.globals.get(&name.to_lowercase()).cloned()
    }

    /// Write a slot variable if one exists by that name, else a dynamic global.
    pub fn set_global(&mut self, name: &str, value: Value) {
        match self.chunk.lookup_variable(name) {
            Some(slot) => self.store_slot(slot, value),
            None => {
                self.globals.insert(name.to_lowercase(), value);
            }
        }
    }

    /// Frames active at the last failure, outermost first.
    pub fn stack_trace(&self) -> &[String] {
        &self.last_trace
    }

    pub fn pass_count(&self) -> u64 {
        self.pass_count
    }

    pub fn is_finished(&self) -> bool {
        self.main_state == CoroutineState::Done && self.scheduler.is_empty()
    }

    pub fn main_state(&self) -> CoroutineState {
        self.main_state
    }

    /// Number of live coroutines.
    pub fn coroutine_count(&self) -> usize {
        self.scheduler.len()
    }

    /// State of a live coroutine. Finished coroutines are removed at the end
    /// of the pass they finish in.
    pub fn coroutine_state(&self, id: CoroutineId) -> Option<CoroutineState> {
        self.scheduler.state(id)
    }

    pub fn event_registrations(&self) -> impl Iterator<Item = &EventRegistration> {
        self.events.iter()
    }

    /// Run one scheduling pass.
    pub fn pass(&mut self, host: &mut dyn Host) -> Result<PassOutcome, VmError> {
        if self.failed.is_some() {
            return Err(VmError::new("vm already failed"));
        }
        if self.is_finished() {
            return Ok(PassOutcome::Finished);
        }

        self.now = host.now();
        self.pass_count += 1;
        if self.config.trace_scheduler {
            eprintln!(
                "[SCHED] pass {} at t={:.3}s ({} coroutines)",
                self.pass_count,
                self.now,
                self.scheduler.len()
            );
        }

        self.run_pass(host).inspect_err(|err| self.record_failure(err))
    }

    /// Run passes until the program finishes.
    ///
    /// Fails if `max_passes` is configured and reached first.
    pub fn run_to_completion(&mut self, host: &mut dyn Host) -> Result<(), VmError> {
        loop {
            if let Some(limit) = self.config.max_passes
                && self.pass_count >= limit
            {
                return Err(VmError::new(format!(
                    "pass limit exceeded: program still running after {} passes",
                    limit
                )));
            }
            if self.pass(host)? == PassOutcome::Finished {
                return Ok(());
            }
            self.idle(host);
        }
    }

    /// Call a user function or sub from the host and run it to completion.
    pub fn invoke_sub(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        if self.failed.is_some() {
            return Err(VmError::new("vm already failed"));
        }
        let entry = self
            .chunk
            .function(name)
            .ok_or_else(|| VmError::new(format!("unknown user function: {}", name)))?;
        if entry.arity != args.len() {
            return Err(VmError::new(format!(
                "{}() expects {} argument(s), got {}",
                name,
                entry.arity,
                args.len()
            )));
        }

        let mut ctx = Context::at(entry.offset);
        ctx.stack.extend_from_slice(args);
        let role = Role::Host(name.to_lowercase());
        match self.run_slice(&mut ctx, &role) {
            Ok(Slice::Finished(value)) => Ok(value),
            Ok(Slice::Quit) => {
                self.quit();
                Ok(Value::Nil)
            }
            Ok(Slice::Yielded | Slice::Waiting(_)) => {
                Err(VmError::new("cannot suspend inside a host call"))
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn record_failure(&mut self, err: &VmError) {
        self.last_trace = err.trace.clone();
        self.failed = Some(err.clone());
    }

    fn run_pass(&mut self, host: &mut dyn Host) -> Result<PassOutcome, VmError> {
        // Main
        if self.main_state.is_runnable(self.now)
            && let Some(mut ctx) = self.main.take()
        {
            self.main_state = CoroutineState::Running;
            let slice = self.run_slice(&mut ctx, &Role::Main)?;
            self.main_state = match slice {
                Slice::Yielded => CoroutineState::SuspendedYield,
                Slice::Waiting(wake_at) => CoroutineState::SuspendedTimer(wake_at),
                Slice::Finished(_) => CoroutineState::Done,
                Slice::Quit => return Ok(self.quit()),
            };
            if self.config.trace_scheduler {
                eprintln!("[SCHED] main -> {:?}", self.main_state);
            }
            self.main = Some(ctx);
        }

        // Coroutines, snapshotted so ones started during this phase wait a pass
        for id in self.scheduler.runnable(self.now) {
            let Some(co) = self.scheduler.get_mut(id) else {
                continue;
            };
            co.state = CoroutineState::Running;
            let mut ctx = mem::take(&mut co.context);
            let role = Role::Coroutine(id, co.name.clone());

            let state = match self.run_slice(&mut ctx, &role)? {
                Slice::Yielded => CoroutineState::SuspendedYield,
                Slice::Waiting(wake_at) => CoroutineState::SuspendedTimer(wake_at),
                Slice::Finished(_) => CoroutineState::Done,
                Slice::Quit => return Ok(self.quit()),
            };
            if self.config.trace_scheduler {
                eprintln!("[SCHED] {} -> {:?}", role.label(), state);
            }
            if let Some(co) = self.scheduler.get_mut(id) {
                co.context = ctx;
                co.state = state;
            }
        }
        self.scheduler.reap();

        // Event handlers
        let registered = self.events.len();
        for index in 0..registered {
            let Some(reg) = self.events.get(index).cloned() else {
                continue;
            };
            if !reg.is_triggered(host) {
                continue;
            }
            if self.config.trace_events {
                eprintln!("[EVENT] dispatch {}(\"{}\") -> @{:04}", reg.kind, reg.key, reg.handler);
            }
            let mut ctx = Context::at(reg.handler);
            if let Slice::Quit = self.run_slice(&mut ctx, &Role::Handler(reg))? {
                return Ok(self.quit());
            }
        }

        Ok(if self.is_finished() {
            PassOutcome::Finished
        } else {
            PassOutcome::Running
        })
    }

    fn quit(&mut self) -> PassOutcome {
        if self.config.trace_scheduler {
            eprintln!("[SCHED] quit, dropping {} coroutines", self.scheduler.len());
        }
        self.scheduler.clear();
        self.main_state = CoroutineState::Done;
        PassOutcome::Finished
    }

    /// Sleep briefly when every context is waiting on a timer.
    fn idle(&self, host: &mut dyn Host) {
        if self.main_state.is_runnable(f64::NEG_INFINITY)
            || !self.scheduler.runnable(f64::NEG_INFINITY).is_empty()
        {
            return;
        }
        let main_wake = match self.main_state {
            CoroutineState::SuspendedTimer(wake_at) => Some(wake_at),
            _ => None,
        };
        let wake = [main_wake, self.scheduler.next_wake()]
            .into_iter()
            .flatten()
            .reduce(f64::min);
        if let Some(wake) = wake {
            let delay = (wake - host.now()).clamp(0.0, 0.01);
            if delay > 0.0 {
                thread::sleep(Duration::from_secs_f64(delay));
            }
        }
    }

    fn run_slice(&mut self, ctx: &mut Context, role: &Role) -> Result<Slice, VmError> {
        let chunk = Rc::clone(&self.chunk);
        loop {
            let start = ctx.ip;
            match self.step(&chunk, ctx, role) {
                Ok(None) => {}
                Ok(Some(slice)) => return Ok(slice),
                Err(message) => {
                    let trace = iter::once(role.label())
                        .chain(ctx.frames.iter().map(|f| f.name.clone()))
                        .collect();
                    return Err(VmError {
                        message,
                        line: chunk.line_at(start),
                        trace,
                    });
                }
            }
        }
    }

    /// Execute one instruction. Returns the slice outcome when the context
    /// stops running.
    fn step(
        &mut self,
        chunk: &Chunk,
        ctx: &mut Context,
        role: &Role,
    ) -> Result<Option<Slice>, String> {
        if ctx.ip >= chunk.code.len() {
            return Ok(Some(Slice::Finished(Value::Nil)));
        }
        if ctx.stack.len() >= self.config.stack_limit {
            return Err("stack overflow".to_string());
        }

        let byte = read_u8(chunk, ctx)?;
        let op = Op::try_from(byte).map_err(|b| format!("invalid opcode: {}", b))?;

        match op {
            Op::LoadConst | Op::LoadString => {
                let value = constant(chunk, read_u8(chunk, ctx)?)?.clone();
                ctx.stack.push(value);
            }
            Op::LoadVar => {
                let slot = read_u8(chunk, ctx)?;
                ctx.stack.push(self.load_slot(slot));
            }
            Op::StoreVar => {
                let slot = read_u8(chunk, ctx)?;
                let value = pop(ctx)?;
                self.store_slot(slot, value);
            }
            Op::LoadLocal => {
                let index = ctx.base() + read_u8(chunk, ctx)? as usize;
                let value = ctx
                    .stack
                    .get(index)
                    .cloned()
                    .ok_or_else(|| format!("invalid local slot: {}", index))?;
                ctx.stack.push(value);
            }
            Op::StoreLocal => {
                let index = ctx.base() + read_u8(chunk, ctx)? as usize;
                let value = pop(ctx)?;
                let target = ctx
                    .stack
                    .get_mut(index)
                    .ok_or_else(|| format!("invalid local slot: {}", index))?;
                *target = value;
            }
            Op::LoadGlobal => {
                let name = name_at(chunk, read_u8(chunk, ctx)?)?;
                let key = name.to_lowercase();
                let value = if let Some(value) = self.globals.get(&key) {
                    value.clone()
                } else if self.foreign.contains(&key) {
                    self.call_foreign(&name, &[])?
                } else {
                    return Err(format!("undefined global variable: {}", name));
                };
                ctx.stack.push(value);
            }
            Op::StoreGlobal => {
                let name = name_at(chunk, read_u8(chunk, ctx)?)?;
                let value = pop(ctx)?;
                self.globals.insert(name.to_lowercase(), value);
            }
            Op::Pop => {
                pop(ctx)?;
            }
            Op::Dup => {
                let value = ctx.stack.last().cloned().ok_or("stack underflow")?;
                ctx.stack.push(value);
            }

            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Power
            | Op::IntDiv
            | Op::Less
            | Op::LessEqual
            | Op::Greater
            | Op::GreaterEqual => {
                let b = pop(ctx)?;
                let a = pop(ctx)?;
                let result = match op {
                    Op::Add => add(a, b)?,
                    Op::Sub => sub(a, b)?,
                    Op::Mul => mul(a, b)?,
                    Op::Div => self.div(a, b)?,
                    Op::Mod => modulo(a, b)?,
                    Op::Power => power(a, b)?,
                    Op::IntDiv => int_div(a, b)?,
                    _ => {
                        let ordering = compare(&a, &b)?;
                        Value::Bool(match op {
                            Op::Less => ordering == Some(Ordering::Less),
                            Op::LessEqual => {
                                matches!(ordering, Some(Ordering::Less | Ordering::Equal))
                            }
                            Op::Greater => ordering == Some(Ordering::Greater),
                            _ => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                        })
                    }
                };
                ctx.stack.push(result);
            }
            Op::Equal | Op::NotEqual => {
                let b = pop(ctx)?;
                let a = pop(ctx)?;
                let equal = a.eq(&b);
                ctx.stack.push(Value::Bool(if op == Op::Equal { equal } else { !equal }));
            }
            Op::And | Op::Or | Op::Xor => {
                let b = pop(ctx)?.is_truthy();
                let a = pop(ctx)?.is_truthy();
                let result = match op {
                    Op::And => a && b,
                    Op::Or => a || b,
                    _ => a != b,
                };
                ctx.stack.push(Value::Bool(result));
            }
            Op::Neg => {
                let result = match pop(ctx)? {
                    Value::Int(n) => Value::Int(n.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => return Err(format!("cannot negate {}", other.type_name())),
                };
                ctx.stack.push(result);
            }
            Op::Not => {
                let value = pop(ctx)?;
                ctx.stack.push(Value::Bool(!value.is_truthy()));
            }

            Op::Jump => {
                let offset = read_i16(chunk, ctx)?;
                jump(chunk, ctx, offset)?;
            }
            Op::JumpIfFalse | Op::JumpIfTrue => {
                let offset = read_i16(chunk, ctx)?;
                let condition = pop(ctx)?.is_truthy();
                if condition == (op == Op::JumpIfTrue) {
                    jump(chunk, ctx, offset)?;
                }
            }
            Op::CallUser => {
                let name = name_at(chunk, read_u8(chunk, ctx)?)?;
                let argc = read_u8(chunk, ctx)? as usize;
                let entry = chunk
                    .function(&name)
                    .ok_or_else(|| format!("unknown user function: {}", name))?;
                if entry.arity != argc {
                    return Err(format!(
                        "{}() expects {} argument(s), got {}",
                        name, entry.arity, argc
                    ));
                }
                if ctx.stack.len() < argc {
                    return Err("stack underflow".to_string());
                }
                if ctx.frames.len() >= self.config.frame_limit {
                    return Err(format!("call stack overflow in {}", name));
                }
                if self.config.trace_calls {
                    eprintln!("[CALL] {}({} args) -> @{:04}", name, argc, entry.offset);
                }
                ctx.frames.push(CallFrame {
                    return_ip: ctx.ip,
                    base: ctx.stack.len() - argc,
                    name: name.to_lowercase(),
                });
                ctx.ip = entry.offset;
            }
            Op::CallForeign => {
                let name = name_at(chunk, read_u8(chunk, ctx)?)?;
                let argc = read_u8(chunk, ctx)? as usize;
                let args = pop_n(ctx, argc)?;
                let value = self.call_foreign(&name, &args)?;
                ctx.stack.push(value);
            }
            Op::Return | Op::ReturnVal => {
                let value = if op == Op::ReturnVal {
                    pop(ctx)?
                } else {
                    Value::Nil
                };
                match ctx.frames.pop() {
                    None => return Ok(Some(Slice::Finished(value))),
                    Some(frame) => {
                        ctx.stack.truncate(frame.base);
                        ctx.stack.push(value);
                        ctx.ip = frame.return_ip;
                    }
                }
            }
            Op::Halt => return Ok(Some(Slice::Finished(Value::Nil))),
            Op::Quit => return Ok(Some(Slice::Quit)),

            Op::StartCoroutine => {
                let target = read_u16(chunk, ctx)? as usize;
                let name = name_at(chunk, read_u8(chunk, ctx)?)?;
                if target >= chunk.code.len() {
                    return Err(format!("coroutine entry out of range: {}", name));
                }
                let id = self.scheduler.spawn(&name, target);
                if self.config.trace_scheduler {
                    eprintln!("[SCHED] start coroutine #{} {} @{:04}", id, name, target);
                }
            }
            Op::Yield => {
                role.check_suspend()?;
                return Ok(Some(Slice::Yielded));
            }
            Op::WaitSeconds => {
                let value = pop(ctx)?;
                let seconds = value
                    .as_float()
                    .ok_or_else(|| format!("WaitSeconds expects a number, got {}", value.type_name()))?;
                role.check_suspend()?;
                if seconds > 0.0 {
                    return Ok(Some(Slice::Waiting(self.now + seconds)));
                }
            }
            Op::RegisterEvent => {
                let kind_name = name_at(chunk, read_u8(chunk, ctx)?)?;
                let key = name_at(chunk, read_u8(chunk, ctx)?)?;
                let handler = read_u16(chunk, ctx)? as usize;
                let kind = EventKind::parse(&kind_name)
                    .ok_or_else(|| format!("unknown event kind: {}", kind_name))?;
                let registered = self.events.register(EventRegistration {
                    kind,
                    key: key.clone(),
                    handler,
                });
                if registered && self.config.trace_events {
                    eprintln!("[EVENT] register {}(\"{}\") -> @{:04}", kind, key, handler);
                }
            }

            Op::CreateArray => {
                let rank = read_u8(chunk, ctx)? as usize;
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    let size = constant(chunk, read_u8(chunk, ctx)?)?;
                    match size {
                        Value::Int(n) if *n >= 1 => dims.push(*n as usize),
                        other => return Err(format!("invalid array dimension: {}", other)),
                    }
                }
                let slot = read_u8(chunk, ctx)?;
                let array = ArrayData::new(dims, Value::Int(0)).ok_or_else(|| {
                    format!("array too large: {}", variable_name(chunk, slot))
                })?;
                self.store_slot(slot, Value::array(array));
            }
            Op::LoadArray => {
                let slot = read_u8(chunk, ctx)?;
                let array = self.array_in(chunk, slot)?;
                let rank = array.borrow().dims.len();
                let indices = pop_indices(ctx, rank)?;
                let value = {
                    let data = array.borrow();
                    let offset = data
                        .offset(&indices)
                        .ok_or_else(|| bounds_error(chunk, slot, &indices))?;
                    data.elements[offset].clone()
                };
                ctx.stack.push(value);
            }
            Op::StoreArray => {
                let slot = read_u8(chunk, ctx)?;
                let array = self.array_in(chunk, slot)?;
                let rank = array.borrow().dims.len();
                let indices = pop_indices(ctx, rank)?;
                let value = pop(ctx)?;
                let mut data = array.borrow_mut();
                let offset = data
                    .offset(&indices)
                    .ok_or_else(|| bounds_error(chunk, slot, &indices))?;
                data.elements[offset] = value;
            }
            Op::MatMul => {
                let result = name_at(chunk, read_u8(chunk, ctx)?)?;
                let lhs = name_at(chunk, read_u8(chunk, ctx)?)?;
                let rhs = name_at(chunk, read_u8(chunk, ctx)?)?;
                self.matmul(chunk, &result, &lhs, &rhs)?;
            }
            Op::LoadEntityProp => {
                let entity = name_at(chunk, read_u8(chunk, ctx)?)?;
                let prop = name_at(chunk, read_u8(chunk, ctx)?)?;
                let dict = self.entity(&entity)?;
                let value = dict
                    .borrow()
                    .get(&prop.to_lowercase())
                    .cloned()
                    .unwrap_or(Value::Nil);
                ctx.stack.push(value);
            }
            Op::StoreEntityProp => {
                let entity = name_at(chunk, read_u8(chunk, ctx)?)?;
                let prop = name_at(chunk, read_u8(chunk, ctx)?)?;
                let value = pop(ctx)?;
                self.entity(&entity)?
                    .borrow_mut()
                    .insert(prop.to_lowercase(), value);
            }
            Op::Print => {
                let value = pop(ctx)?;
                writeln!(self.output, "{}", value).map_err(|e| format!("print failed: {}", e))?;
            }

            _ => {
                let argc = builtins::arity(op)
                    .ok_or_else(|| format!("invalid opcode: {}", op.name()))?;
                let args = pop_n(ctx, argc)?;
                let value = self.builtins.call(op, &args)?;
                ctx.stack.push(value);
            }
        }

        Ok(None)
    }

    fn call_foreign(&mut self, name: &str, args: &[Value]) -> Result<Value, String> {
        if self.config.trace_calls {
            eprintln!("[CALL] foreign {}({} args)", name, args.len());
        }
        match self.foreign.call(name, args) {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(format!("{}: {}", name, message)),
            None => match self.config.unknown_foreign {
                ForeignPolicy::Fatal => Err(format!("unknown foreign function: {}", name)),
                ForeignPolicy::Nil => Ok(Value::Nil),
            },
        }
    }

    fn load_slot(&self, slot: u8) -> Value {
        self.slots.get(slot as usize).cloned().unwrap_or(Value::Nil)
    }

    fn store_slot(&mut self, slot: u8, value: Value) {
        let index = slot as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Value::Nil);
        }
        self.slots[index] = value;
    }

    fn array_in(&self, chunk: &Chunk, slot: u8) -> Result<Rc<RefCell<ArrayData>>, String> {
        match self.load_slot(slot) {
            Value::Array(array) => Ok(array),
            other => Err(format!(
                "{} is not an array (got {})",
                variable_name(chunk, slot),
                other.type_name()
            )),
        }
    }

    fn entity(&self, name: &str) -> Result<Rc<RefCell<DictData>>, String> {
        match self.globals.get(&name.to_lowercase()) {
            Some(Value::Dict(dict)) => Ok(Rc::clone(dict)),
            _ => Err(format!("unknown entity: {}", name)),
        }
    }

    fn div(&self, a: Value, b: Value) -> Result<Value, String> {
        match (a, b) {
            (Value::Int(a), Value::Int(b)) => {
                if b == 0 {
                    return Err("division by zero".to_string());
                }
                Ok(Value::Int(a.wrapping_div(b)))
            }
            (a, b) => {
                let (x, y) = float_operands(&a, &b, "divide")?;
                if y == 0.0 && self.config.division == DivisionPolicy::Fatal {
                    return Err("division by zero".to_string());
                }
                Ok(Value::Float(x / y))
            }
        }
    }

    fn matmul(&mut self, chunk: &Chunk, result: &str, lhs: &str, rhs: &str) -> Result<(), String> {
        let out = self.matrix(chunk, result)?;
        let a = self.matrix(chunk, lhs)?;
        let b = self.matrix(chunk, rhs)?;

        let (n, m) = shape(&a, lhs)?;
        let (m2, p) = shape(&b, rhs)?;
        let (rn, rp) = shape(&out, result)?;
        if m != m2 || rn != n || rp != p {
            return Err(format!(
                "MatMul: incompatible shapes {}x{} * {}x{} into {}x{}",
                n, m, m2, p, rn, rp
            ));
        }

        let lhs_values = numeric_elements(&a, lhs)?;
        let rhs_values = numeric_elements(&b, rhs)?;
        let mut product = Vec::with_capacity(n * p);
        for i in 0..n {
            for j in 0..p {
                let sum: f64 = (0..m)
                    .map(|k| lhs_values[i * m + k] * rhs_values[k * p + j])
                    .sum();
                product.push(Value::Float(sum));
            }
        }
        out.borrow_mut().elements = product;
        Ok(())
    }

    fn matrix(&self, chunk: &Chunk, name: &str) -> Result<Rc<RefCell<ArrayData>>, String> {
        let slot = chunk
            .lookup_variable(name)
            .ok_or_else(|| format!("MatMul: unknown variable {}", name))?;
        match self.load_slot(slot) {
            Value::Array(array) => Ok(array),
            _ => Err(format!("MatMul: {} is not an array", name)),
        }
    }
}

fn read_u8(chunk: &Chunk, ctx: &mut Context) -> Result<u8, String> {
    let byte = *chunk.code.get(ctx.ip).ok_or("truncated instruction")?;
    ctx.ip += 1;
    Ok(byte)
}

fn read_u16(chunk: &Chunk, ctx: &mut Context) -> Result<u16, String> {
    let lo = read_u8(chunk, ctx)?;
    let hi = read_u8(chunk, ctx)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

fn read_i16(chunk: &Chunk, ctx: &mut Context) -> Result<i16, String> {
    read_u16(chunk, ctx).map(|v| v as i16)
}

fn jump(chunk: &Chunk, ctx: &mut Context, offset: i16) -> Result<(), String> {
    let target = ctx.ip as i64 + offset as i64;
    if target < 0 || target as usize > chunk.code.len() {
        return Err(format!("jump target out of range: {}", target));
    }
    ctx.ip = target as usize;
    Ok(())
}

fn constant(chunk: &Chunk, index: u8) -> Result<&Value, String> {
    chunk
        .constants
        .get(index as usize)
        .ok_or_else(|| format!("constant index out of range: {}", index))
}

fn name_at(chunk: &Chunk, index: u8) -> Result<String, String> {
    constant(chunk, index).map(|value| value.to_string())
}

fn variable_name(chunk: &Chunk, slot: u8) -> String {
    chunk
        .variables
        .get(slot as usize)
        .cloned()
        .unwrap_or_else(|| format!("slot {}", slot))
}

fn bounds_error(chunk: &Chunk, slot: u8, indices: &[i64]) -> String {
    let indices: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
    format!(
        "array index out of bounds: {}({})",
        variable_name(chunk, slot),
        indices.join(", ")
    )
}

fn pop(ctx: &mut Context) -> Result<Value, String> {
    ctx.stack.pop().ok_or_else(|| "stack underflow".to_string())
}

/// Pop `n` values, returned in push order.
fn pop_n(ctx: &mut Context, n: usize) -> Result<Vec<Value>, String> {
    if ctx.stack.len() < n {
        return Err("stack underflow".to_string());
    }
    Ok(ctx.stack.split_off(ctx.stack.len() - n))
}

fn pop_indices(ctx: &mut Context, rank: usize) -> Result<Vec<i64>, String> {
    pop_n(ctx, rank)?
        .iter()
        .map(|v| {
            v.as_int()
                .ok_or_else(|| format!("array index must be a number, got {}", v.type_name()))
        })
        .collect()
}

fn float_operands(a: &Value, b: &Value, verb: &str) -> Result<(f64, f64), String> {
    match (a, b) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Ok((a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0)))
        }
        _ => Err(format!(
            "cannot {} {} and {}",
            verb,
            a.type_name(),
            b.type_name()
        )),
    }
}

fn add(a: Value, b: Value) -> Result<Value, String> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::str(format!("{}{}", a, b))),
        _ => float_operands(&a, &b, "add").map(|(x, y)| Value::Float(x + y)),
    }
}

fn sub(a: Value, b: Value) -> Result<Value, String> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_sub(*y))),
        _ => float_operands(&a, &b, "subtract").map(|(x, y)| Value::Float(x - y)),
    }
}

fn mul(a: Value, b: Value) -> Result<Value, String> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_mul(*y))),
        _ => float_operands(&a, &b, "multiply").map(|(x, y)| Value::Float(x * y)),
    }
}

fn modulo(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err("division by zero".to_string()),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(y))),
        (a, b) => Err(format!(
            "MOD expects integers, got {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn power(a: Value, b: Value) -> Result<Value, String> {
    float_operands(&a, &b, "raise").map(|(x, y)| Value::Float(x.powf(y)))
}

fn int_div(a: Value, b: Value) -> Result<Value, String> {
    match (&a, &b) {
        (Value::Int(_), Value::Int(0)) => Err("division by zero".to_string()),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_div(*y))),
        _ => {
            let (x, y) = float_operands(&a, &b, "divide")?;
            if y == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(Value::Int((x / y).trunc() as i64))
        }
    }
}

/// Order two numbers or two strings. None means unordered (NaN).
fn compare(a: &Value, b: &Value) -> Result<Option<Ordering>, String> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Some(x.cmp(y))),
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
        _ => float_operands(a, b, "compare").map(|(x, y)| x.partial_cmp(&y)),
    }
}

fn shape(array: &Rc<RefCell<ArrayData>>, name: &str) -> Result<(usize, usize), String> {
    match array.borrow().dims.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(format!("MatMul: {} is not a 2-D array", name)),
    }
}

fn numeric_elements(array: &Rc<RefCell<ArrayData>>, name: &str) -> Result<Vec<f64>, String> {
    array
        .borrow()
        .elements
        .iter()
        .map(|v| {
            v.as_float()
                .ok_or_else(|| format!("MatMul: {} holds a {} element", name, v.type_name()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{FunctionEntry, ManualHost, SharedOutput};

    fn emit(chunk: &mut Chunk, op: Op, operands: &[u8]) {
        chunk.write_op(op);
        for byte in operands {
            chunk.write(*byte);
        }
    }

    fn konst(chunk: &mut Chunk, value: impl Into<Value>) -> u8 {
        chunk.add_constant(value.into()).unwrap()
    }

    fn vm_for(chunk: Chunk) -> (VM, SharedOutput) {
        let out = SharedOutput::new();
        let vm = VM::with_output(chunk, Box::new(out.clone()));
        (vm, out)
    }

    /// Run main to completion and return what it left on its stack.
    fn run_code(chunk: Chunk) -> Result<Vec<Value>, VmError> {
        let (mut vm, _) = vm_for(chunk);
        vm.run_to_completion(&mut ManualHost::new())?;
        Ok(vm.main.map(|ctx| ctx.stack).unwrap_or_default())
    }

    fn binary(a: Value, b: Value, op: Op) -> Result<Vec<Value>, VmError> {
        let mut chunk = Chunk::new();
        let ca = konst(&mut chunk, a);
        let cb = konst(&mut chunk, b);
        emit(&mut chunk, Op::LoadConst, &[ca]);
        emit(&mut chunk, Op::LoadConst, &[cb]);
        emit(&mut chunk, op, &[]);
        emit(&mut chunk, Op::Halt, &[]);
        run_code(chunk)
    }

    #[test]
    fn test_add() {
        let stack = binary(Value::Int(2), Value::Int(3), Op::Add).unwrap();
        assert_eq!(stack, vec![Value::Int(5)]);
    }

    #[test]
    fn test_add_promotes_to_float() {
        let stack = binary(Value::Int(1), Value::Float(0.5), Op::Add).unwrap();
        assert!(matches!(stack[0], Value::Float(f) if f == 1.5));
    }

    #[test]
    fn test_add_concatenates_strings() {
        let stack = binary(Value::str("hp: "), Value::Int(3), Op::Add).unwrap();
        assert_eq!(stack, vec![Value::str("hp: 3")]);
    }

    #[test]
    fn test_integer_division_truncates() {
        let stack = binary(Value::Int(7), Value::Int(2), Op::Div).unwrap();
        assert_eq!(stack, vec![Value::Int(3)]);
        let stack = binary(Value::Float(7.0), Value::Int(2), Op::IntDiv).unwrap();
        assert_eq!(stack, vec![Value::Int(3)]);
    }

    #[test]
    fn test_division_by_zero() {
        let err = binary(Value::Int(1), Value::Int(0), Op::Div).unwrap_err();
        assert_eq!(err.message, "division by zero");
        let err = binary(Value::Float(1.0), Value::Float(0.0), Op::Div).unwrap_err();
        assert_eq!(err.message, "division by zero");
    }

    #[test]
    fn test_ieee_division_policy() {
        let mut chunk = Chunk::new();
        let a = konst(&mut chunk, 1.0);
        let b = konst(&mut chunk, 0.0);
        emit(&mut chunk, Op::LoadConst, &[a]);
        emit(&mut chunk, Op::LoadConst, &[b]);
        emit(&mut chunk, Op::Div, &[]);
        emit(&mut chunk, Op::Halt, &[]);

        let config = RuntimeConfig {
            division: DivisionPolicy::Ieee,
            ..RuntimeConfig::default()
        };
        let mut vm = VM::with_config(chunk, config, Box::new(io::sink()));
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        let stack = vm.main.map(|ctx| ctx.stack).unwrap_or_default();
        assert!(matches!(stack[0], Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn test_mod_requires_integers() {
        assert_eq!(
            binary(Value::Int(7), Value::Int(3), Op::Mod).unwrap(),
            vec![Value::Int(1)]
        );
        let err = binary(Value::Float(7.5), Value::Int(3), Op::Mod).unwrap_err();
        assert!(err.message.contains("MOD expects integers"));
    }

    #[test]
    fn test_power_returns_float() {
        let stack = binary(Value::Int(2), Value::Int(10), Op::Power).unwrap();
        assert_eq!(stack, vec![Value::Float(1024.0)]);
    }

    #[test]
    fn test_string_comparison() {
        let stack = binary(Value::str("apple"), Value::str("banana"), Op::Less).unwrap();
        assert_eq!(stack, vec![Value::Bool(true)]);
        let err = binary(Value::str("a"), Value::Int(1), Op::Less).unwrap_err();
        assert!(err.message.contains("cannot compare"));
    }

    #[test]
    fn test_logic_returns_bool() {
        let stack = binary(Value::Int(1), Value::Int(0), Op::Xor).unwrap();
        assert_eq!(stack, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_conditional_jump() {
        // if false, skip push 1, else push 2
        let mut chunk = Chunk::new();
        let f = konst(&mut chunk, false);
        let one = konst(&mut chunk, 1i64);
        let two = konst(&mut chunk, 2i64);
        emit(&mut chunk, Op::LoadConst, &[f]);
        emit(&mut chunk, Op::JumpIfFalse, &[5, 0]);
        emit(&mut chunk, Op::LoadConst, &[one]);
        emit(&mut chunk, Op::Jump, &[2, 0]);
        emit(&mut chunk, Op::LoadConst, &[two]);
        emit(&mut chunk, Op::Halt, &[]);
        assert_eq!(run_code(chunk).unwrap(), vec![Value::Int(2)]);
    }

    #[test]
    fn test_backward_jump_loop() {
        // i = 0; while i < 3: i = i + 1
        let mut chunk = Chunk::new();
        let slot = chunk.variable_slot("i").unwrap();
        let zero = konst(&mut chunk, 0i64);
        let one = konst(&mut chunk, 1i64);
        let three = konst(&mut chunk, 3i64);
        emit(&mut chunk, Op::LoadConst, &[zero]);
        emit(&mut chunk, Op::StoreVar, &[slot]);
        let top = chunk.code.len();
        emit(&mut chunk, Op::LoadVar, &[slot]);
        emit(&mut chunk, Op::LoadConst, &[three]);
        emit(&mut chunk, Op::Less, &[]);
        emit(&mut chunk, Op::JumpIfFalse, &[10, 0]);
        emit(&mut chunk, Op::LoadVar, &[slot]);
        emit(&mut chunk, Op::LoadConst, &[one]);
        emit(&mut chunk, Op::Add, &[]);
        emit(&mut chunk, Op::StoreVar, &[slot]);
        let back = (top as i64 - (chunk.code.len() as i64 + 3)) as i16;
        emit(&mut chunk, Op::Jump, &back.to_le_bytes());
        emit(&mut chunk, Op::Halt, &[]);

        let (mut vm, _) = vm_for(chunk);
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(vm.global("I"), Some(Value::Int(3)));
    }

    /// main: n = add(2, 3); halt. add: return a + b
    fn add_program() -> Chunk {
        let mut chunk = Chunk::new();
        let slot = chunk.variable_slot("n").unwrap();
        let two = konst(&mut chunk, 2i64);
        let three = konst(&mut chunk, 3i64);
        let name = konst(&mut chunk, "add");
        emit(&mut chunk, Op::LoadConst, &[two]);
        emit(&mut chunk, Op::LoadConst, &[three]);
        emit(&mut chunk, Op::CallUser, &[name, 2]);
        emit(&mut chunk, Op::StoreVar, &[slot]);
        emit(&mut chunk, Op::Halt, &[]);
        let offset = chunk.code.len();
        emit(&mut chunk, Op::LoadLocal, &[0]);
        emit(&mut chunk, Op::LoadLocal, &[1]);
        emit(&mut chunk, Op::Add, &[]);
        emit(&mut chunk, Op::ReturnVal, &[]);
        emit(&mut chunk, Op::Return, &[]);
        chunk
            .functions
            .insert("add".to_string(), FunctionEntry { offset, arity: 2 });
        chunk
    }

    #[test]
    fn test_user_call_returns_value() {
        let (mut vm, _) = vm_for(add_program());
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(vm.global("n"), Some(Value::Int(5)));
        assert_eq!(vm.main.map(|ctx| ctx.stack.len()), Some(0));
    }

    #[test]
    fn test_invoke_sub_from_host() {
        let (mut vm, _) = vm_for(add_program());
        let value = vm
            .invoke_sub("ADD", &[Value::Int(40), Value::Int(2)])
            .unwrap();
        assert_eq!(value, Value::Int(42));

        let err = vm.invoke_sub("add", &[Value::Int(1)]).unwrap_err();
        assert_eq!(err.message, "add() expects 2 argument(s), got 1");
    }

    #[test]
    fn test_unknown_user_function() {
        let mut chunk = Chunk::new();
        let name = konst(&mut chunk, "missing");
        emit(&mut chunk, Op::CallUser, &[name, 0]);
        emit(&mut chunk, Op::Halt, &[]);
        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.message, "unknown user function: missing");
    }

    #[test]
    fn test_recursion_hits_frame_limit() {
        let mut chunk = Chunk::new();
        let name = konst(&mut chunk, "forever");
        emit(&mut chunk, Op::CallUser, &[name, 0]);
        emit(&mut chunk, Op::Halt, &[]);
        let offset = chunk.code.len();
        emit(&mut chunk, Op::CallUser, &[name, 0]);
        emit(&mut chunk, Op::Return, &[]);
        chunk
            .functions
            .insert("forever".to_string(), FunctionEntry { offset, arity: 0 });

        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.message, "call stack overflow in forever");
        assert_eq!(err.trace.len(), 257);
        assert_eq!(err.trace[0], "<main>");
    }

    fn foreign_call_program(name: &str, args: &[i64]) -> Chunk {
        let mut chunk = Chunk::new();
        for arg in args {
            let c = konst(&mut chunk, *arg);
            emit(&mut chunk, Op::LoadConst, &[c]);
        }
        let c = konst(&mut chunk, name);
        emit(&mut chunk, Op::CallForeign, &[c, args.len() as u8]);
        emit(&mut chunk, Op::Halt, &[]);
        chunk
    }

    #[test]
    fn test_unknown_foreign_is_fatal() {
        let err = run_code(foreign_call_program("DrawCube", &[1])).unwrap_err();
        assert_eq!(err.message, "unknown foreign function: DrawCube");
    }

    #[test]
    fn test_unknown_foreign_nil_policy() {
        let config = RuntimeConfig {
            unknown_foreign: ForeignPolicy::Nil,
            ..RuntimeConfig::default()
        };
        let mut vm = VM::with_config(
            foreign_call_program("drawcube", &[1, 2]),
            config,
            Box::new(io::sink()),
        );
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(vm.main.map(|ctx| ctx.stack), Some(vec![Value::Nil]));
    }

    #[test]
    fn test_foreign_receives_args_in_order() {
        let (mut vm, _) = vm_for(foreign_call_program("sub2", &[10, 4]));
        vm.register_foreign("Sub2", |args| match args {
            [Value::Int(a), Value::Int(b)] => Ok(Value::Int(a - b)),
            _ => Err("bad args".to_string()),
        });
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(vm.main.map(|ctx| ctx.stack), Some(vec![Value::Int(6)]));
    }

    #[test]
    fn test_foreign_error_is_prefixed() {
        let (mut vm, _) = vm_for(foreign_call_program("fail", &[]));
        vm.register_foreign("fail", |_| Err("no window".to_string()));
        let err = vm.run_to_completion(&mut ManualHost::new()).unwrap_err();
        assert_eq!(err.message, "fail: no window");
    }

    #[test]
    fn test_load_global_falls_back_to_foreign() {
        let mut chunk = Chunk::new();
        let name = konst(&mut chunk, "screenwidth");
        emit(&mut chunk, Op::LoadGlobal, &[name]);
        emit(&mut chunk, Op::Halt, &[]);

        let (mut vm, _) = vm_for(chunk.clone());
        vm.register_foreign("screenwidth", |_| Ok(Value::Int(800)));
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(vm.main.map(|ctx| ctx.stack), Some(vec![Value::Int(800)]));

        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.message, "undefined global variable: screenwidth");
    }

    #[test]
    fn test_print_writes_output() {
        let mut chunk = Chunk::new();
        let c = konst(&mut chunk, 2.0);
        emit(&mut chunk, Op::LoadConst, &[c]);
        emit(&mut chunk, Op::Print, &[]);
        emit(&mut chunk, Op::Halt, &[]);
        let (mut vm, out) = vm_for(chunk);
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(out.contents(), "2.0\n");
    }

    /// DIM a(10): a(3) = 7; push a(index)
    fn array_program(index: i64) -> Chunk {
        let mut chunk = Chunk::new();
        let slot = chunk.variable_slot("a").unwrap();
        chunk.var_dims.insert("a".to_string(), vec![10]);
        let ten = konst(&mut chunk, 10i64);
        let three = konst(&mut chunk, 3i64);
        let seven = konst(&mut chunk, 7i64);
        let read = konst(&mut chunk, index);
        emit(&mut chunk, Op::CreateArray, &[1, ten, slot]);
        emit(&mut chunk, Op::LoadConst, &[seven]);
        emit(&mut chunk, Op::LoadConst, &[three]);
        emit(&mut chunk, Op::StoreArray, &[slot]);
        emit(&mut chunk, Op::LoadConst, &[read]);
        emit(&mut chunk, Op::LoadArray, &[slot]);
        emit(&mut chunk, Op::Halt, &[]);
        chunk
    }

    #[test]
    fn test_array_store_and_load() {
        assert_eq!(run_code(array_program(3)).unwrap(), vec![Value::Int(7)]);
        assert_eq!(run_code(array_program(4)).unwrap(), vec![Value::Int(0)]);
    }

    #[test]
    fn test_array_bounds() {
        let err = run_code(array_program(20)).unwrap_err();
        assert_eq!(err.message, "array index out of bounds: a(20)");
    }

    #[test]
    fn test_create_array_too_large_is_error() {
        let mut chunk = Chunk::new();
        let slot = chunk.variable_slot("grid").unwrap();
        let huge = konst(&mut chunk, 10_000_000i64);
        emit(&mut chunk, Op::CreateArray, &[3, huge, huge, huge, slot]);
        emit(&mut chunk, Op::Halt, &[]);
        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.message, "array too large: grid");
    }

    #[test]
    fn test_error_carries_line() {
        let mut chunk = array_program(20);
        chunk.lines.add(0, 1);
        // LoadArray sits after CreateArray(4) + 3 loads/stores (6) + LoadConst(2)
        chunk.lines.add(12, 4);
        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.line, Some(4));
        assert_eq!(err.to_string(), "runtime error: array index out of bounds: a(20) (line 4)");
    }

    #[test]
    fn test_matmul() {
        let mut chunk = Chunk::new();
        let mut names = Vec::new();
        for name in ["a", "b", "c"] {
            chunk.variable_slot(name).unwrap();
            names.push(konst(&mut chunk, name));
        }
        emit(&mut chunk, Op::MatMul, &[names[2], names[0], names[1]]);
        emit(&mut chunk, Op::Halt, &[]);

        let (mut vm, _) = vm_for(chunk);
        let matrix = |values: [i64; 4]| {
            Value::array(ArrayData {
                dims: vec![2, 2],
                elements: values.iter().map(|v| Value::Int(*v)).collect(),
            })
        };
        vm.set_global("a", matrix([1, 2, 3, 4]));
        vm.set_global("b", matrix([5, 6, 7, 8]));
        vm.set_global("c", matrix([0, 0, 0, 0]));
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(
            vm.global("c").unwrap().to_string(),
            "[19.0, 22.0, 43.0, 50.0]"
        );

        vm = vm_for(vm.chunk().clone()).0;
        vm.set_global("a", matrix([1, 2, 3, 4]));
        vm.set_global("b", Value::array(ArrayData::new(vec![3], Value::Int(0)).unwrap()));
        vm.set_global("c", matrix([0, 0, 0, 0]));
        let err = vm.run_to_completion(&mut ManualHost::new()).unwrap_err();
        assert_eq!(err.message, "MatMul: b is not a 2-D array");
    }

    #[test]
    fn test_entity_properties() {
        let mut chunk = Chunk::new();
        let player = konst(&mut chunk, "player");
        let x = konst(&mut chunk, "x");
        let hp = konst(&mut chunk, "hp");
        let five = konst(&mut chunk, 5i64);
        emit(&mut chunk, Op::LoadConst, &[five]);
        emit(&mut chunk, Op::StoreEntityProp, &[player, x]);
        emit(&mut chunk, Op::LoadEntityProp, &[player, x]);
        emit(&mut chunk, Op::LoadEntityProp, &[player, hp]);
        emit(&mut chunk, Op::Halt, &[]);

        let (mut vm, _) = vm_for(chunk.clone());
        vm.set_global("Player", Value::dict(DictData::new()));
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        assert_eq!(
            vm.main.map(|ctx| ctx.stack),
            Some(vec![Value::Int(5), Value::Nil])
        );

        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.message, "unknown entity: player");
    }

    /// main: start worker; halt. worker: yield; done = 1; return
    fn coroutine_program() -> Chunk {
        let mut chunk = Chunk::new();
        let slot = chunk.variable_slot("done").unwrap();
        let name = konst(&mut chunk, "worker");
        let one = konst(&mut chunk, 1i64);
        emit(&mut chunk, Op::StartCoroutine, &[5, 0, name]);
        emit(&mut chunk, Op::Halt, &[]);
        assert_eq!(chunk.code.len(), 5);
        emit(&mut chunk, Op::Yield, &[]);
        emit(&mut chunk, Op::LoadConst, &[one]);
        emit(&mut chunk, Op::StoreVar, &[slot]);
        emit(&mut chunk, Op::Return, &[]);
        chunk
    }

    #[test]
    fn test_coroutine_resumes_next_pass() {
        let (mut vm, _) = vm_for(coroutine_program());
        let mut host = ManualHost::new();

        assert_eq!(vm.pass(&mut host).unwrap(), PassOutcome::Running);
        assert_eq!(vm.global("done"), Some(Value::Nil));
        assert_eq!(vm.coroutine_state(0), Some(CoroutineState::SuspendedYield));

        assert_eq!(vm.pass(&mut host).unwrap(), PassOutcome::Finished);
        assert_eq!(vm.global("done"), Some(Value::Int(1)));
        assert_eq!(vm.coroutine_count(), 0);
    }

    #[test]
    fn test_wait_seconds_uses_host_clock() {
        let mut chunk = Chunk::new();
        let slot = chunk.variable_slot("woke").unwrap();
        let half = konst(&mut chunk, 0.5);
        let t = konst(&mut chunk, true);
        emit(&mut chunk, Op::LoadConst, &[half]);
        emit(&mut chunk, Op::WaitSeconds, &[]);
        emit(&mut chunk, Op::LoadConst, &[t]);
        emit(&mut chunk, Op::StoreVar, &[slot]);
        emit(&mut chunk, Op::Halt, &[]);

        let (mut vm, _) = vm_for(chunk);
        let mut host = ManualHost::new();
        vm.pass(&mut host).unwrap();
        assert_eq!(vm.main_state(), CoroutineState::SuspendedTimer(0.5));

        host.advance(0.25);
        assert_eq!(vm.pass(&mut host).unwrap(), PassOutcome::Running);
        assert_eq!(vm.global("woke"), Some(Value::Nil));

        host.advance(0.25);
        assert_eq!(vm.pass(&mut host).unwrap(), PassOutcome::Finished);
        assert_eq!(vm.global("woke"), Some(Value::Bool(true)));
    }

    /// main: on keydown("ESCAPE") <handler>; loop { yield }
    fn event_program(handler: impl FnOnce(&mut Chunk)) -> Chunk {
        let mut chunk = Chunk::new();
        let kind = konst(&mut chunk, "keydown");
        let key = konst(&mut chunk, "ESCAPE");
        emit(&mut chunk, Op::RegisterEvent, &[kind, key, 0, 0]);
        emit(&mut chunk, Op::Yield, &[]);
        emit(&mut chunk, Op::Jump, &(-4i16).to_le_bytes());
        let entry = chunk.code.len() as u16;
        handler(&mut chunk);
        emit(&mut chunk, Op::Return, &[]);
        chunk.patch_u16(3, entry);
        chunk
    }

    #[test]
    fn test_event_handler_runs_once_per_pass() {
        let program = event_program(|chunk| {
            let slot = chunk.variable_slot("count").unwrap();
            let one = konst(chunk, 1i64);
            emit(chunk, Op::LoadVar, &[slot]);
            emit(chunk, Op::LoadConst, &[one]);
            emit(chunk, Op::Add, &[]);
            emit(chunk, Op::StoreVar, &[slot]);
        });
        let (mut vm, _) = vm_for(program);
        vm.set_global("count", Value::Int(0));
        let mut host = ManualHost::new();

        vm.pass(&mut host).unwrap();
        assert_eq!(vm.global("count"), Some(Value::Int(0)));

        host.press("escape");
        vm.pass(&mut host).unwrap();
        assert_eq!(vm.global("count"), Some(Value::Int(1)));
        vm.pass(&mut host).unwrap();
        assert_eq!(vm.global("count"), Some(Value::Int(2)));

        host.release("escape");
        vm.pass(&mut host).unwrap();
        assert_eq!(vm.global("count"), Some(Value::Int(2)));
    }

    #[test]
    fn test_handler_cannot_yield() {
        let (mut vm, _) = vm_for(event_program(|chunk| emit(chunk, Op::Yield, &[])));
        let mut host = ManualHost::new();
        host.press("ESCAPE");
        let err = vm.pass(&mut host).unwrap_err();
        assert_eq!(err.message, "cannot suspend inside an event handler");
        assert_eq!(err.trace, vec!["on keydown(\"ESCAPE\")".to_string()]);

        let again = vm.pass(&mut host).unwrap_err();
        assert_eq!(again.message, "vm already failed");
        assert_eq!(vm.stack_trace().len(), 1);
    }

    #[test]
    fn test_quit_drops_coroutines() {
        let mut chunk = coroutine_program();
        // Replace main's Halt with Quit
        chunk.code[4] = Op::Quit as u8;
        let (mut vm, _) = vm_for(chunk);
        assert_eq!(
            vm.pass(&mut ManualHost::new()).unwrap(),
            PassOutcome::Finished
        );
        assert_eq!(vm.coroutine_count(), 0);
        assert!(vm.is_finished());
    }

    #[test]
    fn test_max_passes() {
        let mut chunk = Chunk::new();
        emit(&mut chunk, Op::Yield, &[]);
        emit(&mut chunk, Op::Jump, &[0xFC, 0xFF]);
        let config = RuntimeConfig {
            max_passes: Some(3),
            ..RuntimeConfig::default()
        };
        let mut vm = VM::with_config(chunk, config, Box::new(io::sink()));
        let err = vm.run_to_completion(&mut ManualHost::new()).unwrap_err();
        assert!(err.message.contains("after 3 passes"));
        assert_eq!(vm.pass_count(), 3);
    }

    #[test]
    fn test_invalid_opcode() {
        let mut chunk = Chunk::new();
        chunk.write(250);
        let err = run_code(chunk).unwrap_err();
        assert_eq!(err.message, "invalid opcode: 250");
    }

    #[test]
    fn test_builtin_dispatch() {
        let mut chunk = Chunk::new();
        let s = konst(&mut chunk, "hello");
        let n = konst(&mut chunk, 2i64);
        emit(&mut chunk, Op::LoadConst, &[s]);
        emit(&mut chunk, Op::LoadConst, &[n]);
        emit(&mut chunk, Op::Left, &[]);
        emit(&mut chunk, Op::Halt, &[]);
        assert_eq!(run_code(chunk).unwrap(), vec![Value::str("he")]);
    }
}
