use std::collections::{HashMap, HashSet};

use crate::compiler::ast::*;
use crate::compiler::error::CompileError;
use crate::compiler::resolve::{self, CallScope, HOST_NAMESPACES, Resolution};
use crate::vm::{ArrayData, Chunk, EventKind, FunctionEntry, Op, Value};

type Result<T> = std::result::Result<T, CompileError>;

/// What a placeholder operand is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FixupKind {
    /// rel16 to the end of the function and handler bodies
    Jump,
    /// abs16 entry of the named sub
    Coroutine(String),
    /// abs16 entry of the n-th handler body
    Event(usize),
}

#[derive(Debug)]
struct Fixup {
    position: usize,
    kind: FixupKind,
    line: Option<usize>,
}

/// Pending jumps out of one loop.
#[derive(Debug, Default)]
struct LoopPatches {
    exits: Vec<usize>,
    continues: Vec<usize>,
}

/// Code generator that compiles an AST into a single [`Chunk`].
///
/// Compilation runs in two passes. The first collects Function/Sub, TYPE and
/// ENTITY declarations and reserves slots for assigned variables. The second
/// emits entity initializers, main code, every body, and finally resolves the
/// placeholders recorded along the way.
pub struct Codegen<'p> {
    chunk: Chunk,
    /// Lowercase, module-qualified names of every Function/Sub
    user_functions: HashSet<String>,
    functions: Vec<(String, &'p FunctionDecl)>,
    /// `type.field` -> folded constant value
    type_consts: HashMap<String, Value>,
    /// `type.field` -> constant pool index, filled on first use
    const_groups: HashMap<String, u8>,
    /// CONST name -> value
    named_consts: HashMap<String, Value>,
    entities: Vec<(Option<usize>, &'p EntityDecl)>,
    entity_names: HashSet<String>,
    /// Parameters of the body being compiled -> local index
    params: HashMap<String, u8>,
    loops: Vec<LoopPatches>,
    fixups: Vec<Fixup>,
    /// Handler bodies in registration order
    events: Vec<&'p Block>,
    event_entries: Vec<usize>,
    select_count: usize,
    /// Line of the statement being compiled
    line: Option<usize>,
}

impl Default for Codegen<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'p> Codegen<'p> {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            user_functions: HashSet::new(),
            functions: Vec::new(),
            type_consts: HashMap::new(),
            const_groups: HashMap::new(),
            named_consts: HashMap::new(),
            entities: Vec::new(),
            entity_names: HashSet::new(),
            params: HashMap::new(),
            loops: Vec::new(),
            fixups: Vec::new(),
            events: Vec::new(),
            event_entries: Vec::new(),
            select_count: 0,
            line: None,
        }
    }

    /// Compile a whole program. On failure no chunk is produced.
    pub fn compile(mut self, program: &'p Program) -> Result<Chunk> {
        let main = self.collect(&program.statements)?;

        self.emit_entities()?;
        for stmt in main {
            self.statement(stmt)?;
        }

        // Main falls through to here; skip over every body
        self.line = None;
        let skip = self.emit_jump(Op::Jump);
        self.fixups.push(Fixup {
            position: skip,
            kind: FixupKind::Jump,
            line: None,
        });

        let functions = std::mem::take(&mut self.functions);
        for (name, decl) in &functions {
            self.function_body(name, *decl)?;
        }

        // Handler bodies may register further handlers
        let mut index = 0;
        while index < self.events.len() {
            let body = self.events[index];
            self.event_body(body)?;
            index += 1;
        }

        self.resolve_fixups()?;
        self.emit(Op::Halt);

        Ok(self.chunk)
    }

    // ========================================
    // Pass 1: declaration collection
    // ========================================

    fn collect(&mut self, statements: &'p [Stmt]) -> Result<Vec<&'p Stmt>> {
        let mut main = Vec::new();

        for stmt in statements {
            self.line = stmt.line;
            match &stmt.kind {
                StmtKind::Function(decl) | StmtKind::Sub(decl) => {
                    self.declare_function(decl.qualified_name(), decl)?;
                }
                StmtKind::Module { name, body } => {
                    for inner in body {
                        self.line = inner.line.or(stmt.line);
                        match &inner.kind {
                            StmtKind::Function(decl) | StmtKind::Sub(decl) => {
                                let qualified =
                                    format!("{}.{}", name, decl.name).to_lowercase();
                                self.declare_function(qualified, decl)?;
                            }
                            _ => {
                                return Err(
                                    self.error("only FUNCTION and SUB are allowed inside MODULE")
                                );
                            }
                        }
                    }
                }
                StmtKind::Type(decl) => self.declare_type(decl)?,
                StmtKind::Entity(decl) => {
                    self.entity_names.insert(decl.name.to_lowercase());
                    self.entities.push((stmt.line, decl));
                }
                // Entity initializers run before main and may name these
                StmtKind::Const { decls } => self.declare_consts(decls)?,
                StmtKind::Enum { name, members } => self.enum_statement(name, members)?,
                _ => main.push(stmt),
            }
        }

        // Reserve slots up front so a read that precedes the first assignment
        // in source order (a loop condition, a function body) still finds it
        for stmt in &main {
            self.reserve_slots(stmt, &[])?;
        }
        let functions = self.functions.clone();
        for (_, decl) in functions {
            for stmt in &decl.body {
                self.reserve_slots(stmt, &decl.params)?;
            }
        }

        Ok(main)
    }

    fn declare_function(&mut self, qualified: String, decl: &'p FunctionDecl) -> Result<()> {
        if !self.user_functions.insert(qualified.clone()) {
            return Err(self.error(format!("duplicate function: {}", decl.name)));
        }
        self.functions.push((qualified, decl));
        Ok(())
    }

    fn declare_type(&mut self, decl: &TypeDecl) -> Result<()> {
        for field in &decl.fields {
            if let Some(expr) = &field.const_value {
                let value = self.fold_const(expr, &field.name)?;
                let key = format!("{}.{}", decl.name, field.name).to_lowercase();
                self.type_consts.insert(key, value);
            }
        }
        Ok(())
    }

    fn declare_consts(&mut self, decls: &[ConstDecl]) -> Result<()> {
        for decl in decls {
            let value = self.fold_const(&decl.value, &decl.name)?;
            self.named_consts.insert(decl.name.to_lowercase(), value);
        }
        Ok(())
    }

    fn reserve_slots(&mut self, stmt: &Stmt, params: &[String]) -> Result<()> {
        self.line = stmt.line.or(self.line);
        let is_param = |name: &str| params.iter().any(|p| p.eq_ignore_ascii_case(name));

        match &stmt.kind {
            StmtKind::Assign {
                target, indices, ..
            } if indices.is_empty() && !is_param(target) => {
                self.slot(target)?;
            }
            StmtKind::CompoundAssign { target, .. } if !is_param(target) => {
                self.slot(target)?;
            }
            StmtKind::Dim { vars } => {
                for var in vars {
                    self.slot(&var.name)?;
                    // Record ranks early so array reads compiled before the DIM resolve
                    if !var.dimensions.is_empty()
                        && let Ok(dims) = self.dimensions(var)
                    {
                        self.chunk.var_dims.insert(var.name.to_lowercase(), dims);
                    }
                }
            }
            StmtKind::For { variable, body, .. } => {
                if !is_param(variable) {
                    self.slot(variable)?;
                }
                for inner in body {
                    self.reserve_slots(inner, params)?;
                }
            }
            StmtKind::If {
                then_block,
                else_ifs,
                else_block,
                ..
            } => {
                for inner in then_block
                    .iter()
                    .chain(else_ifs.iter().flat_map(|e| e.body.iter()))
                    .chain(else_block.iter().flatten())
                {
                    self.reserve_slots(inner, params)?;
                }
            }
            StmtKind::SelectCase {
                cases, else_block, ..
            } => {
                for inner in cases
                    .iter()
                    .flat_map(|c| c.body.iter())
                    .chain(else_block.iter().flatten())
                {
                    self.reserve_slots(inner, params)?;
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::Repeat { body, .. }
            | StmtKind::OnEvent { body, .. } => {
                for inner in body {
                    self.reserve_slots(inner, params)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ========================================
    // Pass 2: emission
    // ========================================

    /// Entity dicts are built and stored as globals before main runs.
    fn emit_entities(&mut self) -> Result<()> {
        let entities = std::mem::take(&mut self.entities);
        for (line, decl) in entities {
            self.mark_line(line);
            self.emit_foreign_call("createdict", 0)?;
            for property in &decl.properties {
                self.dict_insert(&property.name.to_lowercase(), &property.value)?;
            }
            let name = self.name_constant(&decl.name.to_lowercase())?;
            self.emit_with(Op::StoreGlobal, &[name]);
        }
        Ok(())
    }

    fn function_body(&mut self, name: &str, decl: &'p FunctionDecl) -> Result<()> {
        let entry = self.chunk.code.len();
        self.chunk.functions.insert(
            name.to_string(),
            FunctionEntry {
                offset: entry,
                arity: decl.params.len(),
            },
        );

        self.params.clear();
        for (index, param) in decl.params.iter().enumerate() {
            let index = u8::try_from(index)
                .map_err(|_| self.error(format!("too many parameters in {}", decl.name)))?;
            self.params.insert(param.to_lowercase(), index);
        }

        for stmt in &decl.body {
            self.statement(stmt)?;
        }
        self.emit(Op::Return);
        self.params.clear();
        Ok(())
    }

    fn event_body(&mut self, body: &'p Block) -> Result<()> {
        self.event_entries.push(self.chunk.code.len());
        self.params.clear();
        for stmt in body {
            self.statement(stmt)?;
        }
        self.emit(Op::Return);
        Ok(())
    }

    fn resolve_fixups(&mut self) -> Result<()> {
        let end = self.chunk.code.len();
        let fixups = std::mem::take(&mut self.fixups);

        for fixup in fixups {
            self.line = fixup.line;
            match &fixup.kind {
                FixupKind::Jump => self.patch_jump_to(fixup.position, end)?,
                FixupKind::Coroutine(name) => {
                    let entry = self
                        .chunk
                        .function(name)
                        .ok_or_else(|| self.error(format!("unknown sub for StartCoroutine: {}", name)))?;
                    if entry.arity != 0 {
                        return Err(self.error(format!(
                            "StartCoroutine target {} must take no parameters",
                            name
                        )));
                    }
                    self.patch_abs(fixup.position, entry.offset)?;
                }
                FixupKind::Event(index) => {
                    let entry = self
                        .event_entries
                        .get(*index)
                        .copied()
                        .ok_or_else(|| self.error("event handler body was not compiled"))?;
                    self.patch_abs(fixup.position, entry)?;
                }
            }
        }
        Ok(())
    }

    // ========================================
    // Statements
    // ========================================

    fn statement(&mut self, stmt: &'p Stmt) -> Result<()> {
        let outer = self.line;
        if stmt.line.is_some() {
            self.line = stmt.line;
        }
        self.mark_line(self.line);

        match &stmt.kind {
            StmtKind::Expr { expr } => self.expression_statement(expr)?,
            StmtKind::Assign {
                target,
                indices,
                value,
            } => self.assign(target, indices, value)?,
            StmtKind::MemberAssign {
                object,
                member,
                value,
            } => self.member_assign(object, member, value)?,
            StmtKind::CompoundAssign { target, op, value } => {
                self.compound_assign(target, op, value)?
            }
            StmtKind::If {
                condition,
                then_block,
                else_ifs,
                else_block,
            } => self.if_statement(condition, then_block, else_ifs, else_block.as_ref())?,
            StmtKind::For {
                variable,
                start,
                end,
                step,
                body,
            } => self.for_statement(variable, start, end, step.as_ref(), body)?,
            StmtKind::While { condition, body } => self.while_statement(condition, body)?,
            StmtKind::Repeat { body, condition } => self.repeat_statement(body, condition)?,
            StmtKind::SelectCase {
                subject,
                cases,
                else_block,
            } => self.select_statement(subject, cases, else_block.as_ref())?,
            StmtKind::Function(_)
            | StmtKind::Sub(_)
            | StmtKind::Module { .. }
            | StmtKind::Type(_)
            | StmtKind::Entity(_) => {
                return Err(self.error("declarations are only allowed at top level"));
            }
            StmtKind::Const { decls } => self.declare_consts(decls)?,
            StmtKind::Enum { name, members } => self.enum_statement(name, members)?,
            StmtKind::Dim { vars } => {
                for var in vars {
                    self.dim(var)?;
                }
            }
            StmtKind::OnEvent { event, key, body } => self.on_event(event, key, body)?,
            StmtKind::StartCoroutine { sub_name } => {
                self.emit(Op::StartCoroutine);
                let position = self.chunk.code.len();
                self.chunk.write_u16(0);
                let name = self.name_constant(sub_name)?;
                self.chunk.write(name);
                self.fixups.push(Fixup {
                    position,
                    kind: FixupKind::Coroutine(sub_name.to_lowercase()),
                    line: self.line,
                });
            }
            StmtKind::Yield => self.emit(Op::Yield),
            StmtKind::WaitSeconds { seconds } => {
                self.expression(seconds)?;
                self.emit(Op::WaitSeconds);
            }
            StmtKind::ExitLoop { kind } => {
                if self.loops.is_empty() {
                    return Err(self.error(format!("EXIT {} outside loop", kind)));
                }
                let position = self.emit_jump(Op::Jump);
                if let Some(patches) = self.loops.last_mut() {
                    patches.exits.push(position);
                }
            }
            StmtKind::ContinueLoop { kind } => {
                if self.loops.is_empty() {
                    return Err(self.error(format!("CONTINUE {} outside loop", kind)));
                }
                let position = self.emit_jump(Op::Jump);
                if let Some(patches) = self.loops.last_mut() {
                    patches.continues.push(position);
                }
            }
            StmtKind::Return { value } => match value {
                Some(value) => {
                    self.expression(value)?;
                    self.emit(Op::ReturnVal);
                }
                None => self.emit(Op::Return),
            },
            StmtKind::Assert { condition, message } => {
                self.expression(condition)?;
                match message {
                    Some(message) => self.expression(message)?,
                    None => {
                        let text = self.name_constant("assertion failed")?;
                        self.emit_with(Op::LoadString, &[text]);
                    }
                }
                self.emit_foreign_call("assert", 2)?;
                self.emit(Op::Pop);
            }
        }

        if outer.is_some() {
            self.line = outer;
            self.mark_line(outer);
        }
        Ok(())
    }

    /// A call used as a statement must not leave its result behind.
    fn expression_statement(&mut self, expr: &Expr) -> Result<()> {
        if let Expr::Call { name, args } = expr {
            if self.call(name, args)? {
                self.emit(Op::Pop);
            }
            return Ok(());
        }
        self.expression(expr)?;
        self.emit(Op::Pop);
        Ok(())
    }

    fn assign(&mut self, target: &str, indices: &[Expr], value: &Expr) -> Result<()> {
        if indices.is_empty() {
            self.expression(value)?;
            return self.store_variable(target);
        }

        let lower = target.to_lowercase();
        let rank = self
            .chunk
            .var_dims
            .get(&lower)
            .map(|dims| dims.len())
            .ok_or_else(|| self.error(format!("array variable not declared: {}", target)))?;
        if rank != indices.len() {
            return Err(self.error(format!(
                "{} has {} dimension(s), got {} index(es)",
                target,
                rank,
                indices.len()
            )));
        }

        // StoreArray pops the indices first, then the value
        self.expression(value)?;
        for index in indices {
            self.expression(index)?;
        }
        let slot = self.slot(target)?;
        self.emit_with(Op::StoreArray, &[slot]);
        Ok(())
    }

    fn member_assign(&mut self, object: &str, member: &str, value: &Expr) -> Result<()> {
        let entity = object.to_lowercase();
        if !self.entity_names.contains(&entity) {
            return Err(self.error(format!(
                "cannot assign to {}.{}: {} is not an entity",
                object, member, object
            )));
        }
        self.expression(value)?;
        let entity = self.name_constant(&entity)?;
        let prop = self.name_constant(&member.to_lowercase())?;
        self.emit_with(Op::StoreEntityProp, &[entity, prop]);
        Ok(())
    }

    fn compound_assign(&mut self, target: &str, op: &str, value: &Expr) -> Result<()> {
        let opcode = match op.trim_end_matches('=') {
            "+" => Op::Add,
            "-" => Op::Sub,
            "*" => Op::Mul,
            "/" => Op::Div,
            _ => return Err(self.error(format!("unsupported compound assign op: {}", op))),
        };
        self.load_variable(target)?;
        self.expression(value)?;
        self.emit(opcode);
        self.store_variable(target)
    }

    fn if_statement(
        &mut self,
        condition: &Expr,
        then_block: &'p Block,
        else_ifs: &'p [ElseIf],
        else_block: Option<&'p Block>,
    ) -> Result<()> {
        let branches =
            std::iter::once((condition, then_block)).chain(else_ifs.iter().map(|e| (&e.condition, &e.body)));
        let branch_count = 1 + else_ifs.len();
        let mut end_jumps = Vec::new();

        for (index, (condition, body)) in branches.enumerate() {
            self.expression(condition)?;
            let next = self.emit_jump(Op::JumpIfFalse);
            self.block(body)?;
            if index + 1 < branch_count || else_block.is_some() {
                end_jumps.push(self.emit_jump(Op::Jump));
            }
            self.patch_jump(next)?;
        }

        if let Some(body) = else_block {
            self.block(body)?;
        }
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn for_statement(
        &mut self,
        variable: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &'p Block,
    ) -> Result<()> {
        self.expression(start)?;
        self.store_variable(variable)?;

        let loop_start = self.chunk.code.len();
        self.load_variable(variable)?;
        self.expression(end)?;
        // A constant negative step counts down
        let descending = step
            .and_then(|s| self.fold_const(s, variable).ok())
            .and_then(|v| v.as_float())
            .is_some_and(|v| v < 0.0);
        self.emit(if descending { Op::Less } else { Op::Greater });
        let exit = self.emit_jump(Op::JumpIfTrue);

        self.loops.push(LoopPatches::default());
        self.block(body)?;
        let patches = self.loops.pop().unwrap_or_default();

        let continue_target = self.chunk.code.len();
        for position in patches.continues {
            self.patch_jump_to(position, continue_target)?;
        }
        self.load_variable(variable)?;
        match step {
            Some(step) => self.expression(step)?,
            None => self.emit_constant(Value::Int(1))?,
        }
        self.emit(Op::Add);
        self.store_variable(variable)?;
        self.emit_jump_back(Op::Jump, loop_start)?;

        self.patch_jump(exit)?;
        for position in patches.exits {
            self.patch_jump(position)?;
        }
        Ok(())
    }

    fn while_statement(&mut self, condition: &Expr, body: &'p Block) -> Result<()> {
        let loop_start = self.chunk.code.len();
        self.expression(condition)?;
        let exit = self.emit_jump(Op::JumpIfFalse);

        self.loops.push(LoopPatches::default());
        self.block(body)?;
        let patches = self.loops.pop().unwrap_or_default();

        for position in patches.continues {
            self.patch_jump_to(position, loop_start)?;
        }
        self.emit_jump_back(Op::Jump, loop_start)?;

        self.patch_jump(exit)?;
        for position in patches.exits {
            self.patch_jump(position)?;
        }
        Ok(())
    }

    fn repeat_statement(&mut self, body: &'p Block, condition: &Expr) -> Result<()> {
        let loop_start = self.chunk.code.len();

        self.loops.push(LoopPatches::default());
        self.block(body)?;
        let patches = self.loops.pop().unwrap_or_default();

        let check = self.chunk.code.len();
        for position in patches.continues {
            self.patch_jump_to(position, check)?;
        }
        self.expression(condition)?;
        self.emit_jump_back(Op::JumpIfFalse, loop_start)?;

        for position in patches.exits {
            self.patch_jump(position)?;
        }
        Ok(())
    }

    fn select_statement(
        &mut self,
        subject: &Expr,
        cases: &'p [CaseClause],
        else_block: Option<&'p Block>,
    ) -> Result<()> {
        let hidden = format!("__select{}", self.select_count);
        self.select_count += 1;
        let slot = self.slot(&hidden)?;
        self.expression(subject)?;
        self.emit_with(Op::StoreVar, &[slot]);

        let mut end_jumps = Vec::new();
        for case in cases {
            if case.values.is_empty() {
                return Err(self.error("CASE needs at least one value"));
            }
            for (index, value) in case.values.iter().enumerate() {
                self.emit_with(Op::LoadVar, &[slot]);
                self.expression(value)?;
                self.emit(Op::Equal);
                if index > 0 {
                    self.emit(Op::Or);
                }
            }
            let next = self.emit_jump(Op::JumpIfFalse);
            self.block(&case.body)?;
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(next)?;
        }

        if let Some(body) = else_block {
            self.block(body)?;
        }
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn enum_statement(&mut self, name: &str, members: &[EnumMember]) -> Result<()> {
        let prefix = name.to_lowercase();
        let mut next = 0i64;

        for member in members {
            let value = match &member.value {
                Some(expr) => match self.fold_const(expr, &member.name)? {
                    Value::Int(n) => n,
                    other => {
                        return Err(self.error(format!(
                            "enum value for {} must be an integer, got {}",
                            member.name,
                            other.type_name()
                        )));
                    }
                },
                None => next,
            };
            let lower = member.name.to_lowercase();
            self.chunk.enums.insert(format!("{}.{}", prefix, lower), value);
            self.chunk.enums.insert(lower, value);
            next = value.wrapping_add(1);
        }
        Ok(())
    }

    fn dim(&mut self, var: &DimVar) -> Result<()> {
        let slot = self.slot(&var.name)?;

        if var.dimensions.is_empty() {
            let var_type = var.var_type.as_deref().unwrap_or("").to_lowercase();
            match var_type.as_str() {
                "string" | "str" => {
                    let empty = self.name_constant("")?;
                    self.emit_with(Op::LoadString, &[empty]);
                }
                "float" | "single" | "double" => self.emit_constant(Value::Float(0.0))?,
                "boolean" | "bool" => self.emit_constant(Value::Bool(false))?,
                _ => self.emit_constant(Value::Int(0))?,
            }
            self.emit_with(Op::StoreVar, &[slot]);
            return Ok(());
        }

        let dims = self.dimensions(var)?;
        let rank = u8::try_from(dims.len())
            .map_err(|_| self.error(format!("too many dimensions for {}", var.name)))?;
        let mut sizes = Vec::with_capacity(dims.len());
        for &size in &dims {
            sizes.push(self.constant(Value::Int(size as i64))?);
        }
        self.chunk.var_dims.insert(var.name.to_lowercase(), dims);

        self.emit_with(Op::CreateArray, &[rank]);
        for size in sizes {
            self.chunk.write(size);
        }
        self.chunk.write(slot);
        Ok(())
    }

    /// Constant dimension sizes of a DIM'd array, each at least 1.
    fn dimensions(&self, var: &DimVar) -> Result<Vec<usize>> {
        let mut dims = Vec::with_capacity(var.dimensions.len());
        for (index, expr) in var.dimensions.iter().enumerate() {
            let size = match self.fold_const(expr, &var.name) {
                Ok(Value::Int(n)) => n,
                _ => {
                    return Err(self.error(format!(
                        "dimension {} for {}: array dimension must be a constant number",
                        index + 1,
                        var.name
                    )));
                }
            };
            if size < 1 {
                return Err(self.error(format!(
                    "dimension {} for {} must be >= 1",
                    index + 1,
                    var.name
                )));
            }
            dims.push(size as usize);
        }
        if ArrayData::checked_len(&dims).is_none() {
            return Err(self.error(format!("array too large: {}", var.name)));
        }
        Ok(dims)
    }

    fn on_event(&mut self, event: &str, key: &str, body: &'p Block) -> Result<()> {
        let kind = EventKind::parse(event)
            .ok_or_else(|| self.error(format!("unknown event kind: {}", event)))?;
        let kind = self.name_constant(kind.as_str())?;
        let key = self.name_constant(key)?;

        self.emit_with(Op::RegisterEvent, &[kind, key]);
        let position = self.chunk.code.len();
        self.chunk.write_u16(0);

        self.fixups.push(Fixup {
            position,
            kind: FixupKind::Event(self.events.len()),
            line: self.line,
        });
        self.events.push(body);
        Ok(())
    }

    fn block(&mut self, body: &'p Block) -> Result<()> {
        for stmt in body {
            self.statement(stmt)?;
        }
        Ok(())
    }

    // ========================================
    // Expressions
    // ========================================

    fn expression(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Number { text } => {
                let value = parse_number(text).map_err(|m| self.error(m))?;
                self.emit_constant(value)
            }
            Expr::Str { value } => {
                let index = self.name_constant(value)?;
                self.emit_with(Op::LoadString, &[index]);
                Ok(())
            }
            Expr::Bool { value } => self.emit_constant(Value::Bool(*value)),
            Expr::Nil => self.emit_constant(Value::Nil),
            Expr::Identifier { name } => self.identifier(name),
            Expr::Call { name, args } => {
                if !self.call(name, args)? {
                    self.emit_constant(Value::Nil)?;
                }
                Ok(())
            }
            Expr::MemberAccess { object, member } => self.member_access(object, member),
            Expr::JsonIndex { object, key } => {
                self.expression(object)?;
                let key = self.name_constant(key)?;
                self.emit_with(Op::LoadConst, &[key]);
                self.emit_foreign_call("getjsonkey", 2)
            }
            Expr::Dict { pairs } => {
                self.emit_foreign_call("createdict", 0)?;
                for pair in pairs {
                    self.dict_insert(&pair.key, &pair.value)?;
                }
                Ok(())
            }
            Expr::Binary { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                let opcode = binary_op(op)
                    .ok_or_else(|| self.error(format!("unsupported binary operator: {}", op)))?;
                self.emit(opcode);
                Ok(())
            }
            Expr::Unary { op, operand } => {
                if op == "-"
                    && let Expr::Number { text } = operand.as_ref()
                {
                    let value = parse_number(text).map_err(|m| self.error(m))?;
                    return self.emit_constant(negate(value));
                }
                self.expression(operand)?;
                let opcode = match op.to_lowercase().as_str() {
                    "-" => Op::Neg,
                    "not" => Op::Not,
                    _ => return Err(self.error(format!("unsupported unary operator: {}", op))),
                };
                self.emit(opcode);
                Ok(())
            }
        }
    }

    /// Parameter, slot, constant, host name, then run-time global.
    fn identifier(&mut self, name: &str) -> Result<()> {
        let lower = name.to_lowercase();

        if let Some(&index) = self.params.get(&lower) {
            self.emit_with(Op::LoadLocal, &[index]);
            return Ok(());
        }
        if let Some(slot) = self.chunk.lookup_variable(&lower) {
            self.emit_with(Op::LoadVar, &[slot]);
            return Ok(());
        }
        if let Some(value) = self.named_constant(&lower) {
            return self.emit_constant(value);
        }
        if let Some(index) = self.type_constant(&lower)? {
            self.emit_with(Op::LoadConst, &[index]);
            return Ok(());
        }
        if resolve::host_namespace(&lower).is_some() {
            return self.emit_foreign_call(&resolve::flatten_qualified(&lower), 0);
        }

        let index = self.name_constant(name)?;
        self.emit_with(Op::LoadGlobal, &[index]);
        Ok(())
    }

    fn member_access(&mut self, object: &Expr, member: &str) -> Result<()> {
        let prop = member.to_lowercase();

        if let Expr::Identifier { name } = object {
            let owner = name.to_lowercase();
            if self.entity_names.contains(&owner) {
                let entity = self.name_constant(&owner)?;
                let prop = self.name_constant(&prop)?;
                self.emit_with(Op::LoadEntityProp, &[entity, prop]);
                return Ok(());
            }

            let qualified = format!("{}.{}", owner, prop);
            if let Some(index) = self.type_constant(&qualified)? {
                self.emit_with(Op::LoadConst, &[index]);
                return Ok(());
            }
            if let Some(&value) = self.chunk.enums.get(&qualified) {
                return self.emit_constant(Value::Int(value));
            }
            if HOST_NAMESPACES.contains(&owner.as_str()) && !matches!(prop.as_str(), "x" | "y" | "z")
            {
                return self.emit_foreign_call(&resolve::flatten_qualified(&qualified), 0);
            }
        }

        self.expression(object)?;
        let getter = match prop.as_str() {
            "x" => "getvector2x".to_string(),
            "y" => "getvector2y".to_string(),
            "z" => "getvector3z".to_string(),
            other => format!("getvector2{}", other),
        };
        self.emit_foreign_call(&getter, 1)
    }

    /// Compile a call. Returns whether it left a value on the stack.
    fn call(&mut self, name: &str, args: &[Expr]) -> Result<bool> {
        let scope = CallScope {
            functions: &self.user_functions,
            var_dims: &self.chunk.var_dims,
        };
        let resolution = resolve::resolve_call(name, args.len(), &scope).map_err(|m| self.error(m))?;
        let argc = u8::try_from(args.len())
            .map_err(|_| self.error(format!("too many arguments to {}", name)))?;

        match &resolution {
            Resolution::ArrayRead => {
                self.arguments(args)?;
                let slot = self.slot(name)?;
                self.emit_with(Op::LoadArray, &[slot]);
            }
            Resolution::UserCall(qualified) => {
                self.arguments(args)?;
                let index = self.name_constant(qualified)?;
                self.emit_with(Op::CallUser, &[index, argc]);
            }
            Resolution::BuiltinCall(op, _) => {
                self.arguments(args)?;
                self.emit(*op);
            }
            Resolution::Print => {
                if args.is_empty() {
                    let empty = self.name_constant("")?;
                    self.emit_with(Op::LoadString, &[empty]);
                    self.emit(Op::Print);
                }
                for arg in args {
                    self.expression(arg)?;
                    self.emit(Op::Print);
                }
            }
            Resolution::MatMul => {
                let mut operands = Vec::with_capacity(3);
                for arg in args {
                    let name = match arg {
                        Expr::Identifier { name } | Expr::Str { value: name } => name.to_lowercase(),
                        _ => {
                            return Err(self.error(
                                "MatMul: all 3 args must be variable names or string literals",
                            ));
                        }
                    };
                    operands.push(self.name_constant(&name)?);
                }
                self.emit_with(Op::MatMul, &operands);
            }
            Resolution::ForeignCall(foreign) => {
                self.arguments(args)?;
                let index = self.name_constant(foreign)?;
                self.emit_with(Op::CallForeign, &[index, argc]);
            }
        }

        Ok(resolution.pushes_value())
    }

    fn arguments(&mut self, args: &[Expr]) -> Result<()> {
        for arg in args {
            self.expression(arg)?;
        }
        Ok(())
    }

    fn load_variable(&mut self, name: &str) -> Result<()> {
        if let Some(&index) = self.params.get(&name.to_lowercase()) {
            self.emit_with(Op::LoadLocal, &[index]);
        } else {
            let slot = self.slot(name)?;
            self.emit_with(Op::LoadVar, &[slot]);
        }
        Ok(())
    }

    fn store_variable(&mut self, name: &str) -> Result<()> {
        if let Some(&index) = self.params.get(&name.to_lowercase()) {
            self.emit_with(Op::StoreLocal, &[index]);
        } else {
            let slot = self.slot(name)?;
            self.emit_with(Op::StoreVar, &[slot]);
        }
        Ok(())
    }

    // ========================================
    // Constants
    // ========================================

    fn named_constant(&self, lower: &str) -> Option<Value> {
        if let Some(value) = self.named_consts.get(lower) {
            return Some(value.clone());
        }
        self.chunk.enums.get(lower).map(|&n| Value::Int(n))
    }

    /// Pool index of a TYPE constant field, cached per `type.field`.
    fn type_constant(&mut self, qualified: &str) -> Result<Option<u8>> {
        if let Some(&index) = self.const_groups.get(qualified) {
            return Ok(Some(index));
        }
        let Some(value) = self.type_consts.get(qualified).cloned() else {
            return Ok(None);
        };
        let index = self.constant(value)?;
        self.const_groups.insert(qualified.to_string(), index);
        Ok(Some(index))
    }

    /// Fold a literal (or `-literal`, or an earlier CONST) to a value.
    fn fold_const(&self, expr: &Expr, name: &str) -> Result<Value> {
        match expr {
            Expr::Number { text } => parse_number(text).map_err(|m| self.error(m)),
            Expr::Str { value } => Ok(Value::str(value)),
            Expr::Bool { value } => Ok(Value::Bool(*value)),
            Expr::Nil => Ok(Value::Nil),
            Expr::Unary { op, operand } if op == "-" => {
                let value = self.fold_const(operand, name)?;
                if value.is_number() {
                    Ok(negate(value))
                } else {
                    Err(self.error(format!("{} must be a constant value", name)))
                }
            }
            Expr::Identifier { name: other } => self
                .named_constant(&other.to_lowercase())
                .ok_or_else(|| self.error(format!("{} must be a constant value", name))),
            _ => Err(self.error(format!("{} must be a constant value", name))),
        }
    }

    // ========================================
    // Emission helpers
    // ========================================

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(message, self.line)
    }

    fn mark_line(&mut self, line: Option<usize>) {
        if let Some(line) = line {
            self.chunk.lines.add(self.chunk.code.len(), line);
        }
    }

    fn emit(&mut self, op: Op) {
        self.chunk.write_op(op);
    }

    fn emit_with(&mut self, op: Op, operands: &[u8]) {
        self.chunk.write_op(op);
        for &operand in operands {
            self.chunk.write(operand);
        }
    }

    fn constant(&mut self, value: Value) -> Result<u8> {
        self.chunk.add_constant(value).map_err(|m| self.error(m))
    }

    fn name_constant(&mut self, name: &str) -> Result<u8> {
        self.constant(Value::str(name))
    }

    fn emit_constant(&mut self, value: Value) -> Result<()> {
        let index = self.constant(value)?;
        self.emit_with(Op::LoadConst, &[index]);
        Ok(())
    }

    /// `Dup key value setdictkey Pop` with the dict handle on top, which is
    /// left there whatever `setdictkey` returns.
    fn dict_insert(&mut self, key: &str, value: &Expr) -> Result<()> {
        self.emit(Op::Dup);
        let key = self.name_constant(key)?;
        self.emit_with(Op::LoadConst, &[key]);
        self.expression(value)?;
        self.emit_foreign_call("setdictkey", 3)?;
        self.emit(Op::Pop);
        Ok(())
    }

    fn emit_foreign_call(&mut self, name: &str, argc: u8) -> Result<()> {
        let index = self.name_constant(name)?;
        self.emit_with(Op::CallForeign, &[index, argc]);
        Ok(())
    }

    fn slot(&mut self, name: &str) -> Result<u8> {
        self.chunk.variable_slot(name).map_err(|m| self.error(m))
    }

    /// Emit a jump with a placeholder offset; returns the operand position.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.chunk.write_op(op);
        let position = self.chunk.code.len();
        self.chunk.write_u16(0xFFFF);
        position
    }

    fn emit_jump_back(&mut self, op: Op, target: usize) -> Result<()> {
        let position = self.emit_jump(op);
        self.patch_jump_to(position, target)
    }

    fn patch_jump(&mut self, position: usize) -> Result<()> {
        self.patch_jump_to(position, self.chunk.code.len())
    }

    /// rel16 offsets count from the byte after the operand.
    fn patch_jump_to(&mut self, position: usize, target: usize) -> Result<()> {
        let offset = target as i64 - (position as i64 + 2);
        let offset = i16::try_from(offset).map_err(|_| self.error("jump too far"))?;
        self.chunk.patch_u16(position, offset as u16);
        Ok(())
    }

    fn patch_abs(&mut self, position: usize, target: usize) -> Result<()> {
        let target = u16::try_from(target).map_err(|_| self.error("program too large"))?;
        self.chunk.patch_u16(position, target);
        Ok(())
    }
}

/// Text with a `.` is a Float; otherwise Int, falling back to Float.
pub fn parse_number(text: &str) -> std::result::Result<Value, String> {
    let invalid = || format!("invalid number format: {}", text);
    let numeric = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !numeric {
        return Err(invalid());
    }
    if text.contains('.') {
        return text.parse::<f64>().map(Value::Float).map_err(|_| invalid());
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Int(n));
    }
    text.parse::<f64>().map(Value::Float).map_err(|_| invalid())
}

fn negate(value: Value) -> Value {
    match value {
        Value::Int(n) => Value::Int(n.wrapping_neg()),
        Value::Float(f) => Value::Float(-f),
        other => other,
    }
}

fn binary_op(op: &str) -> Option<Op> {
    let op = match op.to_lowercase().as_str() {
        "+" => Op::Add,
        "-" => Op::Sub,
        "*" => Op::Mul,
        "/" => Op::Div,
        "%" | "mod" => Op::Mod,
        "^" => Op::Power,
        "\\" => Op::IntDiv,
        "=" | "==" => Op::Equal,
        "<>" | "!=" => Op::NotEqual,
        "<" => Op::Less,
        "<=" => Op::LessEqual,
        ">" => Op::Greater,
        ">=" => Op::GreaterEqual,
        "and" => Op::And,
        "or" => Op::Or,
        "xor" => Op::Xor,
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;
    use crate::compiler::parser::Parser;
    use crate::vm::{ManualHost, SharedOutput, VM};

    fn parse(source: &str) -> Program {
        let mut lexer = Lexer::new("test.bas", source);
        let tokens = lexer.scan_tokens().unwrap();
        Parser::new("test.bas", tokens).parse().unwrap()
    }

    fn compile(source: &str) -> Result<Chunk> {
        let program = parse(source);
        Codegen::new().compile(&program)
    }

    fn compile_program(statements: Vec<Stmt>) -> Result<Chunk> {
        let program = Program { statements };
        Codegen::new().compile(&program)
    }

    fn run(source: &str) -> (VM, SharedOutput) {
        let chunk = compile(source).unwrap();
        let output = SharedOutput::new();
        let mut vm = VM::with_output(chunk, Box::new(output.clone()));
        vm.run_to_completion(&mut ManualHost::new()).unwrap();
        (vm, output)
    }

    fn ops(chunk: &Chunk) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = Op::try_from(chunk.code[offset]).unwrap();
            ops.push(op);
            offset += op.encoded_len(&chunk.code, offset).unwrap();
        }
        ops
    }

    #[test]
    fn test_number_literals() {
        let chunk = compile("a = 1.0\nb = 42\nc = 99999999999999999999").unwrap();
        assert!(matches!(chunk.constants[0], Value::Float(f) if f == 1.0));
        assert!(matches!(chunk.constants[1], Value::Int(42)));
        assert!(matches!(chunk.constants[2], Value::Float(_)));
        assert_eq!(parse_number("1.2.3").unwrap_err(), "invalid number format: 1.2.3");
        assert_eq!(parse_number("inf").unwrap_err(), "invalid number format: inf");
    }

    #[test]
    fn test_invalid_number_reports_line() {
        let err = compile_program(vec![Stmt::new(
            StmtKind::Assign {
                target: "x".to_string(),
                indices: vec![],
                value: Expr::number("12abc"),
            },
            7,
        )])
        .unwrap_err();
        assert_eq!(err.to_string(), "line 7: invalid number format: 12abc");
    }

    #[test]
    fn test_too_many_constants() {
        let source: String = (0..300).map(|i| format!("PRINT {}\n", i)).collect();
        let err = compile(&source).unwrap_err();
        assert_eq!(err.message, "too many constants");
        assert!(err.line.is_some());
    }

    #[test]
    fn test_too_many_variables() {
        let source: String = (0..300).map(|i| format!("v{} = 0\n", i)).collect();
        let err = compile(&source).unwrap_err();
        assert_eq!(err.message, "too many variables");
    }

    #[test]
    fn test_unsupported_operators() {
        let stmt = |expr: Expr| {
            vec![Stmt::new(
                StmtKind::Assign {
                    target: "x".to_string(),
                    indices: vec![],
                    value: expr,
                },
                1,
            )]
        };
        let err = compile_program(stmt(Expr::binary("<<", Expr::number("1"), Expr::number("2"))))
            .unwrap_err();
        assert_eq!(err.message, "unsupported binary operator: <<");
        let err = compile_program(stmt(Expr::Unary {
            op: "~".to_string(),
            operand: Box::new(Expr::number("1")),
        }))
        .unwrap_err();
        assert_eq!(err.message, "unsupported unary operator: ~");
    }

    #[test]
    fn test_builtin_arity_error_has_line() {
        let err = compile("x = 1\ny = Sqrt(1, 2)").unwrap_err();
        assert_eq!(err.to_string(), "line 2: Sqrt() expects 1 argument(s)");
    }

    #[test]
    fn test_unknown_coroutine_target() {
        let err = compile("STARTCOROUTINE Nope()").unwrap_err();
        assert_eq!(err.to_string(), "line 1: unknown sub for StartCoroutine: nope");
    }

    #[test]
    fn test_undeclared_array_assignment() {
        let err = compile("a(3) = 7").unwrap_err();
        assert_eq!(err.message, "array variable not declared: a");
    }

    #[test]
    fn test_invalid_dim_size() {
        let err = compile("DIM a(0)").unwrap_err();
        assert_eq!(err.message, "dimension 1 for a must be >= 1");
        let err = compile("n = 3\nDIM a(n)").unwrap_err();
        assert!(err.message.contains("must be a constant number"));
    }

    #[test]
    fn test_dim_too_large() {
        let err = compile("PRINT 1\nDIM a(10000000, 10000000, 10000000)").unwrap_err();
        assert_eq!(err.to_string(), "line 2: array too large: a");
        let err = compile("DIM b(5000, 5000)").unwrap_err();
        assert_eq!(err.message, "array too large: b");
        assert!(compile("DIM c(4096, 4096)").is_ok());
    }

    #[test]
    fn test_exit_outside_loop() {
        let err = compile("EXIT FOR").unwrap_err();
        assert_eq!(err.to_string(), "line 1: EXIT FOR outside loop");
        let err = compile("CONTINUE WHILE").unwrap_err();
        assert_eq!(err.message, "CONTINUE WHILE outside loop");
    }

    #[test]
    fn test_call_statement_pops_result() {
        let chunk = compile("DrawText(\"hi\", 1, 2)").unwrap();
        assert_eq!(
            ops(&chunk),
            vec![
                Op::LoadString,
                Op::LoadConst,
                Op::LoadConst,
                Op::CallForeign,
                Op::Pop,
                Op::Jump,
                Op::Halt
            ]
        );
    }

    #[test]
    fn test_print_as_expression_pushes_nil() {
        let chunk = compile("PRINT 1\nx = Print(2)").unwrap();
        assert_eq!(
            ops(&chunk)[..6],
            [
                Op::LoadConst,
                Op::Print,
                Op::LoadConst,
                Op::Print,
                Op::LoadConst,
                Op::StoreVar
            ]
        );
    }

    #[test]
    fn test_module_call_compiles_to_qualified_user_call() {
        let chunk = compile(
            "MODULE M\nFUNCTION F(x)\nRETURN x\nEND FUNCTION\nEND MODULE\ny = M.F(1)",
        )
        .unwrap();
        let call = chunk
            .code
            .iter()
            .position(|&b| b == Op::CallUser as u8)
            .unwrap();
        let name = &chunk.constants[chunk.code[call + 1] as usize];
        assert_eq!(name.as_str(), Some("m.f"));
        assert_eq!(chunk.code[call + 2], 1);
        assert_eq!(chunk.function("M.F").map(|f| f.arity), Some(1));
    }

    #[test]
    fn test_dict_literal_keeps_handle_on_stack() {
        let chunk = compile("d = {\"a\": 1, \"b\": 2}").unwrap();
        assert_eq!(
            ops(&chunk)[..12],
            [
                Op::CallForeign,
                Op::Dup,
                Op::LoadConst,
                Op::LoadConst,
                Op::CallForeign,
                Op::Pop,
                Op::Dup,
                Op::LoadConst,
                Op::LoadConst,
                Op::CallForeign,
                Op::Pop,
                Op::StoreVar
            ]
        );
    }

    #[test]
    fn test_dict_literal_ignores_setdictkey_result() {
        let source = "d = {\"a\": 1}\nENTITY Door\n  open = 0\nEND ENTITY";
        let chunk = compile(source).unwrap();
        let mut vm = VM::with_output(chunk, Box::new(SharedOutput::new()));
        vm.register_foreign("setdictkey", |args| {
            if let [Value::Dict(dict), key, value] = args {
                if let Some(key) = key.as_str() {
                    dict.borrow_mut().insert(key.to_string(), value.clone());
                }
            }
            Ok(Value::Bool(true))
        });
        vm.run_to_completion(&mut ManualHost::new()).unwrap();

        let Some(Value::Dict(d)) = vm.global("d") else {
            panic!("expected dict");
        };
        assert_eq!(d.borrow().get("a"), Some(&Value::Int(1)));
        assert!(matches!(vm.global("door"), Some(Value::Dict(_))));
    }

    #[test]
    fn test_member_access_getters() {
        let chunk = compile("v = 0\na = v.x\nb = v.width\nk = rl.KEY_SPACE").unwrap();
        let names: Vec<&str> = chunk.constants.iter().filter_map(|c| c.as_str()).collect();
        assert!(names.contains(&"getvector2x"));
        assert!(names.contains(&"getvector2width"));
        assert!(names.contains(&"key_space"));
    }

    #[test]
    fn test_for_loop_sums() {
        let (vm, _) = run("total = 0\nFOR i = 1 TO 10\n  total += i\nNEXT i");
        assert_eq!(vm.global("total"), Some(Value::Int(55)));
    }

    #[test]
    fn test_for_loop_negative_step() {
        let (_, out) = run("FOR i = 3 TO 1 STEP -1\n  PRINT i\nNEXT");
        assert_eq!(out.contents(), "3\n2\n1\n");
    }

    #[test]
    fn test_exit_and_continue() {
        let source = "n = 0\nFOR i = 1 TO 10\n  IF i = 3 THEN CONTINUE FOR\n  IF i = 6 THEN EXIT FOR\n  n += 1\nNEXT";
        let (vm, _) = run(source);
        assert_eq!(vm.global("n"), Some(Value::Int(4)));
        assert_eq!(vm.global("i"), Some(Value::Int(6)));
    }

    #[test]
    fn test_while_and_repeat() {
        let (vm, _) = run("i = 0\nWHILE i < 5\n  i += 1\nWEND\nj = 10\nREPEAT\n  j += 1\nUNTIL TRUE");
        assert_eq!(vm.global("i"), Some(Value::Int(5)));
        assert_eq!(vm.global("j"), Some(Value::Int(11)));
    }

    #[test]
    fn test_function_assignment_reserves_slot_for_main() {
        let (_, out) = run("FUNCTION Init()\n  score = 5\nEND FUNCTION\nInit()\nPRINT score");
        assert_eq!(out.contents(), "5\n");
    }

    #[test]
    fn test_select_case() {
        let source = "FUNCTION Size(n)\n  SELECT CASE n\n  CASE 1, 2\n    RETURN \"small\"\n  CASE 3\n    RETURN \"three\"\n  CASE ELSE\n    RETURN \"big\"\n  END SELECT\nEND FUNCTION\na = Size(2)\nb = Size(3)\nc = Size(9)";
        let (vm, _) = run(source);
        assert_eq!(vm.global("a"), Some(Value::str("small")));
        assert_eq!(vm.global("b"), Some(Value::str("three")));
        assert_eq!(vm.global("c"), Some(Value::str("big")));
    }

    #[test]
    fn test_if_elseif_else() {
        let source = "FUNCTION Sign3(n)\n  IF n > 0 THEN\n    RETURN 1\n  ELSEIF n < 0 THEN\n    RETURN -1\n  ELSE\n    RETURN 0\n  END IF\nEND FUNCTION\na = Sign3(5)\nb = Sign3(-5)\nc = Sign3(0)";
        let (vm, _) = run(source);
        assert_eq!(vm.global("a"), Some(Value::Int(1)));
        assert_eq!(vm.global("b"), Some(Value::Int(-1)));
        assert_eq!(vm.global("c"), Some(Value::Int(0)));
    }

    #[test]
    fn test_recursion() {
        let source = "FUNCTION Fib(n)\n  IF n < 2 THEN RETURN n\n  RETURN Fib(n - 1) + Fib(n - 2)\nEND FUNCTION\nr = Fib(15)";
        let (vm, _) = run(source);
        assert_eq!(vm.global("r"), Some(Value::Int(610)));
    }

    #[test]
    fn test_params_are_locals() {
        let source = "x = 100\nFUNCTION Bump(x)\n  x += 1\n  RETURN x\nEND FUNCTION\ny = Bump(1)";
        let (vm, _) = run(source);
        assert_eq!(vm.global("y"), Some(Value::Int(2)));
        assert_eq!(vm.global("x"), Some(Value::Int(100)));
    }

    #[test]
    fn test_const_enum_and_type_fields() {
        let source = "CONST LIMIT = -3, NAME = \"cb\"\nENUM Color : Red, Green = 5, Blue\nTYPE Config\n  width AS Integer = 800\nEND TYPE\na = LIMIT\nb = Blue\nc = Color.Green\nd = Config.width\ne = NAME";
        let (vm, _) = run(source);
        assert_eq!(vm.global("a"), Some(Value::Int(-3)));
        assert_eq!(vm.global("b"), Some(Value::Int(6)));
        assert_eq!(vm.global("c"), Some(Value::Int(5)));
        assert_eq!(vm.global("d"), Some(Value::Int(800)));
        assert_eq!(vm.global("e"), Some(Value::str("cb")));
    }

    #[test]
    fn test_dim_defaults() {
        let (vm, _) = run("DIM a AS String, b AS Float, c AS Boolean, d");
        assert_eq!(vm.global("a"), Some(Value::str("")));
        assert_eq!(vm.global("b"), Some(Value::Float(0.0)));
        assert_eq!(vm.global("c"), Some(Value::Bool(false)));
        assert_eq!(vm.global("d"), Some(Value::Int(0)));
    }

    #[test]
    fn test_arrays() {
        let (vm, _) = run("DIM grid(3, 4) AS Integer\ngrid(2, 3) = 7\nv = grid(2, 3)\nw = grid(0, 0)");
        assert_eq!(vm.global("v"), Some(Value::Int(7)));
        assert_eq!(vm.global("w"), Some(Value::Int(0)));
    }

    #[test]
    fn test_entities() {
        let (vm, out) = run("ENTITY Player\n  x = 10\n  Name = \"hero\"\nEND ENTITY\nPlayer.x = Player.x + 5\nPRINT Player.name\nPRINT Player.missing");
        assert_eq!(out.contents(), "hero\nnil\n");
        let Some(Value::Dict(player)) = vm.global("player") else {
            panic!("expected entity dict");
        };
        assert_eq!(player.borrow().get("x"), Some(&Value::Int(15)));
    }

    #[test]
    fn test_string_builtins() {
        let (_, out) = run("s = \"CyberBasic\"\nPRINT Left$(s, 5)\nPRINT Mid(s, 6, 5)\nPRINT Len(s)\nPRINT \"n=\" + Str(3)");
        assert_eq!(out.contents(), "Cyber\nBasic\n10\nn=3\n");
    }

    #[test]
    fn test_assert_failure_is_runtime_error() {
        let chunk = compile("ASSERT 1 = 2, \"math is broken\"").unwrap();
        let mut vm = VM::with_output(chunk, Box::new(SharedOutput::new()));
        let err = vm.run_to_completion(&mut ManualHost::new()).unwrap_err();
        assert!(err.message.contains("math is broken"), "{}", err);
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_coroutine_and_event_targets_patched() {
        let source = "SUB Worker()\n  YIELD\nEND SUB\nSTARTCOROUTINE Worker()\nON KeyDown(\"ESCAPE\")\n  Quit()\nEND ON";
        let chunk = compile(source).unwrap();
        let start = chunk
            .code
            .iter()
            .position(|&b| b == Op::StartCoroutine as u8)
            .unwrap();
        let target = u16::from_le_bytes([chunk.code[start + 1], chunk.code[start + 2]]) as usize;
        assert_eq!(Some(target), chunk.function("worker").map(|f| f.offset));

        let register = chunk
            .code
            .iter()
            .position(|&b| b == Op::RegisterEvent as u8)
            .unwrap();
        let handler = u16::from_le_bytes([chunk.code[register + 3], chunk.code[register + 4]]) as usize;
        assert_eq!(chunk.code[handler], Op::Quit as u8);
        assert_eq!(ops(&chunk).last(), Some(&Op::Halt));
    }

    #[test]
    fn test_unknown_event_kind() {
        let err = compile("ON MouseDown(\"LEFT\")\nEND ON").unwrap_err();
        assert_eq!(err.message, "unknown event kind: MouseDown");
    }

    #[test]
    fn test_coroutine_target_must_not_take_parameters() {
        let err = compile("SUB Worker(n)\nEND SUB\nSTARTCOROUTINE Worker").unwrap_err();
        assert!(err.message.contains("must take no parameters"));
    }

    #[test]
    fn test_line_table_points_at_statements() {
        let chunk = compile("a = 1\n\nb = 2").unwrap();
        let store_b = chunk
            .code
            .iter()
            .rposition(|&b| b == Op::StoreVar as u8)
            .unwrap();
        assert_eq!(chunk.line_at(store_b), Some(3));
        assert_eq!(chunk.line_at(0), Some(1));
    }
}
