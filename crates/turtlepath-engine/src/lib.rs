//! The turtlepath execution engine.
//!
//! Not a bytecode VM: the parser compiles each chunk (user function, builtin
//! command, or local block) into an ordered sequence of deferred
//! [`Statement`]s, and the executor walks them. Expressions are shared
//! closures over the [`Runtime`], built once at parse time with constant
//! folding already applied.
//!
//! The engine is used in two phases. During parsing, the builder methods
//! append statements to the current chunk and mirror every push on a "fake"
//! run of the real stacks, so stack offsets can be assigned to names as they
//! are declared. Between parsing and execution the stacks are reset, and the
//! same stack machinery runs for real.

mod debug;
mod program;
mod stack;
mod turtle_cmd;

pub use debug::{
    DebugInfo, EngineLocation, EngineDebugSink, ParserDebugSink, SourceLocation, NO_CHUNK,
};
pub use program::{Chunk, ChunkInfo, Program, Statement, ValueDomain};
pub use stack::{EngineStack, FrameStack, Scanner, StackSize};
pub use turtle_cmd::TurtleCmd;

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use turtlepath_turtle::{SvgPathTurtle, TurtleError};

/// Everything a deferred expression may read or tick: the stacks, the
/// turtle (for `turtle.x` and friends), and the `unique` counter.
pub struct Runtime {
    pub stack: EngineStack,
    pub turtle: SvgPathTurtle,
    next_unique: i32,
}

impl Runtime {
    pub fn new(turtle: SvgPathTurtle) -> Self {
        Self {
            stack: EngineStack::default(),
            turtle,
            next_unique: 1,
        }
    }
}

/// A deferred computation of one double. Shared so the constant-folding
/// combinators can compose sub-expressions without cloning bodies.
pub type Expr = Rc<dyn Fn(&mut Runtime) -> f64>;

// ===================== Expression constructors =====================

pub fn compile_access_constant(val: f64) -> Expr {
    Rc::new(move |_| val)
}

pub fn compile_access_value(source: ValueDomain, offset: i32) -> Expr {
    match source {
        ValueDomain::Local => Rc::new(move |rt| rt.stack.local(offset)),
        ValueDomain::Global => Rc::new(move |rt| rt.stack.read_global(offset)),
        ValueDomain::Capture => Rc::new(move |rt| rt.stack.read_capture(offset)),
    }
}

pub fn compile_turtle_x_expr() -> Expr {
    Rc::new(|rt| rt.turtle.x())
}

pub fn compile_turtle_y_expr() -> Expr {
    Rc::new(|rt| rt.turtle.y())
}

pub fn compile_turtle_dir_expr() -> Expr {
    Rc::new(|rt| rt.turtle.dir())
}

pub fn compile_unique_val_expr() -> Expr {
    Rc::new(|rt| {
        let val = rt.next_unique;
        rt.next_unique += 1;
        f64::from(val)
    })
}

// ===================== Errors =====================

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Turtle(#[from] TurtleError),

    #[error("Stack overflow - probably due to infinitely recursive user-defined command function")]
    InfiniteRecursion,
}

pub type ExecResult = Result<(), ExecError>;

const DEFAULT_RECURSION_LIMIT: i32 = 1_000_000;

type SharedEngineSink = Rc<RefCell<dyn EngineDebugSink>>;

// ===================== Engine =====================

pub struct Engine {
    program: Program,

    // program construction
    current_chunk: usize,
    chunk_index_stack: Vec<usize>,
    parser_push_val: f64,

    // Non-nested by construction: closures are created at the end of each
    // function definition, one at a time, so a single offset suffices.
    current_closure_start: i32,

    runtime: Runtime,

    recursion_limit: i32,
    is_executing: bool,
    pen_height_error: bool,

    debugger: Option<SharedEngineSink>,
    saved_pc: Vec<EngineLocation>,
}

impl Engine {
    pub fn new(turtle: SvgPathTurtle, debugger: Option<SharedEngineSink>) -> Self {
        Self {
            program: Program::new(),
            current_chunk: NO_CHUNK,
            chunk_index_stack: Vec::new(),
            parser_push_val: 0.0,
            current_closure_start: 0,
            runtime: Runtime::new(turtle),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            is_executing: false,
            pen_height_error: false,
            debugger,
            saved_pc: Vec::new(),
        }
    }

    pub fn turtle(&self) -> &SvgPathTurtle {
        &self.runtime.turtle
    }

    pub fn turtle_mut(&mut self) -> &mut SvgPathTurtle {
        &mut self.runtime.turtle
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The infinite-recursion guard, in stack slots.
    pub fn set_recursion_limit(&mut self, limit: i32) {
        self.recursion_limit = limit;
    }

    // ---- chunk bracket -------------------------------------------------

    fn enter_chunk(&mut self, index: usize) -> usize {
        debug_assert!(!self.is_executing);

        self.chunk_index_stack.push(self.current_chunk);
        self.current_chunk = index;

        if let Some(debugger) = &self.debugger {
            let chunk = self.program.chunk(index);
            if !chunk.is_builtin() {
                debugger
                    .borrow_mut()
                    .handle_new_chunk(index, chunk.is_call_frame());
            }
        }

        index
    }

    fn pop_chunk(&mut self) {
        debug_assert!(!self.is_executing);

        let index = self.current_chunk;

        if self.program.chunk(index).is_local_block() {
            // The entry frame size was parked in unwind_size; the difference
            // from the current size is what the block really leaves behind.
            let entry = self.program.chunk(index).block_info().unwind_size;
            let size = self.runtime.stack.frame_size() - entry;

            self.program.chunk_mut(index).block_info_mut().unwind_size = size;

            // parser support: drop the fake values the block pushed
            self.runtime.stack.pop(size);
        }

        self.current_chunk = self.chunk_index_stack.pop().unwrap_or(NO_CHUNK);
    }

    pub fn push_builtin_chunk(&mut self, params_size: i32) -> usize {
        let index = self.program.push_builtin(params_size);
        self.enter_chunk(index)
    }

    pub fn pop_builtin_chunk(&mut self) {
        self.pop_chunk();
    }

    pub fn push_user_chunk(&mut self) -> usize {
        self.runtime.stack.push_frame();

        let index = self.program.push_function();
        self.enter_chunk(index)
    }

    pub fn pop_user_chunk(&mut self) {
        self.pop_chunk();
        self.runtime.stack.pop_frame();
    }

    pub fn push_local_block_chunk(&mut self) -> usize {
        let entry = self.runtime.stack.frame_size();

        let index = self.program.push_local_block(entry);
        self.enter_chunk(index)
    }

    pub fn pop_local_block_chunk(&mut self) {
        self.pop_chunk();
    }

    // ---- parse-time stack mirroring ------------------------------------

    /// During parsing the value pushed onto the fake stacks is arbitrary;
    /// setting it to the current source line makes stack dumps legible.
    pub fn set_parser_push_val(&mut self, val: f64) {
        self.parser_push_val = val;
    }

    pub fn get_frame_size(&self) -> StackSize {
        self.runtime.stack.frame_size()
    }

    fn closure_capture_offset(&self) -> i32 {
        self.runtime.stack.frame_size().captures - self.current_closure_start
    }

    fn push_for_parser(&mut self, dest: ValueDomain, count: i32) -> i32 {
        let val = self.parser_push_val;

        match dest {
            ValueDomain::Local => {
                let offset = self.runtime.stack.frame_size().locals;
                for _ in 0..count {
                    self.runtime.stack.push(val);
                }
                offset
            }

            ValueDomain::Capture => {
                let offset = self.closure_capture_offset();
                for _ in 0..count {
                    self.runtime.stack.push_capture(val);
                }
                offset
            }

            ValueDomain::Global => unreachable!("cannot push into the global domain"),
        }
    }

    // ---- statement building --------------------------------------------

    fn add_statement(&mut self, stmt: Statement) {
        let index = self.current_chunk;

        self.program.chunk_mut(index).statements.push(stmt);

        if let Some(debugger) = &self.debugger {
            if !self.program.chunk(index).is_builtin() {
                let statement_index = self.program.chunk(index).statements.len() - 1;

                let description = if debugger.borrow().want_stack_description() {
                    describe_stacks(&self.runtime.stack)
                } else {
                    String::new()
                };

                debugger.borrow_mut().handle_new_statement(&DebugInfo {
                    loc: EngineLocation::new(index, statement_index),
                    turtle: &self.runtime.turtle,
                    stack_description: &description,
                });
            }
        }
    }

    pub fn compile_add_param(&mut self, size: i32) -> i32 {
        debug_assert!(self.program.chunk(self.current_chunk).is_call_frame());

        let offset = self.push_for_parser(ValueDomain::Local, size);

        self.program
            .chunk_mut(self.current_chunk)
            .fn_info_mut()
            .params_size += size;

        offset
    }

    pub fn compile_push_value(&mut self, dest: ValueDomain, expr: Expr) -> i32 {
        let offset = self.push_for_parser(dest, 1);
        self.add_statement(Statement::PushValue { dest, expr });
        offset
    }

    pub fn compile_push_constant(&mut self, dest: ValueDomain, value: f64) -> i32 {
        let offset = self.push_for_parser(dest, 1);
        self.add_statement(Statement::PushConstant { dest, value });
        offset
    }

    pub fn compile_push_copy(
        &mut self,
        dest: ValueDomain,
        source: ValueDomain,
        offset: i32,
        size: i32,
    ) -> i32 {
        debug_assert!(size > 0);

        let offset_of_copy = self.push_for_parser(dest, size);
        self.add_statement(Statement::PushCopy {
            dest,
            source,
            offset,
            size,
        });
        offset_of_copy
    }

    /// A function value is two slots: chunk index, then closure position.
    pub fn compile_push_lambda(
        &mut self,
        dest: ValueDomain,
        fn_index: usize,
        self_recursion: bool,
    ) -> i32 {
        let offset = self.push_for_parser(dest, 2);
        self.add_statement(Statement::PushLambda {
            dest,
            fn_index,
            self_recursion,
        });
        offset
    }

    /// Reserves the loop variable's slot. No statement: the for-loop driver
    /// pushes the value at each iteration, but the offset must be known
    /// while the body parses.
    pub fn compile_named_loop_var(&mut self) -> i32 {
        self.push_for_parser(ValueDomain::Local, 1)
    }

    /// Records where this function's closure begins on the captures stack.
    /// The capture-copy statements that follow will push into it.
    pub fn create_closure(&mut self, fn_index: usize) {
        debug_assert!(self.program.chunk(fn_index).is_call_frame());

        let closure_offset = self.runtime.stack.frame_size().captures;

        self.current_closure_start = closure_offset;
        self.program.chunk_mut(fn_index).fn_info_mut().closure_offset = closure_offset;
    }

    pub fn compile_start_fn_call(&mut self, fn_index: usize, self_recursion: bool) {
        self.add_statement(Statement::StartFnCall {
            fn_index,
            self_recursion,
        });
    }

    pub fn compile_call_fn(&mut self, fn_index: usize, args_size: StackSize) {
        self.runtime.stack.pop(args_size); // unwind the fake arguments

        self.add_statement(Statement::CallFn {
            fn_index,
            args_size,
        });
    }

    pub fn compile_start_lambda_call(&mut self, source: ValueDomain, offset: i32) {
        self.add_statement(Statement::StartLambdaCall { source, offset });
    }

    pub fn compile_call_lambda_fn(&mut self, source: ValueDomain, offset: i32, args_size: StackSize) {
        self.runtime.stack.pop(args_size);

        self.add_statement(Statement::CallLambdaFn {
            source,
            offset,
            args_size,
        });
    }

    /// `else_block` 0 means no else branch.
    pub fn compile_if_statement(&mut self, condition: Expr, then_block: usize, else_block: usize) {
        self.add_statement(Statement::If {
            condition,
            then_block,
            else_block,
        });
    }

    /// Three forms: count (`start` only), range (`start`/`end`), and range
    /// with step (all three). `step` requires `end`.
    pub fn compile_for_loop(
        &mut self,
        start: Expr,
        step: Option<Expr>,
        end: Option<Expr>,
        block: usize,
        named_var: bool,
    ) {
        debug_assert!(end.is_some() || step.is_none());

        self.add_statement(Statement::For {
            start,
            step,
            end,
            block,
            named_var,
        });
    }

    pub fn compile_breakpoint(&mut self) {
        self.add_statement(Statement::Breakpoint);
    }

    /// The whole body of a builtin chunk: read the parameter slots, call
    /// one turtle method.
    pub fn compile_turtle_cmd(&mut self, cmd: TurtleCmd) {
        let args = (0..cmd.arity() as i32)
            .map(|i| compile_access_value(ValueDomain::Local, i))
            .collect();

        self.add_statement(Statement::Turtle { cmd, args });
    }

    // ---- execution -----------------------------------------------------

    pub fn execute_main(&mut self, chunk_index: usize) -> ExecResult {
        debug_assert!(chunk_index != NO_CHUNK);

        log::debug!("executing main chunk {chunk_index}");

        self.runtime.stack.reset();
        self.is_executing = true;

        let mut executor = Executor {
            program: &self.program,
            rt: &mut self.runtime,
            debugger: self.debugger.clone(),
            recursion_limit: self.recursion_limit,
            pc: Vec::new(),
            pen_height_error: false,
        };

        let result = executor.exec_call_fn(chunk_index, StackSize::default());

        self.pen_height_error |= executor.pen_height_error;
        self.saved_pc = executor.pc;
        self.is_executing = false;

        if result.is_ok() {
            self.runtime.turtle.finish();
        }

        result
    }

    pub fn has_pen_height_error(&self) -> bool {
        self.pen_height_error
    }

    /// Where execution stopped, for error reporting: the innermost
    /// non-builtin frame.
    pub fn engine_location(&self) -> EngineLocation {
        for pc in self.saved_pc.iter().rev() {
            if !self.program.chunk(pc.chunk_index).is_builtin() {
                return *pc;
            }
        }

        EngineLocation::new(NO_CHUNK, 0)
    }

    /// Call-stack trace, innermost last, builtin frames stripped from the
    /// top, plus a description of both stacks.
    pub fn get_backtrace(&self) -> (Vec<EngineLocation>, String) {
        let mut stack = self.saved_pc.clone();

        while let Some(pc) = stack.last() {
            if self.program.chunk(pc.chunk_index).is_builtin() {
                stack.pop();
            } else {
                break;
            }
        }

        (stack, describe_stacks(&self.runtime.stack))
    }

    /// Used by tests: after a successful run both stacks must be empty.
    pub fn stack_size(&self) -> StackSize {
        self.runtime.stack.stack_size()
    }
}

/// Calls through the shared expression handle.
fn eval(expr: &Expr, rt: &mut Runtime) -> f64 {
    (**expr)(rt)
}

fn describe_scanner(out: &mut String, mut scanner: Scanner<'_>) {
    while scanner.more() {
        if scanner.is_outer_frame() {
            out.push('|');
        } else {
            if scanner.is_current_frame() {
                out.push('^');
            }
            out.push_str(&format!("{} ", scanner.value()));
        }
        scanner.next();
    }

    if scanner.is_current_frame() {
        out.push('^');
    }
}

fn describe_stacks(stack: &EngineStack) -> String {
    let mut out = String::from("stack[");
    describe_scanner(&mut out, stack.locals_scanner());
    out.push_str("] captures[");
    describe_scanner(&mut out, stack.captures_scanner());
    out.push(']');
    out
}

// ===================== Executor =====================

/// Borrows the immutable program and the mutable runtime separately, so
/// statements can be walked while the stacks and turtle change.
struct Executor<'a> {
    program: &'a Program,
    rt: &'a mut Runtime,
    debugger: Option<SharedEngineSink>,
    recursion_limit: i32,
    pc: Vec<EngineLocation>,
    pen_height_error: bool,
}

impl<'a> Executor<'a> {
    fn read(&self, source: ValueDomain, offset: i32) -> f64 {
        match source {
            ValueDomain::Local => self.rt.stack.local(offset),
            ValueDomain::Global => self.rt.stack.read_global(offset),
            ValueDomain::Capture => self.rt.stack.read_capture(offset),
        }
    }

    fn push(&mut self, dest: ValueDomain, val: f64) {
        match dest {
            ValueDomain::Local => self.rt.stack.push(val),
            ValueDomain::Capture => self.rt.stack.push_capture(val),
            ValueDomain::Global => unreachable!("cannot push into the global domain"),
        }
    }

    fn engine_location(&self) -> EngineLocation {
        for pc in self.pc.iter().rev() {
            if !self.program.chunk(pc.chunk_index).is_builtin() {
                return *pc;
            }
        }

        EngineLocation::new(NO_CHUNK, 0)
    }

    fn fn_call_closure_position(&self, chunk: &Chunk, self_recursion: bool) -> i32 {
        if self_recursion {
            // Re-use the current frame's closure position.
            self.rt.stack.closure_position()
        } else {
            let frame_start = self.rt.stack.capture_frame_start();
            let position = frame_start + chunk.fn_info().closure_offset;

            debug_assert!(position >= 0);
            position
        }
    }

    fn exec_start_fn_call(
        &mut self,
        dest: ValueDomain,
        chunk_index: usize,
        self_recursion: bool,
        is_lambda: bool,
    ) {
        if is_lambda {
            self.push(dest, chunk_index as f64);
        }

        let chunk = self.program.chunk(chunk_index);

        if chunk.is_closure() {
            let position = self.fn_call_closure_position(chunk, self_recursion);
            self.push(dest, f64::from(position));
        } else if is_lambda {
            self.push(dest, 0.0);
        }
    }

    fn exec_fn_body(
        &mut self,
        chunk_index: usize,
        args_size: StackSize,
        params_size: i32,
        has_closure_position: bool,
    ) -> ExecResult {
        // Closure objects are not passed into calls, only the closure
        // position word; the captures side of the new frame is empty.
        self.rt.stack.push_frame_args(
            StackSize::new(args_size.locals, 0),
            StackSize::new(params_size, 0),
        );

        self.exec_statements(chunk_index)?;

        self.rt.stack.pop_frame();

        // Unwinding the call also drops the closure-position word (if one
        // was pushed) and the closures built for anonymous lambdas in the
        // argument list.
        self.rt.stack.pop(StackSize::new(
            i32::from(has_closure_position),
            args_size.captures,
        ));

        Ok(())
    }

    fn exec_call_fn(&mut self, fn_index: usize, args_size: StackSize) -> ExecResult {
        let chunk = self.program.chunk(fn_index);
        debug_assert!(chunk.is_call_frame());

        let info = chunk.fn_info();
        let (params_size, is_closure) = (info.params_size, info.is_closure());

        self.pc.push(EngineLocation::new(fn_index, 0));

        self.exec_fn_body(fn_index, args_size, params_size, is_closure)?;

        self.pc.pop();
        Ok(())
    }

    fn exec_call_lambda(&mut self, fn_index: usize, args_size: StackSize) -> ExecResult {
        let chunk = self.program.chunk(fn_index);
        debug_assert!(chunk.is_call_frame());

        let params_size = chunk.fn_info().params_size;

        self.pc.push(EngineLocation::new(fn_index, 0));

        // A lambda call always carries a closure-position word, even for
        // functions that capture nothing.
        self.exec_fn_body(fn_index, args_size, params_size, true)?;

        self.pc.pop();
        Ok(())
    }

    fn exec_call_local_block(&mut self, block_index: usize) -> ExecResult {
        let chunk = self.program.chunk(block_index);
        debug_assert!(chunk.is_local_block());

        let unwind = chunk.block_info().unwind_size;

        self.pc.push(EngineLocation::new(block_index, 0));

        self.exec_statements(block_index)?;
        self.rt.stack.pop(unwind);

        self.pc.pop();
        Ok(())
    }

    fn exec_statements(&mut self, chunk_index: usize) -> ExecResult {
        if !self.rt.stack.check_stack_size(self.recursion_limit) {
            return Err(ExecError::InfiniteRecursion);
        }

        let program = self.program;
        let statements: &'a [Statement] = &program.chunk(chunk_index).statements;

        if self.debugger.is_none() {
            for stmt in statements {
                self.exec_statement(stmt)?;
            }
        } else {
            for stmt in statements {
                self.trace_statement();
                self.exec_statement(stmt)?;
                if let Some(pc) = self.pc.last_mut() {
                    pc.statement_index += 1;
                }
            }
        }

        Ok(())
    }

    fn trace_statement(&mut self) {
        let Some(debugger) = self.debugger.clone() else {
            return;
        };

        let chunk_index = match self.pc.last() {
            Some(pc) => pc.chunk_index,
            None => return,
        };

        if self.program.chunk(chunk_index).is_builtin() {
            return;
        }

        let description = if debugger.borrow().want_stack_description() {
            describe_stacks(&self.rt.stack)
        } else {
            String::new()
        };

        debugger.borrow_mut().handle_trace_point(&DebugInfo {
            loc: self.engine_location(),
            turtle: &self.rt.turtle,
            stack_description: &description,
        });
    }

    fn exec_statement(&mut self, stmt: &Statement) -> ExecResult {
        match stmt {
            Statement::PushValue { dest, expr } => {
                let val = eval(expr, self.rt);
                self.push(*dest, val);
            }

            Statement::PushConstant { dest, value } => {
                self.push(*dest, *value);
            }

            Statement::PushCopy {
                dest,
                source,
                offset,
                size,
            } => {
                for i in *offset..*offset + *size {
                    let val = self.read(*source, i);
                    self.push(*dest, val);
                }
            }

            Statement::PushLambda {
                dest,
                fn_index,
                self_recursion,
            } => {
                self.exec_start_fn_call(*dest, *fn_index, *self_recursion, true);
            }

            Statement::StartFnCall {
                fn_index,
                self_recursion,
            } => {
                self.exec_start_fn_call(ValueDomain::Local, *fn_index, *self_recursion, false);
            }

            Statement::CallFn {
                fn_index,
                args_size,
            } => {
                self.exec_call_fn(*fn_index, *args_size)?;
            }

            Statement::StartLambdaCall { source, offset } => {
                let closure_position = self.read(*source, *offset + 1);
                self.rt.stack.push(closure_position);
            }

            Statement::CallLambdaFn {
                source,
                offset,
                args_size,
            } => {
                let fn_index = self.read(*source, *offset);

                debug_assert!(fn_index >= 0.0);
                debug_assert!(fn_index.fract() == 0.0);

                self.exec_call_lambda(fn_index as usize, *args_size)?;
            }

            Statement::If {
                condition,
                then_block,
                else_block,
            } => {
                if eval(condition, self.rt) != 0.0 {
                    self.exec_call_local_block(*then_block)?;
                } else if *else_block != 0 {
                    self.exec_call_local_block(*else_block)?;
                }
            }

            Statement::For {
                start,
                step,
                end,
                block,
                named_var,
            } => {
                self.exec_for_loop(start, step.as_ref(), end.as_ref(), *block, *named_var)?;
            }

            Statement::Breakpoint => {
                if let Some(debugger) = self.debugger.clone() {
                    debugger.borrow_mut().handle_breakpoint(self.engine_location());
                }
            }

            Statement::Turtle { cmd, args } => {
                let mut vals = [0.0f64; 6];
                for (slot, arg) in vals.iter_mut().zip(args.iter()) {
                    *slot = eval(arg, self.rt);
                }

                cmd.dispatch(&vals[..args.len()], &mut self.rt.turtle)?;
            }
        }

        self.check_pen_height();
        Ok(())
    }

    fn check_pen_height(&mut self) {
        if !self.pen_height_error && self.rt.turtle.pen_height() < 0 {
            self.pen_height_error = true;

            if let Some(debugger) = self.debugger.clone() {
                debugger
                    .borrow_mut()
                    .handle_pen_height_error(self.engine_location());
            }
        }
    }

    fn exec_for_loop(
        &mut self,
        start: &Expr,
        step: Option<&Expr>,
        end: Option<&Expr>,
        block: usize,
        named_var: bool,
    ) -> ExecResult {
        match (step, end) {
            // `for N { … }`: N truncated to an integer count, loop variable
            // counts 0..N-1.
            (None, None) => {
                let count = eval(start, self.rt) as i32;

                for i in 0..count {
                    if named_var {
                        self.rt.stack.push(f64::from(i));
                    }
                    self.exec_call_local_block(block)?;
                }
            }

            // `for s..e { … }`: step 1, direction follows the endpoints.
            (None, Some(end)) => {
                let mut s = eval(start, self.rt);
                let e = eval(end, self.rt);

                if s <= e {
                    while s <= e {
                        if named_var {
                            self.rt.stack.push(s);
                        }
                        self.exec_call_local_block(block)?;
                        s += 1.0;
                    }
                } else {
                    while s >= e {
                        if named_var {
                            self.rt.stack.push(s);
                        }
                        self.exec_call_local_block(block)?;
                        s -= 1.0;
                    }
                }
            }

            // `for s..step..e { … }`
            (Some(step), Some(end)) => {
                let mut s = eval(start, self.rt);
                let mut inc = eval(step, self.rt);
                let e = eval(end, self.rt);

                if s <= e {
                    while s <= e {
                        if named_var {
                            self.rt.stack.push(s);
                        }
                        self.exec_call_local_block(block)?;
                        s += inc;
                    }
                } else {
                    if inc < 0.0 {
                        inc = -inc;
                    }

                    while s >= e {
                        if named_var {
                            self.rt.stack.push(s);
                        }
                        self.exec_call_local_block(block)?;
                        s -= inc;
                    }
                }
            }

            (Some(_), None) => unreachable!("for loop with a step but no end"),
        }

        Ok(())
    }
}

// ===================== Tests =====================

#[cfg(test)]
mod tests {
    use super::*;
    use turtlepath_turtle::NullEmitter;

    fn engine() -> Engine {
        Engine::new(SvgPathTurtle::new(Box::new(NullEmitter)), None)
    }

    /// Registers a one-parameter `f` builtin the way the parser does.
    fn register_forward(engine: &mut Engine) -> usize {
        let index = engine.push_builtin_chunk(1);
        engine.compile_turtle_cmd(TurtleCmd::Forward);
        engine.pop_builtin_chunk();
        index
    }

    #[test]
    fn call_builtin_with_constant_argument() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 10.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();

        assert_eq!(engine.turtle().x(), 10.0);
        assert_eq!(engine.stack_size(), StackSize::default());
    }

    #[test]
    fn count_loop_runs_body_n_times() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();

        let block = engine.push_local_block_chunk();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 1.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_local_block_chunk();

        engine.compile_for_loop(compile_access_constant(3.9), None, None, block, false);
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();

        // 3.9 truncates to 3 iterations
        assert_eq!(engine.turtle().x(), 3.0);
        assert_eq!(engine.stack_size(), StackSize::default());
    }

    #[test]
    fn named_loop_var_is_visible_to_the_body() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();

        let block = engine.push_local_block_chunk();
        let var_offset = engine.compile_named_loop_var();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_value(
            ValueDomain::Local,
            compile_access_value(ValueDomain::Local, var_offset),
        );
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_local_block_chunk();

        engine.compile_for_loop(
            compile_access_constant(1.0),
            None,
            Some(compile_access_constant(3.0)),
            block,
            true,
        );
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();

        // 1 + 2 + 3
        assert_eq!(engine.turtle().x(), 6.0);
        assert_eq!(engine.stack_size(), StackSize::default());
    }

    #[test]
    fn descending_range_follows_endpoints() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();

        let block = engine.push_local_block_chunk();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 1.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_local_block_chunk();

        engine.compile_for_loop(
            compile_access_constant(3.0),
            None,
            Some(compile_access_constant(1.0)),
            block,
            false,
        );
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();
        assert_eq!(engine.turtle().x(), 3.0);
    }

    #[test]
    fn stepped_range_skips() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();

        let block = engine.push_local_block_chunk();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 1.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_local_block_chunk();

        // 1, 6: two iterations
        engine.compile_for_loop(
            compile_access_constant(1.0),
            Some(compile_access_constant(5.0)),
            Some(compile_access_constant(10.0)),
            block,
            false,
        );
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();
        assert_eq!(engine.turtle().x(), 2.0);
    }

    #[test]
    fn if_else_picks_a_branch() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();

        let then_block = engine.push_local_block_chunk();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 1.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_local_block_chunk();

        let else_block = engine.push_local_block_chunk();
        engine.compile_start_fn_call(forward, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 100.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(forward, args);
        engine.pop_local_block_chunk();

        engine.compile_if_statement(compile_access_constant(0.0), then_block, else_block);
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();
        assert_eq!(engine.turtle().x(), 100.0);
    }

    #[test]
    fn unique_increments() {
        let mut engine = engine();
        let forward = register_forward(&mut engine);

        let main = engine.push_user_chunk();
        for _ in 0..2 {
            engine.compile_start_fn_call(forward, false);
            let before = engine.get_frame_size();
            engine.compile_push_value(ValueDomain::Local, compile_unique_val_expr());
            let args = engine.get_frame_size() - before;
            engine.compile_call_fn(forward, args);
        }
        engine.pop_user_chunk();

        engine.execute_main(main).unwrap();

        // unique yields 1 then 2
        assert_eq!(engine.turtle().x(), 3.0);
    }

    #[test]
    fn runaway_recursion_is_reported() {
        let mut engine = engine();
        engine.set_recursion_limit(64);

        // f(n) { f 0 }
        let f = engine.push_user_chunk();
        engine.compile_add_param(1);
        engine.compile_start_fn_call(f, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 0.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(f, args);
        engine.pop_user_chunk();

        let main = engine.push_user_chunk();
        engine.compile_start_fn_call(f, false);
        let before = engine.get_frame_size();
        engine.compile_push_constant(ValueDomain::Local, 0.0);
        let args = engine.get_frame_size() - before;
        engine.compile_call_fn(f, args);
        engine.pop_user_chunk();

        let err = engine.execute_main(main).unwrap_err();
        assert!(matches!(err, ExecError::InfiniteRecursion));
    }

    #[test]
    fn turtle_errors_surface_with_backtrace() {
        let mut engine = engine();

        let pop = engine.push_builtin_chunk(0);
        engine.compile_turtle_cmd(TurtleCmd::Pop);
        engine.pop_builtin_chunk();

        let main = engine.push_user_chunk();
        engine.compile_start_fn_call(pop, false);
        engine.compile_call_fn(pop, StackSize::default());
        engine.pop_user_chunk();

        let err = engine.execute_main(main).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Turtle(turtlepath_turtle::TurtleError::EmptyTurtleStack)
        ));

        let (trace, description) = engine.get_backtrace();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].chunk_index, main);
        assert!(description.starts_with("stack["));
    }
}
