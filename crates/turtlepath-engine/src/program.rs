//! The compiled program: a vector of chunks, each holding the deferred
//! statements the parser compiled into it.
//!
//! Chunk index 0 is reserved (a placeholder), so 0 can mean "no else block"
//! in `If` and never aliases real code.

use crate::debug::NO_CHUNK;
use crate::stack::StackSize;
use crate::turtle_cmd::TurtleCmd;
use crate::Expr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueDomain {
    Global,
    Capture,
    Local,
}

#[derive(Clone, Copy, Debug)]
pub struct FunctionInfo {
    /// Local slots consumed by parameters: 1 per value, 2 per lambda.
    pub params_size: i32,

    /// Offset of this function's closure within the captures frame that was
    /// current when the closure was created; -1 when not a closure.
    pub closure_offset: i32,
}

impl FunctionInfo {
    fn new() -> Self {
        Self {
            params_size: 0,
            closure_offset: -1,
        }
    }

    pub fn is_closure(&self) -> bool {
        self.closure_offset >= 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalBlockInfo {
    /// How much of both stacks the block leaves behind, popped when the
    /// block returns. During parsing this temporarily holds the frame size
    /// at block entry.
    pub unwind_size: StackSize,
}

#[derive(Clone, Copy, Debug)]
pub enum ChunkInfo {
    BuiltinFunction(FunctionInfo),
    Function(FunctionInfo),
    LocalBlock(LocalBlockInfo),
}

pub struct Chunk {
    pub info: ChunkInfo,
    pub statements: Vec<Statement>,
}

impl Chunk {
    fn function() -> Self {
        Self {
            info: ChunkInfo::Function(FunctionInfo::new()),
            statements: Vec::new(),
        }
    }

    fn builtin(params_size: i32) -> Self {
        Self {
            info: ChunkInfo::BuiltinFunction(FunctionInfo {
                params_size,
                closure_offset: -1,
            }),
            statements: Vec::new(),
        }
    }

    fn local_block(entry_size: StackSize) -> Self {
        Self {
            info: ChunkInfo::LocalBlock(LocalBlockInfo {
                unwind_size: entry_size,
            }),
            statements: Vec::new(),
        }
    }

    pub fn is_call_frame(&self) -> bool {
        matches!(
            self.info,
            ChunkInfo::Function(_) | ChunkInfo::BuiltinFunction(_)
        )
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self.info, ChunkInfo::BuiltinFunction(_))
    }

    pub fn is_local_block(&self) -> bool {
        matches!(self.info, ChunkInfo::LocalBlock(_))
    }

    pub fn fn_info(&self) -> &FunctionInfo {
        match &self.info {
            ChunkInfo::Function(f) | ChunkInfo::BuiltinFunction(f) => f,
            ChunkInfo::LocalBlock(_) => panic!("chunk is not a function"),
        }
    }

    pub fn fn_info_mut(&mut self) -> &mut FunctionInfo {
        match &mut self.info {
            ChunkInfo::Function(f) | ChunkInfo::BuiltinFunction(f) => f,
            ChunkInfo::LocalBlock(_) => panic!("chunk is not a function"),
        }
    }

    pub fn block_info(&self) -> &LocalBlockInfo {
        match &self.info {
            ChunkInfo::LocalBlock(b) => b,
            _ => panic!("chunk is not a local block"),
        }
    }

    pub fn block_info_mut(&mut self) -> &mut LocalBlockInfo {
        match &mut self.info {
            ChunkInfo::LocalBlock(b) => b,
            _ => panic!("chunk is not a local block"),
        }
    }

    pub fn is_closure(&self) -> bool {
        match &self.info {
            ChunkInfo::Function(f) | ChunkInfo::BuiltinFunction(f) => f.is_closure(),
            ChunkInfo::LocalBlock(_) => false,
        }
    }
}

/// One deferred action. Built once during parsing, never mutated after the
/// owning chunk closes. References to other chunks are by index.
pub enum Statement {
    /// Evaluate and push one value.
    PushValue { dest: ValueDomain, expr: Expr },

    /// Push a known constant.
    PushConstant { dest: ValueDomain, value: f64 },

    /// Copy `size` consecutive slots from one domain to the top of another.
    PushCopy {
        dest: ValueDomain,
        source: ValueDomain,
        offset: i32,
        size: i32,
    },

    /// Push a function value: its chunk index, then its closure position on
    /// the captures stack (0 when the function captures nothing).
    PushLambda {
        dest: ValueDomain,
        fn_index: usize,
        self_recursion: bool,
    },

    /// Before a direct call: push the callee's closure position, if the
    /// callee turns out to be a closure.
    StartFnCall {
        fn_index: usize,
        self_recursion: bool,
    },

    /// The direct call itself.
    CallFn { fn_index: usize, args_size: StackSize },

    /// Before a call through a lambda slot: re-push the closure-position
    /// word stored alongside the lambda reference.
    StartLambdaCall { source: ValueDomain, offset: i32 },

    /// Call through a lambda slot: the chunk index lives in the slot itself.
    CallLambdaFn {
        source: ValueDomain,
        offset: i32,
        args_size: StackSize,
    },

    If {
        condition: Expr,
        then_block: usize,
        /// 0 = no else block (chunk 0 is reserved).
        else_block: usize,
    },

    For {
        start: Expr,
        step: Option<Expr>,
        end: Option<Expr>,
        block: usize,
        named_var: bool,
    },

    Breakpoint,

    /// Builtin command body: evaluate the parameter slots, call the turtle.
    Turtle { cmd: TurtleCmd, args: Vec<Expr> },
}

/// The ordered chunk table.
pub struct Program {
    chunks: Vec<Chunk>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        // Reserve index 0 so it can act as the "no chunk" sentinel inside
        // statements.
        Self {
            chunks: vec![Chunk::local_block(StackSize::default())],
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, index: usize) -> &Chunk {
        debug_assert!(index != NO_CHUNK);
        &self.chunks[index]
    }

    pub fn chunk_mut(&mut self, index: usize) -> &mut Chunk {
        debug_assert!(index != NO_CHUNK);
        &mut self.chunks[index]
    }

    pub fn push_function(&mut self) -> usize {
        self.push(Chunk::function())
    }

    pub fn push_builtin(&mut self, params_size: i32) -> usize {
        self.push(Chunk::builtin(params_size))
    }

    pub fn push_local_block(&mut self, entry_size: StackSize) -> usize {
        self.push(Chunk::local_block(entry_size))
    }

    fn push(&mut self, chunk: Chunk) -> usize {
        self.chunks.push(chunk);
        self.chunks.len() - 1
    }
}
