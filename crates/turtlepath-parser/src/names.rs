//! Name records and the lexical context stack.
//!
//! A name is a value, a user-defined command function, or a lambda
//! parameter. Definitions are shared (`Rc<RefCell<_>>`) because a single
//! record accumulates state across parsing: the stack offset once bound, the
//! capture list as uses are discovered, and the chunk index once the body is
//! compiled. Identity (pointer equality) matters for self-recursion and for
//! capture de-duplication.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use turtlepath_diagnostics::Location;

use crate::signature::FnSignature;

pub type NameRef = Rc<RefCell<NameDef>>;

/// Contexts are ordered maps so module export and import-merge reporting are
/// deterministic.
pub type Context = BTreeMap<String, NameRef>;

#[derive(Default)]
pub struct FnData {
    pub signature: FnSignature,
    pub param_names: Vec<String>,
    pub chunk_index: usize,
}

pub enum NameKind {
    Value {
        constant: Option<f64>,
    },
    Function {
        data: FnData,
        captures: Vec<NameRef>,
    },
    LambdaParameter {
        data: FnData,
    },
}

pub struct NameDef {
    pub name: String,
    pub loc: Location,
    pub context_depth: i32,

    /// Runtime slot within the name's domain; -1 until bound. Lambda
    /// parameters have one too: they are value-like two-slot locals.
    pub stack_offset: i32,

    /// Set while the name's own defining expression parses, to reject
    /// self-referential folding.
    pub uninitialized: bool,

    pub kind: NameKind,
}

impl NameDef {
    fn new(kind: NameKind) -> Self {
        Self {
            name: String::new(),
            loc: Location::default(),
            context_depth: 0,
            stack_offset: -1,
            uninitialized: false,
            kind,
        }
    }

    pub fn value() -> Self {
        Self::new(NameKind::Value { constant: None })
    }

    pub fn function() -> Self {
        Self::new(NameKind::Function {
            data: FnData::default(),
            captures: Vec::new(),
        })
    }

    pub fn lambda_parameter() -> Self {
        Self::new(NameKind::LambdaParameter {
            data: FnData::default(),
        })
    }

    pub fn setup_decl(&mut self, name: &str, loc: Location, context_depth: i32) {
        self.name = name.to_string();
        self.loc = loc;
        self.context_depth = context_depth;
    }

    pub fn setup_builtin(&mut self, name: &str) {
        self.name = name.to_string();
        self.context_depth = 0; // builtins sit above the global context
    }

    // ---- classification ------------------------------------------------

    pub fn is_value(&self) -> bool {
        matches!(self.kind, NameKind::Value { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, NameKind::Function { .. })
    }

    pub fn is_function_like(&self) -> bool {
        matches!(
            self.kind,
            NameKind::Function { .. } | NameKind::LambdaParameter { .. }
        )
    }

    /// Slots this name occupies when pushed as a value: 1 for a plain value,
    /// 2 for anything callable (chunk index + closure position).
    /// Compile-time constants occupy none.
    pub fn value_size(&self) -> i32 {
        match &self.kind {
            NameKind::Value { constant: Some(_) } => 0,
            NameKind::Value { constant: None } => 1,
            NameKind::Function { .. } | NameKind::LambdaParameter { .. } => 2,
        }
    }

    // ---- value side ----------------------------------------------------

    pub fn constant(&self) -> Option<f64> {
        match &self.kind {
            NameKind::Value { constant } => *constant,
            _ => None,
        }
    }

    pub fn set_constant(&mut self, val: f64) {
        debug_assert!(self.stack_offset == -1);
        match &mut self.kind {
            NameKind::Value { constant } => *constant = Some(val),
            _ => unreachable!("only values fold to constants"),
        }
    }

    pub fn set_stack_offset(&mut self, offset: i32) {
        debug_assert!(self.stack_offset == -1);
        self.stack_offset = offset;
    }

    // ---- function side -------------------------------------------------

    pub fn fn_data(&self) -> &FnData {
        match &self.kind {
            NameKind::Function { data, .. } | NameKind::LambdaParameter { data } => data,
            NameKind::Value { .. } => unreachable!("name is not a function"),
        }
    }

    pub fn fn_data_mut(&mut self) -> &mut FnData {
        match &mut self.kind {
            NameKind::Function { data, .. } | NameKind::LambdaParameter { data } => data,
            NameKind::Value { .. } => unreachable!("name is not a function"),
        }
    }

    pub fn chunk_index(&self) -> usize {
        self.fn_data().chunk_index
    }

    pub fn param_name(&self, index: usize) -> &str {
        &self.fn_data().param_names[index]
    }

    // ---- captures (user functions only) --------------------------------

    pub fn captures(&self) -> &[NameRef] {
        match &self.kind {
            NameKind::Function { captures, .. } => captures,
            _ => &[],
        }
    }

    pub fn has_captures(&self) -> bool {
        !self.captures().is_empty()
    }

    pub fn add_capture(&mut self, capture: NameRef) {
        match &mut self.kind {
            NameKind::Function { captures, .. } => captures.push(capture),
            _ => unreachable!("only user functions carry captures"),
        }
    }
}

// ===================== Context stack =====================

/// Innermost-last stack of name contexts.
#[derive(Default)]
pub struct LexicalContextStack {
    stack: Vec<Context>,
}

impl LexicalContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_context(&mut self) {
        self.stack.push(Context::new());
    }

    pub fn pop_context(&mut self) {
        self.stack.pop();
    }

    /// Adds `def` to the innermost context. Returns `None` when the name is
    /// already defined there, unless `allow_redefine` is set, in which case
    /// the existing definition comes back instead.
    pub fn define(&mut self, name: &str, def: NameDef, allow_redefine: bool) -> Option<NameRef> {
        let context = self.stack.last_mut()?;

        if let Some(existing) = context.get(name) {
            if allow_redefine {
                return Some(existing.clone());
            }
            return None;
        }

        let def = Rc::new(RefCell::new(def));
        context.insert(name.to_string(), def.clone());
        Some(def)
    }

    /// Innermost-out search.
    pub fn lookup(&self, name: &str) -> Option<NameRef> {
        for context in self.stack.iter().rev() {
            if let Some(def) = context.get(name) {
                return Some(def.clone());
            }
        }
        None
    }

    /// Searches only the outermost user context (the file's global scope).
    pub fn lookup_global(&self, name: &str) -> Option<NameRef> {
        let context = match self.stack.len() {
            0 => return None,
            1 => &self.stack[0],
            _ => &self.stack[1],
        };
        context.get(name).cloned()
    }

    /// Pops and returns the innermost context; used to export a parsed
    /// module's global scope.
    pub fn extract_innermost(&mut self) -> Context {
        self.stack.pop().unwrap_or_default()
    }

    /// Copies every non-conflicting entry of `other` into the innermost
    /// context; returns the names that collided, in order.
    pub fn import_names(&mut self, other: &Context) -> Vec<String> {
        let Some(context) = self.stack.last_mut() else {
            return Vec::new();
        };

        let mut duplicates = Vec::new();

        for (name, def) in other {
            if context.contains_key(name) {
                duplicates.push(name.clone());
            } else {
                context.insert(name.clone(), def.clone());
            }
        }

        duplicates
    }
}
