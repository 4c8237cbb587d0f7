//! The turtlepath parser.
//!
//! Single-pass: statements compile into engine chunks as they parse; there
//! is no whole-program AST. Expressions are the exception: they build
//! [`AstNode`] values (constant-folded as they go) which the statement
//! parsers hand straight to the engine.
//!
//! The interesting machinery is name resolution. Every name use classifies
//! the definition against the innermost function being defined: *global*
//! (depth ≤ 1, absolute slot), *local* (this function's frame, including
//! self-recursion), or *capture* (an enclosing function's local). Captures
//! are appended to the current function's capture list as they are
//! discovered, and when a function definition closes, the copies compiled
//! for its closure resolve against the now-enclosing function: which is
//! how captures cascade outward exactly one nesting level at a time.
//!
//! Errors are reported through the diagnostic sink and parsing continues
//! wherever it can; a statement that cannot continue raises an internal
//! panic value that `parse_statement` turns into a resynchronization scan.

mod builtins;
mod names;
mod signature;

pub use names::{Context, FnData, NameDef, NameKind, NameRef};
pub use signature::FnSignature;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use turtlepath_ast::{
    create_binary_op_expr, create_conditional_expr, create_prefix_op_expr, AstNode,
};
use turtlepath_diagnostics::{Diagnostic, Location, Severity, SharedSink, Span};
use turtlepath_engine::{
    compile_access_value, compile_turtle_dir_expr, compile_turtle_x_expr, compile_turtle_y_expr,
    compile_unique_val_expr, Engine, ParserDebugSink, SourceLocation, ValueDomain, NO_CHUNK,
};
use turtlepath_lexer::{
    Lexer, Token, TokenCode, TK_BANG, TK_BREAKPOINT, TK_COLON, TK_DEF, TK_ELSE, TK_EOF,
    TK_EQUALS, TK_EQ_ARROW, TK_FOR, TK_IDENTIFIER, TK_IF, TK_IMPORT, TK_INTEGER, TK_LCURLY,
    TK_LPAREN, TK_MINUS, TK_NONE, TK_NUMBER, TK_PERIOD, TK_PLUS, TK_QUESTION, TK_RCURLY,
    TK_RPAREN, TK_STRING, TK_TURTLE, TK_TWO_DOTS, TK_UNIQUE, TK_UNTERMINATED_STRING,
    WEAKEST_PRECEDENCE,
};

use builtins::BUILTIN_COMMANDS;
use names::LexicalContextStack;

const MAX_EXPR_DEPTH: usize = 2000;
const NO_FILE: usize = usize::MAX;

type SharedParserSink = Rc<RefCell<dyn ParserDebugSink>>;

// ===================== Parse panics =====================

/// A statement-level bailout. Carries an optional message; a silent panic
/// means the error was already reported at the point of failure.
struct ParsePanic {
    message: Option<String>,
}

impl ParsePanic {
    fn silent() -> Self {
        Self { message: None }
    }

    fn msg(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

type PResult<T> = Result<T, ParsePanic>;

// ===================== File map =====================

struct FileEntry {
    filename: String,
    global_context: Context,
}

/// Shared across one import chain, so a file is parsed at most once per
/// top-level parse and its exported global context can be merged later.
#[derive(Default)]
struct FileMap {
    by_id: Vec<FileEntry>,
    by_name: FxHashMap<String, usize>,
}

impl FileMap {
    /// Returns (file id, is_new).
    fn add_file(&mut self, name: &str) -> (usize, bool) {
        if let Some(&id) = self.by_name.get(name) {
            return (id, false);
        }

        let id = self.by_id.len();
        self.by_name.insert(name.to_string(), id);
        self.by_id.push(FileEntry {
            filename: name.to_string(),
            global_context: Context::new(),
        });

        (id, true)
    }

    fn filename_of(&self, id: usize) -> String {
        self.by_id[id].filename.clone()
    }

    fn set_global_context(&mut self, id: usize, context: Context) {
        debug_assert!(self.by_id[id].global_context.is_empty());
        self.by_id[id].global_context = context;
    }

    fn global_context_of(&self, id: usize) -> Context {
        self.by_id[id].global_context.clone()
    }
}

fn anonymous_name(loc: Location) -> String {
    format!("!anonymous@{}:{}", loc.line, loc.col)
}

fn error_name(loc: Location) -> String {
    format!("!error@{}:{}", loc.line, loc.col)
}

fn empty_token() -> Token {
    Token {
        code: TK_NONE,
        text: String::new(),
        span: Span::default(),
    }
}

// ===================== Parser =====================

pub struct Parser<'src, 'e> {
    lexer: Lexer<'src>,
    engine: &'e mut Engine,

    token: Token,
    lookahead: VecDeque<Token>,

    names: LexicalContextStack,
    builtins: FxHashMap<String, NameRef>,
    context_depth: i32,

    global_fn: Option<NameRef>,
    fn_def_stack: Vec<NameRef>,

    // Imported modules only allow declarations at the top level - no code.
    is_imported_module: bool,
    has_error: bool,

    current_file_id: usize,
    files: Rc<RefCell<FileMap>>,

    expr_depth: usize,

    sink: SharedSink,
    debugger: Option<SharedParserSink>,
}

impl<'src, 'e> Parser<'src, 'e> {
    pub fn new(
        source: &'src str,
        engine: &'e mut Engine,
        sink: SharedSink,
        debugger: Option<SharedParserSink>,
    ) -> Self {
        Self {
            lexer: Lexer::new(source),
            engine,
            token: empty_token(),
            lookahead: VecDeque::new(),
            names: LexicalContextStack::new(),
            builtins: FxHashMap::default(),
            context_depth: 0,
            global_fn: None,
            fn_def_stack: Vec::new(),
            is_imported_module: false,
            has_error: false,
            current_file_id: NO_FILE,
            files: Rc::new(RefCell::new(FileMap::default())),
            expr_depth: 0,
            sink,
            debugger,
        }
    }

    pub fn set_filename(&mut self, name: &str) {
        debug_assert!(self.current_file_id == NO_FILE);

        let (file_id, _is_new) = self.add_file(name);
        debug_assert!(_is_new);

        self.current_file_id = file_id;
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Chunk index of this file's top-level code.
    pub fn main_chunk(&self) -> usize {
        match &self.global_fn {
            Some(global) => global.borrow().chunk_index(),
            None => NO_CHUNK,
        }
    }

    pub fn parse(&mut self) {
        if self.current_file_id == NO_FILE {
            self.set_filename("");
        }

        // The context above global; builtins conceptually live here.
        self.names.push_context();

        self.consume(); // first token

        if !self.is_imported_module {
            self.define_builtin_names();
        }

        let global_fn = Rc::new(RefCell::new(NameDef::function()));
        self.global_fn = Some(global_fn.clone());

        self.enter_fn_def(&global_fn);

        self.parse_statement_list();

        if !self.is(TK_EOF) {
            self.unexpected();
        }

        self.store_global_context();

        self.exit_fn_def(&global_fn);

        debug_assert!(!global_fn.borrow().has_captures());
    }

    // ===================== Token plumbing =====================

    fn consume(&mut self) {
        self.token = match self.lookahead.pop_front() {
            Some(token) => token,
            None => self.lexer.next_token(),
        };
    }

    fn consume_if(&mut self, code: TokenCode) -> bool {
        if self.is(code) {
            self.consume();
            return true;
        }
        false
    }

    fn expect(&mut self, code: TokenCode) -> bool {
        if !self.is(code) {
            self.expected(code);
            return false;
        }
        true
    }

    fn require(&mut self, code: TokenCode) {
        self.expect(code);
        self.consume();
    }

    fn is(&self, code: TokenCode) -> bool {
        self.token.code == code
    }

    fn token_code(&self) -> TokenCode {
        self.token.code
    }

    fn token_loc(&self) -> Location {
        self.token.span.start
    }

    fn peek(&mut self, n: usize) -> TokenCode {
        if n == 0 {
            return self.token.code;
        }

        while self.lookahead.len() < n {
            let token = self.lexer.next_token();
            self.lookahead.push_back(token);
        }

        self.lookahead[n - 1].code
    }

    // ===================== Diagnostics =====================

    fn filename(&self) -> String {
        if self.current_file_id == NO_FILE {
            return String::new();
        }
        self.files.borrow().filename_of(self.current_file_id)
    }

    fn report(&mut self, severity: Severity, loc: Location, message: String) {
        if severity == Severity::Error {
            self.has_error = true;
        }

        let diag = Diagnostic::new(severity, self.filename(), loc, message);
        self.sink.borrow_mut().report(diag);
    }

    fn error(&mut self, message: impl Into<String>) {
        let loc = self.token_loc();
        self.error_at(loc, message);
    }

    fn error_at(&mut self, loc: Location, message: impl Into<String>) {
        self.report(Severity::Error, loc, message.into());
    }

    fn expected(&mut self, expected_code: TokenCode) {
        if expected_code == TK_STRING && self.is(TK_UNTERMINATED_STRING) {
            self.error("Unterminated string constant");
            return;
        }

        let mut found = if self.is(TK_UNTERMINATED_STRING) {
            "Unterminated string constant".to_string()
        } else {
            self.token.text.clone()
        };

        if found.is_empty() && !self.is(TK_UNTERMINATED_STRING) {
            found = self.lexer.table().description(self.token_code());
        }

        if expected_code != TK_NONE {
            let mut expected = self.lexer.table().description(expected_code);
            if expected.is_empty() {
                expected = "INTERNAL_ERROR_UNKNOWN_TOKEN".to_string();
            }
            self.error(format!("Expected {expected} but found {found}"));
        } else if self.is(TK_EOF) {
            self.error(format!("Unexpected {found}"));
        } else if self.is(TK_UNTERMINATED_STRING) {
            self.error("Unterminated quote pair");
        } else {
            self.error(format!("Unexpected token: {found}"));
        }
    }

    fn unexpected(&mut self) {
        self.expected(TK_NONE);
    }

    // ===================== Contexts and names =====================

    fn push_context(&mut self) {
        self.names.push_context();
        self.context_depth += 1;
    }

    fn pop_context(&mut self) {
        self.context_depth -= 1;
        self.names.pop_context();
    }

    fn disallow_statements_in_modules(&mut self) {
        if self.is_imported_module && self.context_depth == 1 {
            self.error("Statements are not allowed in imported modules");
        }
    }

    fn current_function(&self) -> NameRef {
        debug_assert!(!self.fn_def_stack.is_empty());
        self.fn_def_stack.last().cloned().unwrap_or_else(|| {
            unreachable!("no function is being defined");
        })
    }

    fn lookup_name(&self, name: &str) -> Option<NameRef> {
        self.names
            .lookup(name)
            .or_else(|| self.builtins.get(name).cloned())
    }

    /// Searches only the global scope, then builtins.
    pub fn lookup_global_name(&self, name: &str) -> Option<NameRef> {
        self.names
            .lookup_global(name)
            .or_else(|| self.builtins.get(name).cloned())
    }

    fn declare_name(&mut self, make: fn() -> NameDef, name: &str, loc: Location) -> NameRef {
        let depth = self.context_depth;

        if let Some(def) = self.names.define(name, make(), false) {
            def.borrow_mut().setup_decl(name, loc, depth);
            return def;
        }

        self.error_at(loc, format!("Name '{name}' is already defined"));

        let fallback = error_name(loc);
        let Some(def) = self.names.define(&fallback, make(), false) else {
            unreachable!("error name {fallback} is already defined");
        };

        def.borrow_mut().setup_decl(&fallback, loc, depth);
        def
    }

    // ===================== Name resolution =====================

    fn name_domain(&self, def: &NameRef) -> ValueDomain {
        debug_assert!(!self.fn_def_stack.is_empty());

        let depth = def.borrow().context_depth;

        // Builtins sit in a context *above* global, at depth zero, so both
        // 0 and 1 are "global".
        if depth <= 1 {
            return ValueDomain::Global;
        }

        let current = self.current_function();

        // Self-recursion counts as local: calling f from inside f's own
        // body needs no capture of f within itself.
        if Rc::ptr_eq(def, &current) {
            return ValueDomain::Local;
        }

        if depth > current.borrow().context_depth {
            return ValueDomain::Local;
        }

        // An outer function's local: must be captured.
        ValueDomain::Capture
    }

    fn is_self_recursion(&self, domain: ValueDomain, def: &NameRef) -> bool {
        domain == ValueDomain::Local && Rc::ptr_eq(def, &self.current_function())
    }

    /// Resolves a name to (domain, offset), adding it to the current
    /// function's capture list when the domain is Capture. Cascading happens
    /// because closure creation re-resolves captures after the defining
    /// function has been popped.
    fn locate_name(&mut self, def: &NameRef) -> (ValueDomain, i32) {
        let domain = self.name_domain(def);

        let mut offset = def.borrow().stack_offset;

        if !def.borrow().uninitialized {
            debug_assert!(!def.borrow().is_value() || offset >= 0);

            if domain == ValueDomain::Capture {
                let current = self.current_function();
                offset = add_capture(&current, def);
            }
        }

        (domain, offset)
    }

    fn compile_push_object(&mut self, def: &NameRef, dest: ValueDomain) {
        let (source, offset) = self.locate_name(def);

        let size = def.borrow().value_size();

        // A user function pushed from its defining scope gets a fresh
        // two-word reference; anything already materialized as slots (a
        // lambda parameter, or a captured function) is copied.
        if def.borrow().is_function() && source != ValueDomain::Capture {
            let index = def.borrow().chunk_index();
            let self_recursion = self.is_self_recursion(source, def);

            self.engine.compile_push_lambda(dest, index, self_recursion);
        } else {
            self.engine.compile_push_copy(dest, source, offset, size);
        }
    }

    fn compile_push_local(&mut self, def: &NameRef) {
        self.compile_push_object(def, ValueDomain::Local);
    }

    fn compile_push_capture(&mut self, def: &NameRef) {
        self.compile_push_object(def, ValueDomain::Capture);
    }

    // ===================== Block brackets =====================

    fn enter_fn_def(&mut self, fndef: &NameRef) -> usize {
        self.push_context();
        self.fn_def_stack.push(fndef.clone());

        let chunk_index = self.engine.push_user_chunk();
        fndef.borrow_mut().fn_data_mut().chunk_index = chunk_index;

        chunk_index
    }

    fn exit_fn_def(&mut self, fndef: &NameRef) {
        debug_assert!(Rc::ptr_eq(&self.current_function(), fndef));

        self.engine.pop_user_chunk();
        self.fn_def_stack.pop();
        self.pop_context();

        self.create_closure_object(fndef);
    }

    fn enter_local_block(&mut self) -> usize {
        self.push_context();
        self.engine.push_local_block_chunk()
    }

    fn exit_local_block(&mut self) {
        self.engine.pop_local_block_chunk();
        self.pop_context();
    }

    /// Closures are not heap objects: a closure is a run of values on the
    /// captures stack, pushed here, right after the function definition
    /// closes. Resolving each captured name in the *enclosing* scope is what
    /// cascades captures upward through intermediate functions.
    fn create_closure_object(&mut self, fndef: &NameRef) {
        if !fndef.borrow().has_captures() {
            return;
        }

        self.set_engine_loc("closure");

        self.engine.create_closure(fndef.borrow().chunk_index());

        let captures: Vec<NameRef> = fndef.borrow().captures().to_vec();
        for def in &captures {
            self.compile_push_capture(def);
        }
    }

    // ===================== Debug plumbing =====================

    fn set_engine_loc(&mut self, label: &'static str) {
        self.set_engine_loc_at(label, None);
    }

    fn set_engine_loc_at(&mut self, label: &'static str, loc: Option<Location>) {
        if let Some(debugger) = &self.debugger {
            let loc = loc.unwrap_or_else(|| self.token_loc());

            debugger.borrow_mut().set_source_location(
                SourceLocation {
                    file_id: self.current_file_id,
                    line: loc.line,
                    col: loc.col,
                },
                Some(label),
            );

            // The fake stack built during parsing then shows, per slot,
            // which source line pushed it.
            self.engine.set_parser_push_val(f64::from(loc.line));
        }
    }

    fn add_file(&mut self, name: &str) -> (usize, bool) {
        let (file_id, is_new) = self.files.borrow_mut().add_file(name);

        if is_new {
            if let Some(debugger) = &self.debugger {
                debugger.borrow_mut().add_source_file(file_id, name);
            }
        }

        (file_id, is_new)
    }

    // ===================== Expressions =====================

    fn enter_expr(&mut self) -> PResult<()> {
        self.expr_depth += 1;
        if self.expr_depth >= MAX_EXPR_DEPTH {
            self.expr_depth -= 1;
            return Err(ParsePanic::msg("Expression too complex to parse"));
        }
        Ok(())
    }

    fn convert_numerical_constant(&mut self) -> f64 {
        debug_assert!(self.is(TK_NUMBER) || self.is(TK_INTEGER));

        let text = self.token.text.clone();

        match text.parse::<f64>() {
            Ok(val) => val,
            Err(_) => {
                let loc = self.token_loc();
                self.error_at(loc, format!("Invalid number: '{text}'"));
                0.0
            }
        }
    }

    fn parse_named_value_expression(&mut self) -> AstNode {
        debug_assert!(self.is(TK_IDENTIFIER));

        let name = self.token.text.clone();
        let mut e = AstNode::Invalid;

        if let Some(def) = self.lookup_name(&name) {
            enum Usage {
                Constant(f64),
                Recursive,
                Slot,
                NotValue,
            }

            let usage = {
                let d = def.borrow();
                match &d.kind {
                    NameKind::Value { constant: Some(c) } => Usage::Constant(*c),
                    NameKind::Value { constant: None } if d.uninitialized => Usage::Recursive,
                    NameKind::Value { constant: None } => Usage::Slot,
                    _ => Usage::NotValue,
                }
            };

            match usage {
                Usage::Constant(val) => e = AstNode::Constant(val),
                Usage::Recursive => self.error(format!("Name '{name}' is recursively defined")),
                Usage::Slot => {
                    let (source, offset) = self.locate_name(&def);
                    e = AstNode::Deferred(compile_access_value(source, offset));
                }
                Usage::NotValue => self.error(format!("Name '{name}' is not a value")),
            }
        } else {
            self.error(format!("Undefined name: {name}"));
        }

        self.consume();

        if !e.is_valid() {
            // allow parsing to continue
            e = AstNode::Constant(0.0);
        }

        e
    }

    fn parse_turtle_expr(&mut self) -> AstNode {
        debug_assert!(self.is(TK_TURTLE));
        self.consume();

        let mut e = AstNode::Invalid;

        if self.consume_if(TK_PERIOD) {
            if self.is(TK_IDENTIFIER) {
                let name = self.token.text.clone();
                self.consume();

                e = match name.as_str() {
                    "x" => AstNode::Deferred(compile_turtle_x_expr()),
                    "y" => AstNode::Deferred(compile_turtle_y_expr()),
                    "dir" => AstNode::Deferred(compile_turtle_dir_expr()),
                    _ => AstNode::Invalid,
                };
            }
        } else if self.is(TK_NUMBER) && self.token.text.starts_with('.') {
            // error recovery - assume "turtle.7", aka "turtle .7"
            self.consume();
        }

        if !e.is_valid() {
            self.error("Expected turtle.x, turtle.y, or turtle.dir");
            e = AstNode::Constant(0.0); // dummy, to keep parsing
        }

        e
    }

    fn parse_prefix_expression(&mut self) -> PResult<AstNode> {
        self.enter_expr()?;
        let result = self.parse_prefix_expression_inner();
        self.expr_depth -= 1;
        result
    }

    fn parse_prefix_expression_inner(&mut self) -> PResult<AstNode> {
        let e = match self.token_code() {
            TK_LPAREN => {
                self.consume();
                let e = self.parse_expression(WEAKEST_PRECEDENCE)?;
                self.require(TK_RPAREN);
                e
            }

            TK_TURTLE => self.parse_turtle_expr(),

            TK_UNIQUE => {
                self.consume();
                AstNode::Deferred(compile_unique_val_expr())
            }

            TK_IDENTIFIER => self.parse_named_value_expression(),

            TK_NUMBER | TK_INTEGER => {
                let val = self.convert_numerical_constant();
                self.consume();
                AstNode::Constant(val)
            }

            // Unary plus: identity, at the same prefix precedence as minus.
            TK_PLUS => {
                let info = self.lexer.table().prefix_info(TK_PLUS);
                self.consume();
                self.parse_expression(info.precedence)?
            }

            TK_MINUS | TK_BANG => {
                let info = self.lexer.table().prefix_info(self.token_code());
                self.consume();
                let rhs = self.parse_expression(info.precedence)?;
                create_prefix_op_expr(info.code, rhs)
            }

            _ => {
                self.error("Expected an expression");
                AstNode::Invalid
            }
        };

        Ok(e)
    }

    fn parse_postfix_op_expression(
        &mut self,
        lhs: AstNode,
        op: TokenCode,
        precedence: i32,
    ) -> PResult<AstNode> {
        self.enter_expr()?;
        let result = self.parse_postfix_op_expression_inner(lhs, op, precedence);
        self.expr_depth -= 1;
        result
    }

    fn parse_postfix_op_expression_inner(
        &mut self,
        lhs: AstNode,
        op: TokenCode,
        precedence: i32,
    ) -> PResult<AstNode> {
        let e = match op {
            TK_QUESTION => {
                // C++ rule: the middle of ?: parses as if parenthesized.
                let rhs = self.parse_expression(WEAKEST_PRECEDENCE)?;
                self.require(TK_COLON);
                let third = self.parse_expression(precedence)?;
                create_conditional_expr(lhs, rhs, third)
            }

            _ => {
                let rhs = self.parse_expression(precedence)?;
                create_binary_op_expr(op, lhs, rhs)
            }
        };

        Ok(e)
    }

    fn parse_expression(&mut self, outer_precedence: i32) -> PResult<AstNode> {
        let mut expr = self.parse_prefix_expression()?;

        if expr.is_valid() {
            loop {
                let info = self.lexer.table().postfix_info(self.token_code());
                if !info.postfix_binds_more_tightly(outer_precedence) {
                    break;
                }

                self.consume();
                expr = self.parse_postfix_op_expression(expr, info.code, info.precedence)?;
            }
        }

        Ok(expr)
    }

    // ===================== Definitions =====================

    fn parse_value_definition(&mut self) -> PResult<()> {
        debug_assert!(self.is(TK_IDENTIFIER));

        self.set_engine_loc("alias");

        let name = self.token.text.clone();
        let loc = self.token_loc();
        let def = self.declare_name(NameDef::value, &name, loc);

        self.consume();
        self.require(TK_EQUALS);

        def.borrow_mut().uninitialized = true;
        let e = self.parse_prefix_expression()?;
        def.borrow_mut().uninitialized = false;

        match e {
            AstNode::Constant(val) => def.borrow_mut().set_constant(val),

            AstNode::Deferred(expr) => {
                self.disallow_statements_in_modules();

                let offset = self.engine.compile_push_value(ValueDomain::Local, expr);
                def.borrow_mut().set_stack_offset(offset);
            }

            AstNode::Invalid => {
                // Error already reported; keep the slot layout consistent.
                self.disallow_statements_in_modules();

                let offset = self.engine.compile_push_constant(ValueDomain::Local, 0.0);
                def.borrow_mut().set_stack_offset(offset);
            }
        }

        Ok(())
    }

    fn parse_lambda_param_signature(
        &mut self,
        signature: &mut FnSignature,
        description: &mut String,
    ) -> PResult<()> {
        let mut depth = 1;

        while depth > 0 {
            match self.token_code() {
                TK_IDENTIFIER => {
                    if !description.ends_with('(') {
                        description.push(' ');
                    }
                    description.push_str(&self.token.text);
                    self.consume();

                    if self.consume_if(TK_LPAREN) {
                        description.push('(');
                        signature.start_lambda_param();
                        depth += 1;
                    } else {
                        signature.add_value_param();
                    }
                }

                TK_RPAREN => {
                    if depth > 1 {
                        self.consume();
                        signature.finish_lambda_param();
                        description.push(')');
                    }
                    depth -= 1;
                }

                _ => {
                    self.error("Expected an identifier or ')'");
                    self.synchronize_for_fn_params()?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn parse_param_def(&mut self, fndef: &NameRef) -> PResult<()> {
        debug_assert!(self.is(TK_IDENTIFIER));

        self.set_engine_loc("fnparams");

        let name = self.token.text.clone();
        let loc = self.token_loc();

        let mut param_size = 1;

        self.consume();

        let mut description = name.clone();

        let param_def;

        if self.consume_if(TK_LPAREN) {
            fndef
                .borrow_mut()
                .fn_data_mut()
                .signature
                .start_lambda_param();
            description.push('(');

            let lambda_def = self.declare_name(NameDef::lambda_parameter, &name, loc);

            let mut lambda_sig = FnSignature::default();
            self.parse_lambda_param_signature(&mut lambda_sig, &mut description)?;

            self.require(TK_RPAREN);

            {
                let mut f = fndef.borrow_mut();
                let data = f.fn_data_mut();
                data.signature.add_signature(&lambda_sig);
                data.signature.finish_lambda_param();
            }

            description.push(')');

            lambda_def.borrow_mut().fn_data_mut().signature = lambda_sig;
            param_def = lambda_def;

            // A lambda param needs room for the closure position too.
            param_size += 1;
        } else {
            param_def = self.declare_name(NameDef::value, &name, loc);
            fndef.borrow_mut().fn_data_mut().signature.add_value_param();
        }

        fndef
            .borrow_mut()
            .fn_data_mut()
            .param_names
            .push(description);

        let offset = self.engine.compile_add_param(param_size);
        param_def.borrow_mut().set_stack_offset(offset);

        Ok(())
    }

    fn parse_fn_params(&mut self, fndef: &NameRef) -> PResult<()> {
        self.require(TK_LPAREN);

        while !self.is(TK_RPAREN) {
            match self.token_code() {
                TK_IDENTIFIER => self.parse_param_def(fndef)?,

                _ => {
                    self.error("Expected an identifier or ')'");
                    self.synchronize_for_fn_params()?;
                    return Ok(());
                }
            }
        }

        self.require(TK_RPAREN);
        Ok(())
    }

    fn parse_fn_definition(&mut self, name: &str, loc: Location) -> PResult<()> {
        self.set_engine_loc_at("fndef", Some(loc));

        let fndef = self.declare_name(NameDef::function, name, loc);

        self.enter_fn_def(&fndef);
        let body = self.parse_fn_def_body(&fndef);
        self.exit_fn_def(&fndef);
        body?;

        self.require(TK_RCURLY);

        self.set_engine_loc("fnafter");
        Ok(())
    }

    fn parse_fn_def_body(&mut self, fndef: &NameRef) -> PResult<()> {
        self.parse_fn_params(fndef)?;

        self.set_engine_loc("fnbody");
        self.require(TK_LCURLY);

        self.parse_statement_list();

        self.set_engine_loc("fnend");
        Ok(())
    }

    fn parse_anonymous_fn_definition(&mut self, loc: Location) -> PResult<Option<NameRef>> {
        self.set_engine_loc_at("anonfn", Some(loc));

        if !self.consume_if(TK_LCURLY) {
            return Ok(None);
        }

        let name = anonymous_name(loc);
        let fndef = self.declare_name(NameDef::function, &name, loc);

        self.enter_fn_def(&fndef);
        let body = self.parse_anonymous_body(&fndef);
        self.set_engine_loc("anonend");
        self.exit_fn_def(&fndef);
        body?;

        self.require(TK_RCURLY);

        self.set_engine_loc("anonafter");
        Ok(Some(fndef))
    }

    fn parse_anonymous_body(&mut self, fndef: &NameRef) -> PResult<()> {
        if self.consume_if(TK_EQ_ARROW) {
            self.parse_fn_params(fndef)?;
        }

        self.parse_statement_list();
        Ok(())
    }

    fn parse_definition(&mut self) -> PResult<()> {
        // for now, only function definitions are allowed
        self.expect(TK_IDENTIFIER);

        let name = self.token.text.clone();
        let loc = self.token_loc();

        self.consume();

        self.parse_fn_definition(&name, loc)
    }

    // ===================== Calls =====================

    fn parse_argument(
        &mut self,
        fndef: &NameRef,
        param_index: usize,
        checker: &mut signature::TypeChecker<'_>,
    ) -> PResult<bool> {
        let mut found = true;

        if checker.consume_value() {
            match self.parse_prefix_expression()? {
                AstNode::Constant(val) => {
                    self.engine.compile_push_constant(ValueDomain::Local, val);
                }
                AstNode::Deferred(expr) => {
                    self.engine.compile_push_value(ValueDomain::Local, expr);
                }
                AstNode::Invalid => found = false,
            }
        } else if checker.consume_lambda_start() {
            let err_loc = self.token_loc();
            let mut lambda_fn: Option<NameRef> = None;

            if self.is(TK_IDENTIFIER) {
                let name = self.token.text.clone();

                match self.lookup_name(&name) {
                    None => self.error_at(err_loc, format!("Undefined name: {name}")),
                    Some(def) => {
                        if def.borrow().is_function_like() {
                            lambda_fn = Some(def);
                        }
                    }
                }

                self.consume();
            } else if self.is(TK_LCURLY) {
                let loc = self.token_loc();
                lambda_fn = self.parse_anonymous_fn_definition(loc)?;
                debug_assert!(lambda_fn.is_some());
            } else if !self.parse_expression(WEAKEST_PRECEDENCE)?.is_valid() {
                // not a function - attempt to recover
                found = false;
            }

            if let Some(lambda) = &lambda_fn {
                let sig = lambda.borrow().fn_data().signature.clone();

                if !checker.consume_lambda_sig(&sig) {
                    let msg = format!(
                        "Function signature of '{}' does not match parameter {} ('{}') in call to {}()",
                        lambda.borrow().name,
                        param_index + 1,
                        fndef.borrow().param_name(param_index),
                        fndef.borrow().name,
                    );
                    self.error_at(err_loc, msg);
                }

                self.compile_push_local(lambda);
            } else {
                let msg = format!(
                    "Expected a function name or anonymous function for parameter {} ('{}') in call to {}()",
                    param_index + 1,
                    fndef.borrow().param_name(param_index),
                    fndef.borrow().name,
                );
                self.error_at(err_loc, msg);
            }

            checker.consume_lambda_end();
        } else {
            unreachable!("expected function parameter was not a value or lambda");
        }

        Ok(found)
    }

    fn parse_fn_call_arguments(&mut self, fndef: &NameRef) -> PResult<()> {
        let sig = fndef.borrow().fn_data().signature.clone();
        let mut checker = sig.checker();

        let mut param_index = 0;

        while checker.more() {
            self.set_engine_loc("fnarg");

            if !self.parse_argument(fndef, param_index, &mut checker)? {
                break;
            }

            param_index += 1;
        }

        if checker.more() {
            let msg = format!(
                "Missing parameter {} ('{}') in call to {}()",
                param_index + 1,
                fndef.borrow().param_name(param_index),
                fndef.borrow().name,
            );
            self.error(msg);
        }

        Ok(())
    }

    fn parse_fn_call(&mut self, fndef: &NameRef, loc: Location) -> PResult<()> {
        let (source, offset) = self.locate_name(fndef);

        let is_lambda_param = matches!(fndef.borrow().kind, NameKind::LambdaParameter { .. });
        let is_lambda_call = source == ValueDomain::Capture || is_lambda_param;

        debug_assert!(is_lambda_call || fndef.borrow().is_function());

        if is_lambda_call {
            self.engine.compile_start_lambda_call(source, offset);
        } else {
            let self_recursion = self.is_self_recursion(source, fndef);
            self.engine
                .compile_start_fn_call(fndef.borrow().chunk_index(), self_recursion);
        }

        let original_frame_size = self.engine.get_frame_size();

        self.parse_fn_call_arguments(fndef)?;

        self.set_engine_loc_at("fncall", Some(loc));

        let args_size = self.engine.get_frame_size() - original_frame_size;

        if is_lambda_call {
            self.engine.compile_call_lambda_fn(source, offset, args_size);
        } else {
            self.engine
                .compile_call_fn(fndef.borrow().chunk_index(), args_size);
        }

        Ok(())
    }

    fn parse_command_statement(&mut self) -> PResult<()> {
        debug_assert!(self.is(TK_IDENTIFIER));

        self.set_engine_loc("cmd");

        let name = self.token.text.clone();
        let loc = self.token_loc();

        let Some(def) = self.lookup_name(&name) else {
            self.error(format!("Name '{name}' is undefined"));
            return Err(ParsePanic::silent());
        };

        self.consume(); // the name

        if !def.borrow().is_function_like() {
            return Err(ParsePanic::msg(format!(
                "Name '{name}' is not a command or lambda function"
            )));
        }

        self.parse_fn_call(&def, loc)
    }

    // ===================== Error recovery =====================

    fn discard_matched_parens(&mut self) {
        if self.consume_if(TK_LPAREN) {
            while !self.is(TK_EOF) && !self.consume_if(TK_RPAREN) {
                if self.is(TK_LPAREN) {
                    self.discard_matched_parens();
                } else {
                    self.consume();
                }
            }
        }
    }

    fn synchronize_after_panic(&mut self) {
        while !self.is(TK_EOF) {
            match self.token_code() {
                TK_IMPORT | TK_DEF | TK_IF | TK_FOR | TK_BREAKPOINT | TK_RCURLY => return,
                _ => self.consume(),
            }
        }
    }

    fn synchronize_for_fn_params(&mut self) -> PResult<()> {
        while !self.is(TK_EOF) && !self.is(TK_RPAREN) {
            match self.token_code() {
                TK_IMPORT | TK_DEF | TK_IF | TK_FOR | TK_BREAKPOINT | TK_RCURLY => {
                    return Err(ParsePanic::silent()); // error already reported
                }

                // assuming a missing ')' - this is the function body
                TK_LCURLY => return Ok(()),

                _ => self.consume(),
            }
        }

        self.consume_if(TK_RPAREN);
        Ok(())
    }

    fn reject_lambda_signature(&mut self) {
        if self.is(TK_EQ_ARROW) {
            self.error("Lambda signature not allowed here");
            self.consume();

            if self.is(TK_LPAREN) {
                self.discard_matched_parens();
            }
        }
    }

    // ===================== Statements =====================

    fn parse_statement_or_block(&mut self) {
        if self.consume_if(TK_LCURLY) {
            self.reject_lambda_signature();
            self.parse_statement_list();
            self.require(TK_RCURLY);
        } else {
            self.parse_statement();
        }
    }

    fn parse_local_body(&mut self, loop_var: Option<(String, Location)>) -> usize {
        let chunk_index = self.enter_local_block();

        if let Some((name, loc)) = loop_var {
            let def = self.declare_name(NameDef::value, &name, loc);

            let offset = self.engine.compile_named_loop_var();
            def.borrow_mut().set_stack_offset(offset);
        }

        self.parse_statement_or_block();

        self.exit_local_block();

        chunk_index
    }

    fn parse_for_statement_body(&mut self) -> PResult<()> {
        let loc = self.token_loc();

        let mut loop_var = None;

        if self.is(TK_IDENTIFIER) && self.peek(1) == TK_EQUALS {
            loop_var = Some((self.token.text.clone(), loc));
            self.consume();
            self.consume();
        }

        let constraint_loc = self.token_loc();

        let mut step = None;
        let mut end = None;
        let mut failed = false;

        let start = self.parse_expression(WEAKEST_PRECEDENCE)?;

        if !start.is_valid() {
            failed = true;
        } else if self.consume_if(TK_TWO_DOTS) {
            let second = self.parse_expression(WEAKEST_PRECEDENCE)?;

            if !second.is_valid() {
                failed = true;
            } else if self.consume_if(TK_TWO_DOTS) {
                step = Some(second);

                let third = self.parse_expression(WEAKEST_PRECEDENCE)?;
                if third.is_valid() {
                    end = Some(third);
                } else {
                    failed = true;
                }
            } else {
                // one '..': the second expression is the end
                end = Some(second);
            }
        } else if loop_var.is_some() {
            self.error_at(
                constraint_loc,
                "When naming a loop variable, the loop must use '..', \
                 as in 'for l = 1..8' (or '1..2..8')",
            );
        }

        if failed {
            while self.consume_if(TK_TWO_DOTS) {
                self.parse_expression(WEAKEST_PRECEDENCE)?;
            }

            if self.is(TK_LCURLY) {
                self.parse_local_body(loop_var);
            }

            return Ok(());
        }

        let named = loop_var.is_some();
        let chunk_index = self.parse_local_body(loop_var);

        self.set_engine_loc_at("for", Some(loc));

        let start = start.to_expr().unwrap_or_else(|| unreachable!());
        let step = step.and_then(|s| s.to_expr());
        let end = end.and_then(|e| e.to_expr());

        self.engine
            .compile_for_loop(start, step, end, chunk_index, named);

        Ok(())
    }

    fn parse_if_statement(&mut self) -> PResult<()> {
        debug_assert!(self.is(TK_IF));
        self.consume();

        let condition = self.parse_expression(WEAKEST_PRECEDENCE)?;
        let failed = !condition.is_valid();

        let mut if_body = 0;
        let mut else_body = 0;

        if !failed || self.is(TK_LCURLY) {
            if_body = self.parse_local_body(None);
        }

        if self.consume_if(TK_ELSE) {
            else_body = self.parse_local_body(None);
        }

        if !failed && if_body != 0 {
            let condition = condition.to_expr().unwrap_or_else(|| unreachable!());
            self.engine.compile_if_statement(condition, if_body, else_body);
        }

        Ok(())
    }

    fn parse_statement(&mut self) {
        self.set_engine_loc("stmt");

        if let Err(panic) = self.parse_statement_inner() {
            if let Some(message) = panic.message {
                self.error(message);
            }

            self.synchronize_after_panic();
        }
    }

    fn parse_statement_inner(&mut self) -> PResult<()> {
        match self.token_code() {
            TK_IMPORT => self.parse_import_statement(),

            TK_DEF => {
                self.consume();
                self.parse_definition()
            }

            TK_IF => {
                self.disallow_statements_in_modules();
                self.parse_if_statement()
            }

            TK_FOR => {
                self.disallow_statements_in_modules();
                self.consume();
                self.parse_for_statement_body()
            }

            TK_BREAKPOINT => {
                self.consume();
                self.engine.compile_breakpoint();
                Ok(())
            }

            TK_IDENTIFIER => {
                if self.peek(1) == TK_EQUALS {
                    self.parse_value_definition()
                } else {
                    self.disallow_statements_in_modules();
                    self.parse_command_statement()
                }
            }

            _ => Err(ParsePanic::msg("Unrecognized statement")),
        }
    }

    fn parse_statement_list(&mut self) {
        while !self.is(TK_EOF) {
            if self.is(TK_RCURLY) {
                if self.context_depth == 1 {
                    // a stray '}' at the global level
                    self.unexpected();
                    self.consume();
                } else {
                    break;
                }
            }

            self.parse_statement();
        }
    }

    // ===================== Imports =====================

    fn unquote_token(&self) -> String {
        let text = &self.token.text;

        let mut chars = text.chars();
        let Some(quote) = chars.next() else {
            return String::new();
        };

        let mut out = String::new();

        while let Some(ch) = chars.next() {
            if ch == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if ch == quote {
                break;
            } else {
                out.push(ch);
            }
        }

        out
    }

    fn parse_import_statement(&mut self) -> PResult<()> {
        let allowed = self.context_depth == 1;

        if !allowed {
            self.error("Import statements are only allowed at the global level");
        }

        self.consume(); // 'import'

        self.expect(TK_STRING);

        let filename = self.unquote_token();

        if filename.is_empty() {
            self.error("Empty import module name");
        } else if allowed {
            let (file_id, is_new) = self.add_file(&filename);

            if is_new {
                match std::fs::read_to_string(&filename) {
                    Err(err) => self.error(format!("Importing {filename}: {err}")),

                    Ok(source) => {
                        self.import_module(&source, file_id);
                        self.import_names(file_id);
                    }
                }
            }
        }

        self.consume(); // the filename
        Ok(())
    }

    fn import_module(&mut self, source: &str, file_id: usize) {
        log::debug!("parsing imported module (file id {file_id})");

        let mut sub = Parser {
            lexer: Lexer::new(source),
            engine: &mut *self.engine,
            token: empty_token(),
            lookahead: VecDeque::new(),
            names: LexicalContextStack::new(),
            builtins: self.builtins.clone(),
            context_depth: 0,
            global_fn: None,
            fn_def_stack: Vec::new(),
            is_imported_module: true,
            has_error: false,
            current_file_id: file_id,
            files: self.files.clone(),
            expr_depth: 0,
            sink: self.sink.clone(),
            debugger: self.debugger.clone(),
        };

        sub.parse();

        if sub.has_error() {
            self.has_error = true;
        }
    }

    fn import_names(&mut self, file_id: usize) {
        let context = self.files.borrow().global_context_of(file_id);

        let duplicates = self.names.import_names(&context);

        if !duplicates.is_empty() {
            let names = duplicates.join(" ");
            self.error(format!(
                "Some names were duplicates, and could not be imported: {names}"
            ));
        }
    }

    fn store_global_context(&mut self) {
        let context = self.names.extract_innermost();

        self.files
            .borrow_mut()
            .set_global_context(self.current_file_id, context);
    }

    // ===================== Builtins =====================

    fn define_builtin_names(&mut self) {
        for builtin in BUILTIN_COMMANDS {
            let mut def = NameDef::function();
            def.setup_builtin(builtin.name);

            {
                let data = def.fn_data_mut();
                for name in builtin.param_names {
                    // Lambda parameters are not allowed for builtins.
                    debug_assert!(!name.contains('('));
                    data.signature.add_value_param();
                    data.param_names.push((*name).to_string());
                }
            }

            let chunk_index = self.engine.push_builtin_chunk(builtin.param_names.len() as i32);
            self.engine.compile_turtle_cmd(builtin.cmd);
            self.engine.pop_builtin_chunk();

            def.fn_data_mut().chunk_index = chunk_index;

            let previous = self
                .builtins
                .insert(builtin.name.to_string(), Rc::new(RefCell::new(def)));
            debug_assert!(previous.is_none());
        }
    }
}

/// Appends `def` to `fndef`'s capture list unless already present, and
/// returns its offset within the closure: the sum of the value sizes of the
/// captures before it.
fn add_capture(fndef: &NameRef, def: &NameRef) -> i32 {
    debug_assert!(def.borrow().value_size() != 0);

    let mut offset = 0;
    let mut found = false;

    {
        let f = fndef.borrow();
        for capture in f.captures() {
            if Rc::ptr_eq(capture, def) {
                found = true;
                break;
            }
            offset += capture.borrow().value_size();
        }
    }

    if !found {
        fndef.borrow_mut().add_capture(def.clone());
    }

    offset
}
