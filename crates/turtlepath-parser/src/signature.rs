//! Function parameter signatures.
//!
//! A signature is a string over `v`, `(`, `)`:
//!
//! ```text
//! def fn(a b f1(c) f2(x y f3(z w))) { }   =>   "vv(v)(vv(vv))"
//! ```
//!
//! Each `v` is a value parameter; each balanced `(…)` is a lambda parameter
//! whose body is itself the lambda's signature. Lambda arguments are checked
//! structurally against the parameter's signature with a cursor pair.

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FnSignature {
    text: String,
}

impl FnSignature {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn add_value_param(&mut self) {
        self.text.push('v');
    }

    pub fn start_lambda_param(&mut self) {
        self.text.push('(');
    }

    pub fn finish_lambda_param(&mut self) {
        self.text.push(')');
    }

    pub fn add_signature(&mut self, other: &FnSignature) {
        self.text.push_str(&other.text);
    }

    pub fn checker(&self) -> TypeChecker<'_> {
        TypeChecker {
            bytes: self.text.as_bytes(),
            pos: 0,
            paren_depth: 0,
        }
    }
}

/// Walks a signature while call arguments parse, one parameter at a time.
pub struct TypeChecker<'a> {
    bytes: &'a [u8],
    pos: usize,
    paren_depth: i32,
}

impl TypeChecker<'_> {
    fn current(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) {
        match self.current() {
            Some(b'(') => self.paren_depth += 1,
            Some(b')') => self.paren_depth -= 1,
            _ => {}
        }
        self.pos += 1;
    }

    fn consume(&mut self, ch: u8) -> bool {
        if self.current() != Some(ch) {
            return false;
        }
        self.next();
        true
    }

    fn consume_same(&mut self, other: &mut TypeChecker<'_>) -> bool {
        match (self.current(), other.current()) {
            (Some(a), Some(b)) if a == b => {
                self.next();
                other.next();
                true
            }
            _ => false,
        }
    }

    pub fn more(&self) -> bool {
        self.current().is_some()
    }

    pub fn consume_value(&mut self) -> bool {
        self.consume(b'v')
    }

    pub fn consume_lambda_start(&mut self) -> bool {
        self.consume(b'(')
    }

    /// Structural compatibility: the argument's signature must match
    /// character-for-character until the argument's side ends. The argument
    /// is allowed to declare *fewer* parameters than the callee offers
    /// (extra arguments are discarded at the call), but not different ones.
    pub fn consume_lambda_sig(&mut self, sig: &FnSignature) -> bool {
        let mut other = sig.checker();

        while self.consume_same(&mut other) {}

        // Extra args on our side leave the cursor before ')', never past
        // the end of a well-formed signature.
        debug_assert!(self.more());

        !other.more()
    }

    /// Skips the rest of the lambda parameter, back out to depth zero.
    pub fn consume_lambda_end(&mut self) -> bool {
        debug_assert!(self.paren_depth > 0);

        while self.more() && self.paren_depth > 0 {
            self.next();
        }

        self.paren_depth == 0
    }
}
