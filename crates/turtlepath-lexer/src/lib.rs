//! Turtlepath lexer.
//!
//! Tokens are plain `i32` codes: every single-character punctuation token is
//! its own ASCII value (so `'('` the byte and `TK_LPAREN` the token are the
//! same number), a handful of small codes cover the literal-ish tokens
//! (numbers, strings, identifiers, `..`, `...`), and named tokens (keywords
//! and multi-character operators) start at 1000.
//!
//! The lexer produces one token at a time with a (line, column) span, and the
//! [`TokenTable`] carries everything the parser needs to know about a code:
//! its human-readable description, whether an identifier spelling is a
//! keyword, and its operator precedence in prefix and postfix position.

use rustc_hash::FxHashMap;
use turtlepath_diagnostics::{Location, Span};

// ===================== Token codes =====================

pub type TokenCode = i32;

pub const TK_EOF: TokenCode = -1;
pub const TK_NONE: TokenCode = 0;

pub const TK_STRING: TokenCode = 1;
pub const TK_UNTERMINATED_STRING: TokenCode = 2;
pub const TK_INTEGER: TokenCode = 3;
pub const TK_NUMBER: TokenCode = 4;
pub const TK_IDENTIFIER: TokenCode = 5;
pub const TK_TWO_DOTS: TokenCode = 6;
pub const TK_ELLIPSIS: TokenCode = 7;

// Single-character punctuation doubles as its own token code.
pub const TK_LPAREN: TokenCode = b'(' as TokenCode;
pub const TK_RPAREN: TokenCode = b')' as TokenCode;
pub const TK_LCURLY: TokenCode = b'{' as TokenCode;
pub const TK_RCURLY: TokenCode = b'}' as TokenCode;
pub const TK_EQUALS: TokenCode = b'=' as TokenCode;
pub const TK_PLUS: TokenCode = b'+' as TokenCode;
pub const TK_MINUS: TokenCode = b'-' as TokenCode;
pub const TK_STAR: TokenCode = b'*' as TokenCode;
pub const TK_SLASH: TokenCode = b'/' as TokenCode;
pub const TK_BANG: TokenCode = b'!' as TokenCode;
pub const TK_LT: TokenCode = b'<' as TokenCode;
pub const TK_GT: TokenCode = b'>' as TokenCode;
pub const TK_QUESTION: TokenCode = b'?' as TokenCode;
pub const TK_COLON: TokenCode = b':' as TokenCode;
pub const TK_PERIOD: TokenCode = b'.' as TokenCode;

// Named tokens: keywords first, then the multi-character operators.
pub const TK_IMPORT: TokenCode = 1000;
pub const TK_DEF: TokenCode = 1001;
pub const TK_IF: TokenCode = 1002;
pub const TK_ELSE: TokenCode = 1003;
pub const TK_FOR: TokenCode = 1004;
pub const TK_TURTLE: TokenCode = 1005;
pub const TK_UNIQUE: TokenCode = 1006;
pub const TK_BREAKPOINT: TokenCode = 1007;
pub const TK_EQ_ARROW: TokenCode = 1008;

pub const TK_EQUALITY: TokenCode = 1009;
pub const TK_INEQUALITY: TokenCode = 1010;
pub const TK_OR: TokenCode = 1011;
pub const TK_AND: TokenCode = 1012;
pub const TK_POW: TokenCode = 1013;
pub const TK_GE: TokenCode = 1014;
pub const TK_LE: TokenCode = 1015;

// ===================== Operator metadata =====================

/// Smaller precedence binds tighter; this is the "outer" value used to start
/// expression parsing, which nothing can fail to bind tighter than.
pub const WEAKEST_PRECEDENCE: i32 = i32::MAX;

/// What the Pratt loop needs to know about an operator occurrence.
/// A precedence of zero means "not an operator in this position".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpInfo {
    pub code: TokenCode,
    pub precedence: i32,
    pub left_to_right: bool,
}

impl OpInfo {
    pub fn is_op(&self) -> bool {
        self.precedence != 0
    }

    /// Decides whether a postfix/infix operator at this precedence binds more
    /// tightly than the enclosing context. Equal precedence binds only for
    /// right-to-left operators; this assumes associativity is uniform within
    /// a precedence level.
    pub fn postfix_binds_more_tightly(&self, outer_precedence: i32) -> bool {
        if self.precedence == 0 || self.precedence > outer_precedence {
            return false;
        }
        if self.precedence == outer_precedence && self.left_to_right {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug, Default)]
struct TokenInfo {
    code: TokenCode,
    description: String,
    prefix_precedence: i32,
    postfix_precedence: i32,
    postfix_left_to_right: bool,
}

/// Maps token codes to descriptions and operator metadata, and keyword
/// spellings back to codes.
#[derive(Default)]
pub struct TokenTable {
    infos: FxHashMap<TokenCode, TokenInfo>,
    keywords: FxHashMap<String, TokenCode>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_base_token(&mut self, code: TokenCode, description: &str) -> bool {
        let info = TokenInfo {
            code,
            description: description.to_string(),
            ..TokenInfo::default()
        };
        self.insert(info)
    }

    pub fn add_keyword(&mut self, code: TokenCode, text: &str) -> bool {
        if !self.add_base_token(code, text) {
            return false;
        }
        self.keywords.insert(text.to_string(), code).is_none()
    }

    pub fn add_operator(
        &mut self,
        code: TokenCode,
        text: &str,
        prefix_precedence: i32,
        postfix_precedence: i32,
        postfix_left_to_right: bool,
    ) -> bool {
        self.insert(TokenInfo {
            code,
            description: text.to_string(),
            prefix_precedence,
            postfix_precedence,
            postfix_left_to_right,
        })
    }

    fn insert(&mut self, info: TokenInfo) -> bool {
        let code = info.code;
        if self.infos.contains_key(&code) {
            return false;
        }
        self.infos.insert(code, info);
        true
    }

    pub fn translate_keyword(&self, text: &str) -> TokenCode {
        self.keywords.get(text).copied().unwrap_or(TK_NONE)
    }

    pub fn description(&self, code: TokenCode) -> String {
        if let Some(info) = self.infos.get(&code) {
            return info.description.clone();
        }
        if (0x20..0x7f).contains(&code) {
            return char::from(code as u8).to_string();
        }
        "INTERNAL_ERROR_MISSING_TOKEN_DESCRIPTION".to_string()
    }

    pub fn prefix_info(&self, code: TokenCode) -> OpInfo {
        match self.infos.get(&code) {
            Some(info) => OpInfo {
                code,
                precedence: info.prefix_precedence,
                left_to_right: false,
            },
            None => OpInfo {
                code,
                ..OpInfo::default()
            },
        }
    }

    pub fn postfix_info(&self, code: TokenCode) -> OpInfo {
        match self.infos.get(&code) {
            Some(info) => OpInfo {
                code,
                precedence: info.postfix_precedence,
                left_to_right: info.postfix_left_to_right,
            },
            None => OpInfo {
                code,
                ..OpInfo::default()
            },
        }
    }
}

// ===================== Tokens =====================

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub code: TokenCode,
    pub text: String,
    pub span: Span,
}

impl Token {
    pub fn loc(&self) -> Location {
        self.span.start
    }
}

// ===================== Lexer =====================

/// Hand-written single-pass lexer with one character of lookahead.
///
/// Owns the [`TokenTable`] so the parser has one place to ask about
/// descriptions and precedences.
pub struct Lexer<'src> {
    bytes: &'src [u8],
    pos: usize,
    line: u32,
    col: u32,
    table: TokenTable,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut lexer = Self {
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            table: TokenTable::new(),
        };
        lexer.register_tokens();
        lexer
    }

    pub fn table(&self) -> &TokenTable {
        &self.table
    }

    fn register_tokens(&mut self) {
        let t = &mut self.table;

        t.add_base_token(TK_EOF, "end of file");
        t.add_base_token(TK_IDENTIFIER, "an identifier");
        t.add_base_token(TK_STRING, "a string constant");
        t.add_base_token(TK_NUMBER, "a numerical constant");
        t.add_base_token(TK_INTEGER, "an integer");
        t.add_base_token(TK_TWO_DOTS, "..");
        t.add_base_token(TK_ELLIPSIS, "...");

        t.add_keyword(TK_IMPORT, "import");
        t.add_keyword(TK_DEF, "def");
        t.add_keyword(TK_IF, "if");
        t.add_keyword(TK_ELSE, "else");
        t.add_keyword(TK_FOR, "for");
        t.add_keyword(TK_TURTLE, "turtle");
        t.add_keyword(TK_UNIQUE, "unique");
        t.add_keyword(TK_BREAKPOINT, "breakpoint");

        // Recognized by the multi-char scan, registered here only so error
        // messages can spell it.
        t.add_keyword(TK_EQ_ARROW, "=>");

        // Prefix and postfix precedences, and postfix associativity. Prefix
        // operators are necessarily right-to-left, so only the postfix side
        // records associativity. Smaller binds tighter; these are the C++
        // precedence numbers, plus '**' which C++ does not have.
        //
        //                 operator           pre  post
        t.add_operator(TK_POW, "**", 0, 2, false);

        t.add_operator(TK_STAR, "*", 0, 5, true);
        t.add_operator(TK_SLASH, "/", 0, 5, true);

        t.add_operator(TK_PLUS, "+", 3, 6, true);
        t.add_operator(TK_MINUS, "-", 3, 6, true);

        t.add_operator(TK_BANG, "!", 3, 0, true);

        t.add_operator(TK_GT, ">", 0, 9, true);
        t.add_operator(TK_LT, "<", 0, 9, true);
        t.add_operator(TK_GE, ">=", 0, 9, true);
        t.add_operator(TK_LE, "<=", 0, 9, true);

        t.add_operator(TK_EQUALITY, "==", 0, 10, true);
        t.add_operator(TK_INEQUALITY, "!=", 0, 10, true);

        t.add_operator(TK_AND, "&&", 0, 14, true);

        t.add_operator(TK_OR, "||", 0, 15, true);

        t.add_operator(TK_QUESTION, "?", 0, 16, false);
    }

    // ---- cursor -------------------------------------------------------

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.bytes.get(self.pos + 1).copied()
    }

    fn is(&self, ch: u8) -> bool {
        self.peek() == Some(ch)
    }

    fn next_is(&self, ch: u8) -> bool {
        self.peek_next() == Some(ch)
    }

    fn next_is_digit(&self) -> bool {
        matches!(self.peek_next(), Some(b) if b.is_ascii_digit())
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn loc(&self) -> Location {
        Location::new(self.line, self.col)
    }

    fn advance(&mut self) {
        debug_assert!(!self.at_eof());
        if self.bytes[self.pos] == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
    }

    fn push(&mut self, text: &mut String, count: usize) {
        for _ in 0..count {
            text.push(self.bytes[self.pos] as char);
            self.advance();
        }
    }

    fn push_if(&mut self, text: &mut String, ch: u8) -> bool {
        if self.is(ch) {
            self.push(text, 1);
            return true;
        }
        false
    }

    // ---- whitespace and comments --------------------------------------

    fn discard_whitespace(&mut self) -> bool {
        match self.peek() {
            Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => {
                self.advance();
                true
            }
            Some(b'#') => {
                // shell-style comment, to end of line
                while !self.at_eof() && !self.is(b'\n') {
                    self.advance();
                }
                if !self.at_eof() {
                    self.advance();
                }
                true
            }
            _ => false,
        }
    }

    // ---- token scanners ------------------------------------------------

    fn scan_two_char(
        &mut self,
        text: &mut String,
        ch1: u8,
        ch2: u8,
        code: TokenCode,
    ) -> Option<TokenCode> {
        if self.is(ch1) && self.next_is(ch2) {
            self.push(text, 2);
            return Some(code);
        }
        None
    }

    fn scan_multichar_punctuation(&mut self, text: &mut String) -> Option<TokenCode> {
        self.scan_two_char(text, b'=', b'>', TK_EQ_ARROW)
            .or_else(|| self.scan_two_char(text, b'=', b'=', TK_EQUALITY))
            .or_else(|| self.scan_two_char(text, b'!', b'=', TK_INEQUALITY))
            .or_else(|| self.scan_two_char(text, b'|', b'|', TK_OR))
            .or_else(|| self.scan_two_char(text, b'&', b'&', TK_AND))
            .or_else(|| self.scan_two_char(text, b'>', b'=', TK_GE))
            .or_else(|| self.scan_two_char(text, b'<', b'=', TK_LE))
            .or_else(|| self.scan_two_char(text, b'*', b'*', TK_POW))
    }

    /// Numbers: `digits [. digits] [eE [-] digits]`, with a leading `.digit`
    /// allowed. `1..3` is an integer followed by `..` followed by an integer,
    /// so a dot only continues the number when the next byte is not a second
    /// dot. The scanned text is not guaranteed to convert ("1e-" scans); the
    /// numeric converter rejects it later.
    fn scan_number(&mut self, text: &mut String) -> Option<TokenCode> {
        let starts_number = matches!(self.peek(), Some(b) if b.is_ascii_digit())
            || (self.is(b'.') && self.next_is_digit());
        if !starts_number {
            return None;
        }

        let mut code = TK_INTEGER;

        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.push(text, 1);
        }

        if self.is(b'.') && !self.next_is(b'.') {
            self.push(text, 1);
            code = TK_NUMBER;
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.push(text, 1);
            }
        }

        if self.is(b'e') || self.is(b'E') {
            self.push(text, 1);
            code = TK_NUMBER;
            self.push_if(text, b'-');
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.push(text, 1);
            }
        }

        Some(code)
    }

    /// `'…'` and `"…"` with backslash passthrough; the quote character is
    /// kept as `text[0]` so the consumer can unquote. EOF before the closing
    /// quote yields [`TK_UNTERMINATED_STRING`].
    fn scan_string(&mut self, text: &mut String) -> Option<TokenCode> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return None,
        };

        self.push(text, 1); // the opening quote

        while !self.is(quote) {
            if self.is(b'\\') {
                self.push(text, 1);
            }
            if self.at_eof() {
                return Some(TK_UNTERMINATED_STRING);
            }
            self.push(text, 1);
        }

        self.push(text, 1); // the closing quote
        Some(TK_STRING)
    }

    fn scan_identifier(&mut self, text: &mut String) -> Option<TokenCode> {
        let starts_ident = matches!(self.peek(), Some(b) if b == b'_' || b.is_ascii_alphabetic());
        if !starts_ident {
            return None;
        }

        while matches!(self.peek(),
            Some(b) if b == b'_' || b.is_ascii_alphanumeric())
        {
            self.push(text, 1);
        }

        Some(TK_IDENTIFIER)
    }

    fn scan_punctuation(&mut self, text: &mut String) -> Option<TokenCode> {
        let b = self.peek()?;
        if !b.is_ascii_punctuation() {
            return None;
        }

        let mut code = b as TokenCode;
        self.push(text, 1);

        if code == TK_PERIOD && self.is(b'.') {
            self.push(text, 1);
            if self.is(b'.') {
                self.push(text, 1);
                code = TK_ELLIPSIS;
            } else {
                code = TK_TWO_DOTS;
            }
        }

        Some(code)
    }

    /// Scans the next token, skipping whitespace and comments first.
    pub fn next_token(&mut self) -> Token {
        self.next_token_skipping(true)
    }

    pub fn next_token_skipping(&mut self, skip_whitespace: bool) -> Token {
        if skip_whitespace {
            while self.discard_whitespace() {}
        }

        let start = self.loc();
        let mut text = String::new();

        let code = if self.at_eof() {
            TK_EOF
        } else {
            let scanned = self
                .scan_multichar_punctuation(&mut text)
                .or_else(|| self.scan_number(&mut text))
                .or_else(|| self.scan_string(&mut text))
                .or_else(|| self.scan_identifier(&mut text))
                .or_else(|| self.scan_punctuation(&mut text));

            match scanned {
                Some(TK_IDENTIFIER) => match self.table.translate_keyword(&text) {
                    TK_NONE => TK_IDENTIFIER,
                    keyword => keyword,
                },
                Some(code) => code,
                None => {
                    // Not a byte this language knows (say, the middle of a
                    // UTF-8 sequence). Hand it back as itself so the parser
                    // can complain with the text attached.
                    let code = self.bytes[self.pos] as TokenCode;
                    self.push(&mut text, 1);
                    code
                }
            }
        };

        Token {
            code,
            text,
            span: Span::new(start, self.loc()),
        }
    }
}

// ===================== Tests =====================
