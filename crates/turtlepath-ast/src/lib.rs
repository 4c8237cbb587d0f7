//! The expression AST "tree" that never grows taller than one node.
//!
//! Expressions are compiled as they parse: every operator application either
//! folds immediately (all operands constant) or becomes one deferred closure
//! over its operands. What the parser carries around is therefore just an
//! [`AstNode`]: a constant, a deferred expression, or the invalid marker used
//! for error recovery.
//!
//! Operator semantics live in plain `fn` tables keyed by token code, so the
//! folded and deferred paths cannot drift apart.

use std::rc::Rc;

use turtlepath_engine::{compile_access_constant, Expr, Runtime};
use turtlepath_lexer::{
    TokenCode, TK_AND, TK_BANG, TK_EQUALITY, TK_GE, TK_GT, TK_INEQUALITY, TK_LE, TK_LT, TK_MINUS,
    TK_OR, TK_PLUS, TK_POW, TK_SLASH, TK_STAR,
};

#[derive(Clone, Default)]
pub enum AstNode {
    #[default]
    Invalid,
    Constant(f64),
    Deferred(Expr),
}

impl AstNode {
    pub fn is_valid(&self) -> bool {
        !matches!(self, AstNode::Invalid)
    }

    pub fn is_constexpr(&self) -> bool {
        matches!(self, AstNode::Constant(_))
    }

    pub fn constant(&self) -> f64 {
        match self {
            AstNode::Constant(val) => *val,
            _ => unreachable!("AST node is not a constant"),
        }
    }

    pub fn expression(&self) -> Expr {
        match self {
            AstNode::Deferred(expr) => expr.clone(),
            _ => unreachable!("AST node is not a deferred expression"),
        }
    }

    /// Any valid node as a runnable expression; constants get wrapped.
    /// The if/for compilers use this since their operands are evaluated
    /// before iteration starts anyway.
    pub fn to_expr(&self) -> Option<Expr> {
        match self {
            AstNode::Invalid => None,
            AstNode::Constant(val) => Some(compile_access_constant(*val)),
            AstNode::Deferred(expr) => Some(expr.clone()),
        }
    }
}

fn ev(expr: &Expr, rt: &mut Runtime) -> f64 {
    (**expr)(rt)
}

// ===================== Operator tables =====================

fn prefix_fn(op: TokenCode) -> fn(f64) -> f64 {
    match op {
        TK_MINUS => |rhs| -rhs,
        TK_BANG => |rhs| {
            if rhs != 0.0 {
                0.0
            } else {
                1.0
            }
        },
        _ => unreachable!("not a prefix operator"),
    }
}

fn bool_val(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn binary_fn(op: TokenCode) -> fn(f64, f64) -> f64 {
    match op {
        TK_PLUS => |lhs, rhs| lhs + rhs,
        TK_MINUS => |lhs, rhs| lhs - rhs,
        TK_STAR => |lhs, rhs| lhs * rhs,
        TK_SLASH => |lhs, rhs| lhs / rhs,
        TK_POW => f64::powf,

        TK_EQUALITY => |lhs, rhs| bool_val(lhs == rhs),
        TK_INEQUALITY => |lhs, rhs| bool_val(lhs != rhs),
        TK_LT => |lhs, rhs| bool_val(lhs < rhs),
        TK_GT => |lhs, rhs| bool_val(lhs > rhs),
        TK_LE => |lhs, rhs| bool_val(lhs <= rhs),
        TK_GE => |lhs, rhs| bool_val(lhs >= rhs),

        // Zero is false, anything else true. Expressions have no side
        // effects, so evaluating both sides matches what a short-circuiting
        // evaluator would return.
        TK_OR => |lhs, rhs| {
            if lhs != 0.0 {
                lhs
            } else if rhs != 0.0 {
                rhs
            } else {
                0.0
            }
        },
        TK_AND => |lhs, rhs| {
            if lhs != 0.0 && rhs != 0.0 {
                rhs
            } else {
                0.0
            }
        },

        _ => unreachable!("not a binary operator"),
    }
}

// ===================== Combinators =====================

/// Unary operator application; folds when the operand is constant. An
/// invalid operand (error already reported) stays invalid.
pub fn create_prefix_op_expr(op: TokenCode, rhs: AstNode) -> AstNode {
    let f = prefix_fn(op);

    match rhs {
        AstNode::Invalid => AstNode::Invalid,
        AstNode::Constant(rhs) => AstNode::Constant(f(rhs)),
        AstNode::Deferred(rhs) => AstNode::Deferred(Rc::new(move |rt| f(ev(&rhs, rt)))),
    }
}

/// Binary operator application: four-way dispatch on operand constness so
/// constant operands are captured as plain values.
pub fn create_binary_op_expr(op: TokenCode, lhs: AstNode, rhs: AstNode) -> AstNode {
    use AstNode::{Constant, Deferred, Invalid};

    let f = binary_fn(op);

    match (lhs, rhs) {
        (Invalid, _) | (_, Invalid) => Invalid,

        (Constant(lhs), Constant(rhs)) => Constant(f(lhs, rhs)),

        (Constant(lhs), Deferred(rhs)) => Deferred(Rc::new(move |rt| f(lhs, ev(&rhs, rt)))),

        (Deferred(lhs), Constant(rhs)) => Deferred(Rc::new(move |rt| f(ev(&lhs, rt), rhs))),

        (Deferred(lhs), Deferred(rhs)) => {
            Deferred(Rc::new(move |rt| f(ev(&lhs, rt), ev(&rhs, rt))))
        }
    }
}

/// `cond ? then : else`. All-constant selections fold; otherwise one
/// deferred selector over the three operands.
pub fn create_conditional_expr(cond: AstNode, then: AstNode, els: AstNode) -> AstNode {
    use AstNode::{Constant, Invalid};

    if !cond.is_valid() || !then.is_valid() || !els.is_valid() {
        return Invalid;
    }

    if let (Constant(c), Constant(t), Constant(e)) = (&cond, &then, &els) {
        return Constant(if *c != 0.0 { *t } else { *e });
    }

    // to_expr() cannot fail on valid nodes
    let (Some(cond), Some(then), Some(els)) = (cond.to_expr(), then.to_expr(), els.to_expr())
    else {
        return Invalid;
    };

    AstNode::Deferred(Rc::new(move |rt| {
        if ev(&cond, rt) != 0.0 {
            ev(&then, rt)
        } else {
            ev(&els, rt)
        }
    }))
}

// ===================== Tests =====================
