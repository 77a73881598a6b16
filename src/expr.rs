//! Expression parsing and evaluation for parameter ties.
//!
//! A tie binds one parameter to an arithmetic formula over other parameters.
//! This module parses such formulas into an AST, reports the free variable
//! names by static inspection (no trial evaluation), evaluates against a
//! bindings map, and regenerates a re-parseable textual form.

use crate::error::{FitError, Result};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, multispace0, one_of},
    combinator::recognize,
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};
use std::collections::HashMap;
use std::fmt;

/// Source of variable values during evaluation.
pub trait Bindings {
    fn lookup(&self, name: &str) -> Option<f64>;
}

impl Bindings for HashMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl<B: Bindings + ?Sized> Bindings for &B {
    fn lookup(&self, name: &str) -> Option<f64> {
        (**self).lookup(name)
    }
}

/// Binary operators, conventional precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Pow => '^',
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
            BinaryOp::Pow => 4,
        }
    }
}

/// Expression AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    /// Unary negation.
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Parse an expression, requiring the whole input to be consumed.
    pub fn parse(input: &str) -> Result<Self> {
        match expr_parser(input.trim()) {
            Ok((remainder, expr)) => {
                if remainder.trim().is_empty() {
                    Ok(expr)
                } else {
                    Err(FitError::ParseError(format!(
                        "unexpected trailing characters: '{}'",
                        remainder
                    )))
                }
            }
            Err(e) => Err(FitError::ParseError(format!("{:?}", e))),
        }
    }

    /// Evaluate against the given bindings.
    pub fn evaluate<B: Bindings>(&self, bindings: &B) -> Result<f64> {
        match self {
            Expr::Number(n) => Ok(*n),

            Expr::Variable(name) => bindings
                .lookup(name)
                .ok_or_else(|| FitError::UndefinedVariable(name.clone())),

            Expr::Neg(inner) => Ok(-inner.evaluate(bindings)?),

            Expr::Binary(op, left, right) => {
                let lhs = left.evaluate(bindings)?;
                let rhs = right.evaluate(bindings)?;
                match op {
                    BinaryOp::Add => Ok(lhs + rhs),
                    BinaryOp::Sub => Ok(lhs - rhs),
                    BinaryOp::Mul => Ok(lhs * rhs),
                    BinaryOp::Div => {
                        if rhs == 0.0 {
                            Err(FitError::NumericFailure("division by zero".to_string()))
                        } else {
                            Ok(lhs / rhs)
                        }
                    }
                    BinaryOp::Pow => Ok(lhs.powf(rhs)),
                }
            }

            Expr::Call(name, args) => {
                let mut vals = Vec::with_capacity(args.len());
                for arg in args {
                    vals.push(arg.evaluate(bindings)?);
                }
                apply_function(name, &vals)
            }
        }
    }

    /// All free variable names, sorted and deduplicated. Static inspection;
    /// no evaluation takes place.
    pub fn variables(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.collect_variables(&mut vars);
        vars.sort();
        vars.dedup();
        vars
    }

    fn collect_variables(&self, vars: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => vars.push(name.clone()),
            Expr::Neg(inner) => inner.collect_variables(vars),
            Expr::Binary(_, left, right) => {
                left.collect_variables(vars);
                right.collect_variables(vars);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_variables(vars);
                }
            }
        }
    }

    /// Rewrite every occurrence of variable `old` to `new`.
    pub fn rename_variable(&mut self, old: &str, new: &str) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                if name == old {
                    *name = new.to_string();
                }
            }
            Expr::Neg(inner) => inner.rename_variable(old, new),
            Expr::Binary(_, left, right) => {
                left.rename_variable(old, new);
                right.rename_variable(old, new);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.rename_variable(old, new);
                }
            }
        }
    }

    // Precedence used when deciding where Display needs parentheses.
    fn precedence(&self) -> u8 {
        match self {
            Expr::Number(_) | Expr::Variable(_) | Expr::Call(..) => u8::MAX,
            Expr::Neg(_) => 5,
            Expr::Binary(op, ..) => op.precedence(),
        }
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64> {
    let arity = |expected: &str, ok: bool| -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(FitError::InvalidArity {
                name: name.to_string(),
                expected: expected.to_string(),
                got: args.len(),
            })
        }
    };

    match name {
        "sin" | "cos" | "tan" | "exp" | "ln" | "log" | "log10" | "sqrt" | "abs" => {
            arity("1", args.len() == 1)?;
            let x = args[0];
            Ok(match name {
                "sin" => x.sin(),
                "cos" => x.cos(),
                "tan" => x.tan(),
                "exp" => x.exp(),
                "ln" | "log" => x.ln(),
                "log10" => x.log10(),
                "sqrt" => x.sqrt(),
                _ => x.abs(),
            })
        }
        "min" => {
            arity("at least 2", args.len() >= 2)?;
            Ok(args.iter().fold(f64::INFINITY, |a, &b| a.min(b)))
        }
        "max" => {
            arity("at least 2", args.len() >= 2)?;
            Ok(args.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)))
        }
        "sum" => {
            arity("at least 1", !args.is_empty())?;
            Ok(args.iter().sum())
        }
        "avg" => {
            arity("at least 1", !args.is_empty())?;
            Ok(args.iter().sum::<f64>() / args.len() as f64)
        }
        // if(cond, a, b): a when cond > 0, else b. Both branches are
        // evaluated before dispatch.
        "if" => {
            arity("3", args.len() == 3)?;
            Ok(if args[0] > 0.0 { args[1] } else { args[2] })
        }
        _ => Err(FitError::UndefinedFunction(name.to_string())),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Variable(name) => write!(f, "{}", name),
            Expr::Neg(inner) => {
                if inner.precedence() < self.precedence() {
                    write!(f, "-({})", inner)
                } else {
                    write!(f, "-{}", inner)
                }
            }
            Expr::Binary(op, left, right) => {
                let p = op.precedence();
                // Left operand: parenthesize on lower precedence, and on
                // equal precedence for the right-associative power operator.
                let left_parens =
                    left.precedence() < p || (*op == BinaryOp::Pow && left.precedence() == p);
                // Right operand: parenthesize on lower-or-equal precedence so
                // the left-folding parser rebuilds the same tree; power is
                // right-associative and keeps bare equal-precedence operands.
                let right_parens = right.precedence() < p
                    || (*op != BinaryOp::Pow && right.precedence() == p);

                if left_parens {
                    write!(f, "({})", left)?;
                } else {
                    write!(f, "{}", left)?;
                }
                write!(f, " {} ", op.symbol())?;
                if right_parens {
                    write!(f, "({})", right)
                } else {
                    write!(f, "{}", right)
                }
            }
            Expr::Call(name, args) => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

// Parser functions using nom.

/// Identifier: letters/digits/underscore, with '.' allowed after the first
/// character so composite path names (`f1.sigma`) are single tokens.
fn identifier(input: &str) -> IResult<&str, String> {
    let mut parser = recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_"), tag(".")))),
    ));
    let (input, matched) = parser.parse(input)?;
    Ok((input, matched.to_string()))
}

fn args_list(input: &str) -> IResult<&str, Vec<Expr>> {
    let (mut input, first) = expr_parser(input)?;
    let mut args = vec![first];

    loop {
        let mut comma = delimited(
            multispace0::<&str, nom::error::Error<&str>>,
            char(','),
            multispace0,
        );
        match comma.parse(input) {
            Ok((after_comma, _)) => {
                let (after_expr, expr) = expr_parser(after_comma)?;
                args.push(expr);
                input = after_expr;
            }
            Err(_) => break,
        }
    }

    Ok((input, args))
}

fn function_call(input: &str) -> IResult<&str, Expr> {
    let (input, name) = identifier(input)?;
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;
    let (input, _) = char::<&str, nom::error::Error<&str>>('(').parse(input)?;
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;

    // Empty argument list.
    if let Ok((input, _)) = char::<&str, nom::error::Error<&str>>(')').parse(input) {
        return Ok((input, Expr::Call(name, vec![])));
    }

    let (input, args) = args_list(input)?;
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;
    let (input, _) = char::<&str, nom::error::Error<&str>>(')').parse(input)?;

    Ok((input, Expr::Call(name, args)))
}

fn number(input: &str) -> IResult<&str, Expr> {
    // Reject forms like "inf"/"nan" that nom's double would accept but the
    // grammar treats as identifiers.
    if input
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
    {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Float,
        )));
    }
    let (input, num) = double(input)?;
    Ok((input, Expr::Number(num)))
}

fn variable(input: &str) -> IResult<&str, Expr> {
    let (input, name) = identifier(input)?;
    Ok((input, Expr::Variable(name)))
}

fn parens(input: &str) -> IResult<&str, Expr> {
    let (input, _) = char::<&str, nom::error::Error<&str>>('(').parse(input)?;
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;
    let (input, expr) = expr_parser(input)?;
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;
    let (input, _) = char::<&str, nom::error::Error<&str>>(')').parse(input)?;
    Ok((input, expr))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    if let Ok(result) = number(input) {
        return Ok(result);
    }
    if let Ok(result) = function_call(input) {
        return Ok(result);
    }
    if let Ok(result) = variable(input) {
        return Ok(result);
    }
    parens(input)
}

/// Unary minus binds tighter than any binary operator; a leading '-' here is
/// negation, never subtraction.
fn unary(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;
    let mut neg = preceded(pair(char('-'), multispace0), unary);
    match neg.parse(input) {
        Ok((remaining, expr)) => Ok((remaining, Expr::Neg(Box::new(expr)))),
        Err(_) => primary(input),
    }
}

/// Power is right-associative: `2^3^2` is `2^(3^2)`.
fn power(input: &str) -> IResult<&str, Expr> {
    let (input, left) = unary(input)?;
    let (after_ws, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;

    match char::<&str, nom::error::Error<&str>>('^').parse(after_ws) {
        Ok((after_op, _)) => {
            let (after_op, _) = multispace0::<&str, nom::error::Error<&str>>.parse(after_op)?;
            let (remaining, right) = power(after_op)?;
            Ok((
                remaining,
                Expr::Binary(BinaryOp::Pow, Box::new(left), Box::new(right)),
            ))
        }
        Err(_) => Ok((input, left)),
    }
}

/// Left-folding multiplicative chain, so `a / b * c` is `(a / b) * c`.
fn term(input: &str) -> IResult<&str, Expr> {
    let (input, init) = power(input)?;
    let mut tail = many0(pair(
        delimited(multispace0, one_of("*/"), multispace0),
        power,
    ));
    let (input, rest) = tail.parse(input)?;

    let expr = rest.into_iter().fold(init, |acc, (op, rhs)| {
        let op = if op == '*' { BinaryOp::Mul } else { BinaryOp::Div };
        Expr::Binary(op, Box::new(acc), Box::new(rhs))
    });
    Ok((input, expr))
}

/// Left-folding additive chain, so `a - b + c` is `(a - b) + c`.
fn expr_parser(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0::<&str, nom::error::Error<&str>>.parse(input)?;
    let (input, init) = term(input)?;
    let mut tail = many0(pair(
        delimited(multispace0, one_of("+-"), multispace0),
        term,
    ));
    let (input, rest) = tail.parse(input)?;

    let expr = rest.into_iter().fold(init, |acc, (op, rhs)| {
        let op = if op == '+' { BinaryOp::Add } else { BinaryOp::Sub };
        Expr::Binary(op, Box::new(acc), Box::new(rhs))
    });
    Ok((input, expr))
}
