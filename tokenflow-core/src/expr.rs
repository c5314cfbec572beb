//! Sandboxed expression evaluation for gateway conditions and completion
//! predicates.
//!
//! Expressions are wrapped in `${ … }`. The grammar is deliberately small:
//! literals (number, string, boolean, null, ISO-8601 date in quotes),
//! identifiers with `.`/`[]` chains, comparisons, `&&`/`||`/`!`, and basic
//! arithmetic. No attribute access beyond property/index, no user function
//! calls; scripts additionally get call syntax over a fixed builtin set.

use chrono::DateTime;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

pub type Context = BTreeMap<String, Value>;

// ─── Tokens ───────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Op(Op),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Assign,
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Not,
    Add,
    Sub,
    Mul,
    Div,
}

fn syntax(msg: impl Into<String>) -> EngineError {
    EngineError::ExpressionSyntax(msg.into())
}

fn eval_err(msg: impl Into<String>) -> EngineError {
    EngineError::ExpressionEval(msg.into())
}

fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = src.chars().collect();
    let mut pos = 0;
    let mut toks = Vec::new();

    while pos < chars.len() {
        let c = chars[pos];
        if c.is_whitespace() {
            pos += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = pos;
            let mut has_decimal = false;
            while pos < chars.len() {
                let d = chars[pos];
                if d.is_ascii_digit() {
                    pos += 1;
                } else if d == '.' && !has_decimal {
                    has_decimal = true;
                    pos += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..pos].iter().collect();
            if has_decimal {
                let f: f64 = text.parse().map_err(|_| syntax(format!("bad number '{text}'")))?;
                toks.push(Tok::Float(f));
            } else {
                let i: i64 = text.parse().map_err(|_| syntax(format!("bad number '{text}'")))?;
                toks.push(Tok::Int(i));
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            pos += 1;
            let start = pos;
            while pos < chars.len() && chars[pos] != quote {
                pos += 1;
            }
            if pos >= chars.len() {
                return Err(syntax("unterminated string literal"));
            }
            let text: String = chars[start..pos].iter().collect();
            pos += 1;
            toks.push(Tok::Str(text));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let ident: String = chars[start..pos].iter().collect();
            toks.push(match ident.as_str() {
                "true" => Tok::Bool(true),
                "false" => Tok::Bool(false),
                "null" => Tok::Null,
                "not" => Tok::Op(Op::Not),
                _ => Tok::Ident(ident),
            });
            continue;
        }
        let two: String = chars[pos..chars.len().min(pos + 2)].iter().collect();
        let (tok, advance) = match two.as_str() {
            "==" => (Tok::Op(Op::Eq), 2),
            "!=" => (Tok::Op(Op::Ne), 2),
            ">=" => (Tok::Op(Op::Ge), 2),
            "<=" => (Tok::Op(Op::Le), 2),
            "&&" => (Tok::Op(Op::And), 2),
            "||" => (Tok::Op(Op::Or), 2),
            _ => match c {
                '>' => (Tok::Op(Op::Gt), 1),
                '<' => (Tok::Op(Op::Lt), 1),
                '!' => (Tok::Op(Op::Not), 1),
                '+' => (Tok::Op(Op::Add), 1),
                '-' => (Tok::Op(Op::Sub), 1),
                '*' => (Tok::Op(Op::Mul), 1),
                '/' => (Tok::Op(Op::Div), 1),
                '.' => (Tok::Dot, 1),
                ',' => (Tok::Comma, 1),
                '(' => (Tok::LParen, 1),
                ')' => (Tok::RParen, 1),
                '[' => (Tok::LBracket, 1),
                ']' => (Tok::RBracket, 1),
                '=' => (Tok::Assign, 1),
                _ => return Err(syntax(format!("invalid character '{c}' at position {pos}"))),
            },
        };
        toks.push(tok);
        pos += advance;
    }
    toks.push(Tok::Eof);
    Ok(toks)
}

// ─── AST ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub(crate) enum Ast {
    Literal(Value),
    Ident(String),
    Property(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Binary(Op2, Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Neg(Box<Ast>),
    Call(String, Vec<Ast>),
}

// public-in-crate mirror of Op so script.rs can hold Ast values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Op2 {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    allow_calls: bool,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn next(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        if *self.peek() == tok {
            self.next();
            Ok(())
        } else {
            Err(syntax(format!("expected {what}")))
        }
    }

    fn parse_expression(&mut self) -> Result<Ast> {
        let expr = self.parse_or()?;
        match self.peek() {
            Tok::Eof => Ok(expr),
            other => Err(syntax(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut expr = self.parse_and()?;
        while *self.peek() == Tok::Op(Op::Or) {
            self.next();
            let right = self.parse_and()?;
            expr = Ast::Binary(Op2::Or, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut expr = self.parse_comparison()?;
        while *self.peek() == Tok::Op(Op::And) {
            self.next();
            let right = self.parse_comparison()?;
            expr = Ast::Binary(Op2::And, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Ast> {
        let mut expr = self.parse_additive()?;
        while let Tok::Op(op) = *self.peek() {
            let op2 = match op {
                Op::Eq => Op2::Eq,
                Op::Ne => Op2::Ne,
                Op::Gt => Op2::Gt,
                Op::Ge => Op2::Ge,
                Op::Lt => Op2::Lt,
                Op::Le => Op2::Le,
                _ => break,
            };
            self.next();
            let right = self.parse_additive()?;
            expr = Ast::Binary(op2, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Ast> {
        let mut expr = self.parse_multiplicative()?;
        while let Tok::Op(op) = *self.peek() {
            let op2 = match op {
                Op::Add => Op2::Add,
                Op::Sub => Op2::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            expr = Ast::Binary(op2, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Ast> {
        let mut expr = self.parse_unary()?;
        while let Tok::Op(op) = *self.peek() {
            let op2 = match op {
                Op::Mul => Op2::Mul,
                Op::Div => Op2::Div,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            expr = Ast::Binary(op2, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        match self.peek() {
            Tok::Op(Op::Not) => {
                self.next();
                Ok(Ast::Not(Box::new(self.parse_unary()?)))
            }
            Tok::Op(Op::Sub) => {
                self.next();
                Ok(Ast::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Ast> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.next();
                    match self.next() {
                        Tok::Ident(prop) => expr = Ast::Property(Box::new(expr), prop),
                        _ => return Err(syntax("expected identifier after dot")),
                    }
                }
                Tok::LBracket => {
                    self.next();
                    let index = self.parse_or()?;
                    self.expect(Tok::RBracket, "closing bracket")?;
                    expr = Ast::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.next() {
            Tok::Int(i) => Ok(Ast::Literal(Value::from(i))),
            Tok::Float(f) => Ok(Ast::Literal(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Tok::Str(s) => Ok(Ast::Literal(Value::String(s))),
            Tok::Bool(b) => Ok(Ast::Literal(Value::Bool(b))),
            Tok::Null => Ok(Ast::Literal(Value::Null)),
            Tok::Ident(name) => {
                if self.allow_calls && *self.peek() == Tok::LParen {
                    self.next();
                    let mut args = Vec::new();
                    if *self.peek() != Tok::RParen {
                        loop {
                            args.push(self.parse_or()?);
                            if *self.peek() == Tok::Comma {
                                self.next();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "closing parenthesis")?;
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Ident(name))
                }
            }
            Tok::LParen => {
                let expr = self.parse_or()?;
                self.expect(Tok::RParen, "closing parenthesis")?;
                Ok(expr)
            }
            other => Err(syntax(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parse a bare expression (no `${}` wrapper). Call syntax is enabled only
/// for script statements.
pub(crate) fn parse_fragment(src: &str, allow_calls: bool) -> Result<Ast> {
    let toks = tokenize(src)?;
    let mut parser = Parser {
        toks,
        pos: 0,
        allow_calls,
    };
    parser.parse_expression()
}

// ─── Evaluation ───────────────────────────────────────────────

/// Truthiness follows the variable domain: null and empty containers are
/// false, zero is false, everything else true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Numeric coercion for comparisons: when one side is numeric and the other
/// is a parseable numeric string, compare numerically.
fn coerced_numbers(left: &Value, right: &Value) -> Option<(f64, f64)> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => Some((as_number(left)?, as_number(right)?)),
        (Value::Number(_), Value::String(s)) => Some((as_number(left)?, s.parse().ok()?)),
        (Value::String(s), Value::Number(_)) => Some((s.parse().ok()?, as_number(right)?)),
        _ => None,
    }
}

/// Chronological comparison when both operands are ISO-8601 datetime strings.
fn as_dates(left: &Value, right: &Value) -> Option<(DateTime<chrono::FixedOffset>, DateTime<chrono::FixedOffset>)> {
    let (Value::String(a), Value::String(b)) = (left, right) else {
        return None;
    };
    let a = DateTime::parse_from_rfc3339(a).ok()?;
    let b = DateTime::parse_from_rfc3339(b).ok()?;
    Some((a, b))
}

fn ordering(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    if let Some((a, b)) = coerced_numbers(left, right) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| eval_err("incomparable numbers"));
    }
    if let Some((a, b)) = as_dates(left, right) {
        return Ok(a.cmp(&b));
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(eval_err(format!(
            "cannot order {left} against {right}"
        ))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let Some((a, b)) = coerced_numbers(left, right) {
        return a == b;
    }
    left == right
}

fn arithmetic(op: Op2, left: &Value, right: &Value) -> Result<Value> {
    if op == Op2::Add {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }
    let (a, b) = coerced_numbers(left, right)
        .ok_or_else(|| eval_err(format!("cannot apply arithmetic to {left} and {right}")))?;
    let out = match op {
        Op2::Add => a + b,
        Op2::Sub => a - b,
        Op2::Mul => a * b,
        Op2::Div => {
            if b == 0.0 {
                return Err(eval_err("division by zero"));
            }
            a / b
        }
        _ => unreachable!(),
    };
    // Preserve integer-ness where both inputs were integers and the result is whole.
    if left.as_i64().is_some() && right.as_i64().is_some() && out.fract() == 0.0 {
        Ok(Value::from(out as i64))
    } else {
        Ok(serde_json::Number::from_f64(out)
            .map(Value::Number)
            .unwrap_or(Value::Null))
    }
}

pub(crate) fn eval_ast(ast: &Ast, ctx: &Context) -> Result<Value> {
    match ast {
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Ident(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| eval_err(format!("undefined variable: {name}"))),
        Ast::Property(obj, prop) => {
            let obj = eval_ast(obj, ctx)?;
            match obj {
                // null-safe: a.b where a is null is null, not an error
                Value::Null => Ok(Value::Null),
                Value::Object(map) => Ok(map.get(prop).cloned().unwrap_or(Value::Null)),
                other => Err(eval_err(format!(
                    "cannot access property '{prop}' of {other}"
                ))),
            }
        }
        Ast::Index(arr, index) => {
            let arr = eval_ast(arr, ctx)?;
            if arr.is_null() {
                return Ok(Value::Null);
            }
            let idx = eval_ast(index, ctx)?;
            let i = idx
                .as_i64()
                .ok_or_else(|| eval_err(format!("array index must be a number, got {idx}")))?;
            match arr {
                Value::Array(items) => {
                    let len = items.len() as i64;
                    if i < 0 || i >= len {
                        Err(eval_err(format!("index {i} out of bounds (len {len})")))
                    } else {
                        Ok(items[i as usize].clone())
                    }
                }
                other => Err(eval_err(format!("cannot index into {other}"))),
            }
        }
        Ast::Binary(op, left, right) => {
            let l = eval_ast(left, ctx)?;
            match op {
                Op2::And => {
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = eval_ast(right, ctx)?;
                    Ok(Value::Bool(truthy(&r)))
                }
                Op2::Or => {
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = eval_ast(right, ctx)?;
                    Ok(Value::Bool(truthy(&r)))
                }
                _ => {
                    let r = eval_ast(right, ctx)?;
                    // null rules: == / != compare by identity; any other
                    // operator on null is false
                    if l.is_null() || r.is_null() {
                        return Ok(match op {
                            Op2::Eq => Value::Bool(l.is_null() && r.is_null()),
                            Op2::Ne => Value::Bool(l.is_null() != r.is_null()),
                            _ => Value::Bool(false),
                        });
                    }
                    match op {
                        Op2::Eq => Ok(Value::Bool(values_equal(&l, &r))),
                        Op2::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
                        Op2::Gt => Ok(Value::Bool(ordering(&l, &r)?.is_gt())),
                        Op2::Ge => Ok(Value::Bool(ordering(&l, &r)?.is_ge())),
                        Op2::Lt => Ok(Value::Bool(ordering(&l, &r)?.is_lt())),
                        Op2::Le => Ok(Value::Bool(ordering(&l, &r)?.is_le())),
                        Op2::Add | Op2::Sub | Op2::Mul | Op2::Div => arithmetic(*op, &l, &r),
                        Op2::And | Op2::Or => unreachable!(),
                    }
                }
            }
        }
        Ast::Not(inner) => Ok(Value::Bool(!truthy(&eval_ast(inner, ctx)?))),
        Ast::Neg(inner) => {
            let v = eval_ast(inner, ctx)?;
            let n = as_number(&v).ok_or_else(|| eval_err(format!("cannot negate {v}")))?;
            if v.as_i64().is_some() {
                Ok(Value::from(-(n as i64)))
            } else {
                Ok(serde_json::Number::from_f64(-n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
        }
        Ast::Call(name, args) => {
            let args: Vec<Value> = args
                .iter()
                .map(|a| eval_ast(a, ctx))
                .collect::<Result<_>>()?;
            call_builtin(name, args)
        }
    }
}

/// The injected safe builtin set. Anything else is an evaluation error.
fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value> {
    let argc = args.len();
    let arity = move |n: usize| -> Result<()> {
        if argc == n {
            Ok(())
        } else {
            Err(eval_err(format!("{name}() takes {n} argument(s)")))
        }
    };
    match name {
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => return Err(eval_err(format!("len() of {other}"))),
            };
            Ok(Value::from(n as i64))
        }
        "str" => {
            arity(1)?;
            Ok(Value::String(match &args[0] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
        }
        "int" => {
            arity(1)?;
            let v = match &args[0] {
                Value::Number(n) => n.as_f64().map(|f| f as i64),
                Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
                Value::Bool(b) => Some(*b as i64),
                _ => None,
            };
            v.map(Value::from)
                .ok_or_else(|| eval_err(format!("int() of {}", args[0])))
        }
        "float" => {
            arity(1)?;
            let v = match &args[0] {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                Value::Bool(b) => Some(*b as i64 as f64),
                _ => None,
            };
            v.and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| eval_err(format!("float() of {}", args[0])))
        }
        "bool" => {
            arity(1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "list" => Ok(Value::Array(args)),
        "dict" => {
            arity(0)?;
            Ok(Value::Object(serde_json::Map::new()))
        }
        "sum" => {
            arity(1)?;
            let Value::Array(items) = &args[0] else {
                return Err(eval_err("sum() expects an array"));
            };
            let mut acc = 0.0;
            let mut all_int = true;
            for item in items {
                let n = as_number(item).ok_or_else(|| eval_err("sum() of non-numeric item"))?;
                all_int &= item.as_i64().is_some();
                acc += n;
            }
            if all_int {
                Ok(Value::from(acc as i64))
            } else {
                Ok(serde_json::Number::from_f64(acc)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
        }
        "min" | "max" => {
            let items: Vec<Value> = if args.len() == 1 {
                if let Value::Array(items) = &args[0] {
                    items.clone()
                } else {
                    args
                }
            } else {
                args
            };
            if items.is_empty() {
                return Err(eval_err(format!("{name}() of empty sequence")));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ord = ordering(item, &best)?;
                let better = if name == "min" { ord.is_lt() } else { ord.is_gt() };
                if better {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        other => Err(eval_err(format!("unknown function: {other}"))),
    }
}

// ─── Public evaluator ─────────────────────────────────────────

/// Evaluates gateway condition expressions and completion predicates.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a `${…}`-wrapped expression to its value.
    pub fn evaluate(&self, expression: &str, ctx: &Context) -> Result<Value> {
        let inner = unwrap_expression(expression)?;
        let ast = parse_fragment(inner, false)?;
        eval_ast(&ast, ctx)
    }

    /// Evaluate a condition to a boolean via truthiness.
    pub fn evaluate_condition(&self, expression: &str, ctx: &Context) -> Result<bool> {
        Ok(truthy(&self.evaluate(expression, ctx)?))
    }
}

fn unwrap_expression(expression: &str) -> Result<&str> {
    let trimmed = expression.trim();
    let inner = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| syntax("expression must be wrapped in ${}"))?;
    Ok(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn rejects_unwrapped_expression() {
        let e = ExpressionEvaluator::new();
        assert!(matches!(
            e.evaluate("amount > 1000", &Context::new()),
            Err(EngineError::ExpressionSyntax(_))
        ));
    }

    #[test]
    fn comparisons_and_logic() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[("amount", json!(500)), ("vip", json!(true))]);
        assert!(!e.evaluate_condition("${amount > 1000}", &c).unwrap());
        assert!(e.evaluate_condition("${amount >= 500}", &c).unwrap());
        assert!(e.evaluate_condition("${amount > 100 && vip}", &c).unwrap());
        assert!(e.evaluate_condition("${amount > 1000 || vip}", &c).unwrap());
        assert!(e.evaluate_condition("${!(amount > 1000)}", &c).unwrap());
    }

    #[test]
    fn numeric_string_coercion() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[("amount", json!("500"))]);
        assert!(e.evaluate_condition("${amount == 500}", &c).unwrap());
        assert!(e.evaluate_condition("${500 < amount + 1}", &c).unwrap());
    }

    #[test]
    fn null_semantics() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[("a", json!(null)), ("b", json!(1))]);
        assert!(e.evaluate_condition("${a == null}", &c).unwrap());
        assert!(e.evaluate_condition("${a != b}", &c).unwrap());
        // any other operator on null returns false
        assert!(!e.evaluate_condition("${a > 0}", &c).unwrap());
        // null-safe property access
        assert!(e.evaluate_condition("${a.b == null}", &c).unwrap());
    }

    #[test]
    fn property_and_index_chains() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[(
            "order",
            json!({"lines": [{"qty": 2}, {"qty": 5}], "customer": {"tier": "gold"}}),
        )]);
        assert!(e
            .evaluate_condition("${order.lines[1].qty == 5}", &c)
            .unwrap());
        assert!(e
            .evaluate_condition("${order.customer.tier == 'gold'}", &c)
            .unwrap());
        // absent keys resolve to null rather than raising
        assert!(e.evaluate_condition("${order.missing == null}", &c).unwrap());
    }

    #[test]
    fn index_out_of_bounds_is_eval_error() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[("xs", json!([1, 2]))]);
        assert!(matches!(
            e.evaluate("${xs[5]}", &c),
            Err(EngineError::ExpressionEval(_))
        ));
    }

    #[test]
    fn undefined_identifier_is_eval_error() {
        let e = ExpressionEvaluator::new();
        assert!(matches!(
            e.evaluate("${ghost}", &Context::new()),
            Err(EngineError::ExpressionEval(_))
        ));
    }

    #[test]
    fn date_comparison() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[("deadline", json!("2026-01-01T00:00:00Z"))]);
        assert!(e
            .evaluate_condition("${deadline > '2025-06-01T00:00:00Z'}", &c)
            .unwrap());
    }

    #[test]
    fn no_function_calls_in_conditions() {
        let e = ExpressionEvaluator::new();
        let c = ctx(&[("len", json!(3))]);
        // call syntax is disabled: `len` resolves as a plain identifier
        assert!(e.evaluate_condition("${len == 3}", &c).unwrap());
        assert!(e.evaluate("${len(xs)}", &c).is_err());
    }

    #[test]
    fn builtins_in_script_fragments() {
        let c = ctx(&[("xs", json!([1, 2, 3]))]);
        let ast = parse_fragment("sum(xs) + len(xs)", true).unwrap();
        assert_eq!(eval_ast(&ast, &c).unwrap(), json!(9));
        let ast = parse_fragment("max(xs)", true).unwrap();
        assert_eq!(eval_ast(&ast, &c).unwrap(), json!(3));
        let ast = parse_fragment("str(2)", true).unwrap();
        assert_eq!(eval_ast(&ast, &c).unwrap(), json!("2"));
    }

    #[test]
    fn arithmetic_preserves_integers() {
        let c = Context::new();
        let ast = parse_fragment("2 + 3 * 4", true).unwrap();
        assert_eq!(eval_ast(&ast, &c).unwrap(), json!(14));
        let ast = parse_fragment("10 / 4", true).unwrap();
        assert_eq!(eval_ast(&ast, &c).unwrap(), json!(2.5));
    }
}
