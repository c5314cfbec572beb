//! Script task execution.
//!
//! Scripts run in the same sandbox as gateway conditions: the expression
//! grammar of [`crate::expr`] with call syntax enabled for the safe builtin
//! set, plus `set_variable(name, value)` which writes to the token's scope.
//! A script is a sequence of newline-separated statements:
//!
//! ```text
//! # comment
//! total = sum(amounts)
//! set_variable("total", total)
//! result = total > 100
//! ```
//!
//! Plain assignments are script-local; only `set_variable` writes and the
//! final `result` value escape the script.

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::expr::{eval_ast, parse_fragment, Ast, Context};

/// What a script produced: scope writes and the optional `result` value
/// (stored by the task executor as `{taskId}_result`).
#[derive(Clone, Debug, Default)]
pub struct ScriptOutcome {
    pub result: Option<Value>,
    pub writes: Vec<(String, Value)>,
}

/// Run a script against a variable context. The context is a working copy:
/// local assignments are visible to later statements but are not returned.
pub fn run_script(script: &str, ctx: &Context) -> Result<ScriptOutcome> {
    let mut locals = ctx.clone();
    let mut outcome = ScriptOutcome::default();

    for (line_no, raw) in script.lines().enumerate() {
        let line = strip_comment(raw).trim().to_string();
        if line.is_empty() {
            continue;
        }

        let stmt = parse_statement(&line).map_err(|e| EngineError::ExpressionSyntax(format!(
            "line {}: {e}",
            line_no + 1
        )))?;

        match stmt {
            Statement::Assign(name, ast) => {
                let value = eval_ast(&ast, &locals)?;
                if name == "result" {
                    outcome.result = Some(value.clone());
                }
                locals.insert(name, value);
            }
            Statement::Expr(ast) => {
                if let Ast::Call(name, args) = &ast {
                    if name == "set_variable" {
                        if args.len() != 2 {
                            return Err(EngineError::ExpressionSyntax(format!(
                                "line {}: set_variable takes 2 arguments",
                                line_no + 1
                            )));
                        }
                        let key = eval_ast(&args[0], &locals)?;
                        let Value::String(key) = key else {
                            return Err(EngineError::ExpressionEval(format!(
                                "line {}: set_variable name must be a string",
                                line_no + 1
                            )));
                        };
                        let value = eval_ast(&args[1], &locals)?;
                        locals.insert(key.clone(), value.clone());
                        outcome.writes.push((key, value));
                        continue;
                    }
                }
                // bare expression: evaluated for its side-free value, discarded
                eval_ast(&ast, &locals)?;
            }
        }
    }

    Ok(outcome)
}

enum Statement {
    Assign(String, Ast),
    Expr(Ast),
}

fn parse_statement(line: &str) -> Result<Statement> {
    if let Some((name, rhs)) = split_assignment(line) {
        let ast = parse_fragment(rhs, true)?;
        return Ok(Statement::Assign(name.to_string(), ast));
    }
    Ok(Statement::Expr(parse_fragment(line, true)?))
}

/// Split `ident = expr` at the first top-level `=` that is not part of a
/// comparison operator. Returns None when the line is not an assignment.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    let mut in_str: Option<u8> = None;
    for i in 0..bytes.len() {
        let b = bytes[i];
        match in_str {
            Some(q) => {
                if b == q {
                    in_str = None;
                }
            }
            None => match b {
                b'"' | b'\'' => in_str = Some(b),
                b'=' => {
                    let prev = if i > 0 { bytes[i - 1] } else { 0 };
                    let next = bytes.get(i + 1).copied().unwrap_or(0);
                    if next == b'=' || matches!(prev, b'=' | b'!' | b'<' | b'>') {
                        return None; // comparison, not assignment
                    }
                    let name = line[..i].trim();
                    let rhs = line[i + 1..].trim();
                    if is_identifier(name) && !rhs.is_empty() {
                        return Some((name, rhs));
                    }
                    return None;
                }
                _ => {}
            },
        }
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_str: Option<u8> = None;
    for i in 0..bytes.len() {
        match in_str {
            Some(q) => {
                if bytes[i] == q {
                    in_str = None;
                }
            }
            None => match bytes[i] {
                b'"' | b'\'' => in_str = Some(bytes[i]),
                b'#' => return &line[..i],
                _ => {}
            },
        }
    }
    line
}
