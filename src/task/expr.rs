//! A small expression evaluator for the `if:` conditions on jobs (and, after
//! rewriting, on steps): literal values, boolean operators, member access on
//! `github`/`needs`/`vars`, and the four status-check functions.
//!
//! Deliberately not a full GitHub Actions expression language — that's out
//! of scope; only what's needed to gate a job on `if:` is implemented.
//! Anything else is an [`Error::Unsupported`].

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::task::NeedsResult;

/// Errors encountered evaluating an expression.
#[derive(Debug, Error)]
pub enum Error {
    /// The expression could not be tokenized or parsed.
    #[error("parse expression: {0}")]
    Parse(String),

    /// The expression used syntax this evaluator doesn't implement.
    #[error("unsupported expression syntax: {0}")]
    Unsupported(String),

    /// A referenced identifier (`github`, `needs`, `vars`, or a function) is unknown.
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
}

/// The evaluation environment for a job's `if:` expression.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// The `github` context object.
    pub github: HashMap<String, Value>,
    /// Upstream job results, keyed by job id.
    pub needs: HashMap<String, NeedsResult>,
    /// Job-level variables.
    pub vars: HashMap<String, String>,
}

impl Environment {
    fn success(&self) -> bool {
        self.needs.values().all(|n| n.result == "success")
    }

    fn failure(&self) -> bool {
        self.needs.values().any(|n| n.result == "failure")
    }

    fn cancelled(&self) -> bool {
        self.needs.values().any(|n| n.result == "cancelled")
    }
}

/// Evaluate an `if:` expression (already stripped of `${{ }}`) against `env`.
///
/// Per spec, the evaluation rule is `(<expr>) && true || false`: a
/// non-boolean result (or an evaluation error) is the caller's concern to
/// translate into `SKIPPED`/`FAILURE`, so this function returns the raw
/// evaluated [`Value`] rather than coercing it itself.
pub fn evaluate(expr: &str, env: &Environment) -> Result<Value, Error> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(Error::Parse(format!("trailing tokens after '{expr}'")));
    }
    eval(&ast, env)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    And,
    Or,
    Not,
    EqEq,
    NotEq,
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(Error::Parse("unterminated string literal".to_owned()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse()
                    .map_err(|_| Error::Parse(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(text),
                });
            }
            other => return Err(Error::Parse(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Ast {
    Bool(bool),
    Str(String),
    Num(f64),
    Member(Vec<String>),
    Call(String, Vec<Ast>),
    Not(Box<Ast>),
    Eq(Box<Ast>, Box<Ast>),
    NotEq(Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Ast, Error> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast, Error> {
        let mut lhs = self.parse_eq()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.parse_eq()?;
            lhs = Ast::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_eq(&mut self) -> Result<Ast, Error> {
        let lhs = self.parse_unary()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.bump();
                let rhs = self.parse_unary()?;
                Ok(Ast::Eq(Box::new(lhs), Box::new(rhs)))
            }
            Some(Token::NotEq) => {
                self.bump();
                let rhs = self.parse_unary()?;
                Ok(Ast::NotEq(Box::new(lhs), Box::new(rhs)))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_unary(&mut self) -> Result<Ast, Error> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Ast, Error> {
        match self.bump().cloned() {
            Some(Token::True) => Ok(Ast::Bool(true)),
            Some(Token::False) => Ok(Ast::Bool(false)),
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::Num(n)) => Ok(Ast::Num(n)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Parse("expected ')'".to_owned())),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    match self.bump() {
                        Some(Token::RParen) => Ok(Ast::Call(name, args)),
                        _ => Err(Error::Parse("expected ')'".to_owned())),
                    }
                } else {
                    let mut path = vec![name];
                    while self.peek() == Some(&Token::Dot) {
                        self.bump();
                        match self.bump().cloned() {
                            Some(Token::Ident(part)) => path.push(part),
                            other => {
                                return Err(Error::Parse(format!("expected identifier after '.', got {other:?}")))
                            }
                        }
                    }
                    Ok(Ast::Member(path))
                }
            }
            other => Err(Error::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

fn eval(ast: &Ast, env: &Environment) -> Result<Value, Error> {
    match ast {
        Ast::Bool(b) => Ok(Value::Bool(*b)),
        Ast::Str(s) => Ok(Value::String(s.clone())),
        Ast::Num(n) => Ok(serde_json::json!(n)),
        Ast::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, env)?))),
        Ast::Eq(a, b) => Ok(Value::Bool(eval(a, env)? == eval(b, env)?)),
        Ast::NotEq(a, b) => Ok(Value::Bool(eval(a, env)? != eval(b, env)?)),
        Ast::And(a, b) => {
            let lhs = eval(a, env)?;
            if !truthy(&lhs) {
                return Ok(lhs);
            }
            eval(b, env)
        }
        Ast::Or(a, b) => {
            let lhs = eval(a, env)?;
            if truthy(&lhs) {
                return Ok(lhs);
            }
            eval(b, env)
        }
        Ast::Call(name, args) => eval_call(name, args, env),
        Ast::Member(path) => eval_member(path, env),
    }
}

fn eval_call(name: &str, args: &[Ast], env: &Environment) -> Result<Value, Error> {
    match name {
        "success" if args.is_empty() => Ok(Value::Bool(env.success())),
        "always" if args.is_empty() => Ok(Value::Bool(true)),
        "failure" if args.is_empty() => Ok(Value::Bool(env.failure())),
        "cancelled" if args.is_empty() => Ok(Value::Bool(env.cancelled())),
        "format" if !args.is_empty() => {
            let mut values = args.iter().map(|a| eval(a, env));
            let template = match values.next().transpose()? {
                Some(Value::String(s)) => s,
                _ => return Err(Error::Unsupported("format() requires a string template".to_owned())),
            };
            let rest = values.collect::<Result<Vec<_>, _>>()?;
            Ok(Value::String(render_format(&template, &rest)))
        }
        other => Err(Error::UnknownIdentifier(other.to_owned())),
    }
}

fn render_format(template: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == '}' {
                        break;
                    }
                    digits.push(d);
                }
                if let Some(value) = digits.parse::<usize>().ok().and_then(|i| args.get(i)) {
                    out.push_str(&value_to_string(value));
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval_member(path: &[String], env: &Environment) -> Result<Value, Error> {
    match path.first().map(String::as_str) {
        Some("github") => {
            let mut current = env
                .github
                .get(path.get(1).map(String::as_str).unwrap_or_default())
                .cloned()
                .unwrap_or(Value::Null);
            for segment in &path[2..] {
                current = current.get(segment).cloned().unwrap_or(Value::Null);
            }
            Ok(current)
        }
        Some("needs") => {
            let job = path.get(1).ok_or_else(|| Error::Parse("needs.<job> requires a job id".to_owned()))?;
            let field = path.get(2).map(String::as_str).unwrap_or("result");
            let needs = env.needs.get(job);
            Ok(match (needs, field) {
                (Some(n), "result") => Value::String(n.result.clone()),
                (Some(n), "outputs") => serde_json::to_value(&n.outputs).unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }
        Some("vars") => {
            let name = path.get(1).ok_or_else(|| Error::Parse("vars.<name> requires a name".to_owned()))?;
            Ok(env.vars.get(name).cloned().map(Value::String).unwrap_or(Value::Null))
        }
        Some(other) => Err(Error::UnknownIdentifier(other.to_owned())),
        None => Err(Error::Parse("empty member access".to_owned())),
    }
}

/// GitHub Actions truthiness: everything but `false`, `null`, empty string, and `0` is truthy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_literal_false() {
        let env = Environment::default();
        let result = evaluate("false", &env).expect("evaluates");
        assert!(!truthy(&result));
    }

    #[test]
    fn success_with_no_needs_is_true() {
        let env = Environment::default();
        let result = evaluate("success()", &env).expect("evaluates");
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn failure_detects_failed_upstream_job() {
        let mut env = Environment::default();
        env.needs.insert(
            "build".to_owned(),
            NeedsResult { result: "failure".to_owned(), outputs: Default::default() },
        );
        let result = evaluate("failure()", &env).expect("evaluates");
        assert_eq!(result, Value::Bool(true));
        let result = evaluate("success()", &env).expect("evaluates");
        assert_eq!(result, Value::Bool(false));
    }

    #[test]
    fn member_access_into_github_context() {
        let mut env = Environment::default();
        env.github.insert("event_name".to_owned(), Value::String("push".to_owned()));
        let result = evaluate("github.event_name == 'push'", &env).expect("evaluates");
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let env = Environment::default();
        assert!(evaluate("nonsense()", &env).is_err());
    }

    #[test]
    fn and_or_short_circuit_like_status_checks() {
        let env = Environment::default();
        let result = evaluate("success() && true", &env).expect("evaluates");
        assert_eq!(result, Value::Bool(true));
    }
}
