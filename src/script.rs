// Script step - per-round metric transformation
//
// A task may carry small scripts that derive, rename or drop metrics and
// rewrite tags before the batch is prefixed and written. Samples are grouped by
// tag set; each group sees its metrics as `result`, its tags as `tags` and the
// collect target's meta as `target`.
//
//   ratio = divide(used, total) * 100
//   result["error.rate"] = errors / requests
//   tags.tier = target.app + "-backend"
//   drop used
//
// Statements are separated by newlines or `;`. Division by zero yields 0.0. A
// statement that reads a metric the group does not have is skipped for that
// group.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::model::{Metric, Tags};
use crate::task::CollectTarget;

/// Wall-clock budget of the script step for one batch.
pub const SCRIPT_BUDGET: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("script exceeded {0:?}")]
    Timeout(Duration),

    #[error("script worker failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Sym(char),
    Sep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum NumExpr {
    Lit(f64),
    Metric(String),
    Neg(Box<NumExpr>),
    Bin(Op, Box<NumExpr>, Box<NumExpr>),
}

#[derive(Debug, Clone, PartialEq)]
enum StrExpr {
    Lit(String),
    Tag(String),
    Target(String),
    Concat(Vec<StrExpr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    SetMetric(String, NumExpr),
    SetTag(String, StrExpr),
    Drop(String),
}

/// Metric reference could not be resolved in the current group.
struct Missing;

/// Compiled scripts of one task.
#[derive(Debug, Clone, Default)]
pub struct Script {
    statements: Vec<Stmt>,
}

impl Script {
    /// Compiles the scripts in order; they run as one program.
    pub fn parse<S: AsRef<str>>(sources: &[S]) -> Result<Self, ScriptError> {
        let mut statements = Vec::new();
        for source in sources {
            let tokens = tokenize(source.as_ref())?;
            let mut parser = Parser { tokens, pos: 0 };
            statements.extend(parser.program()?);
        }
        Ok(Script { statements })
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Transforms one batch, failing once `deadline` has passed.
    pub fn apply(&self, metrics: Vec<Metric>, target: &CollectTarget, deadline: Instant) -> Result<Vec<Metric>, ScriptError> {
        let mut groups: Vec<Group> = Vec::new();
        for metric in metrics {
            match groups.iter_mut().find(|g| g.tags == metric.tags) {
                Some(group) => group.set(&metric.name, metric.value),
                None => {
                    let mut group = Group {
                        tags: metric.tags.clone(),
                        timestamp: metric.timestamp,
                        result: Vec::new(),
                    };
                    group.set(&metric.name, metric.value);
                    groups.push(group);
                }
            }
        }

        let mut out = Vec::new();
        for mut group in groups {
            for stmt in &self.statements {
                if Instant::now() > deadline {
                    return Err(ScriptError::Timeout(SCRIPT_BUDGET));
                }
                group.exec(stmt, target);
            }
            out.extend(group.result.into_iter().map(|(name, value)| Metric {
                name,
                tags: group.tags.clone(),
                timestamp: group.timestamp,
                value,
            }));
        }
        Ok(out)
    }
}

/// Runs `script` off the async runtime within `budget`.
///
/// On timeout the batch is lost for this round.
pub async fn run(
    script: Arc<Script>,
    metrics: Vec<Metric>,
    target: Arc<CollectTarget>,
    budget: Duration,
) -> Result<Vec<Metric>, ScriptError> {
    let deadline = Instant::now() + budget;
    let worker = tokio::task::spawn_blocking(move || script.apply(metrics, &target, deadline));
    match tokio::time::timeout(budget, worker).await {
        Err(_) => Err(ScriptError::Timeout(budget)),
        Ok(Err(e)) => Err(ScriptError::Join(e.to_string())),
        Ok(Ok(result)) => result,
    }
}

struct Group {
    tags: Tags,
    timestamp: i64,
    result: Vec<(String, f64)>,
}

impl Group {
    fn get(&self, name: &str) -> Option<f64> {
        self.result.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    fn set(&mut self, name: &str, value: f64) {
        match self.result.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.result.push((name.to_string(), value)),
        }
    }

    fn exec(&mut self, stmt: &Stmt, target: &CollectTarget) {
        match stmt {
            Stmt::SetMetric(name, expr) => {
                if let Ok(value) = self.eval(expr) {
                    self.set(name, value);
                }
            }
            Stmt::SetTag(key, expr) => {
                let value = self.eval_str(expr, target);
                if value.is_empty() {
                    self.tags.remove(key);
                } else {
                    self.tags.insert(key.clone(), value);
                }
            }
            Stmt::Drop(name) => self.result.retain(|(n, _)| n != name),
        }
    }

    fn eval(&self, expr: &NumExpr) -> Result<f64, Missing> {
        Ok(match expr {
            NumExpr::Lit(v) => *v,
            NumExpr::Metric(name) => self.get(name).ok_or(Missing)?,
            NumExpr::Neg(inner) => -self.eval(inner)?,
            NumExpr::Bin(op, lhs, rhs) => {
                let (a, b) = (self.eval(lhs)?, self.eval(rhs)?);
                match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => divide(a, b),
                }
            }
        })
    }

    fn eval_str(&self, expr: &StrExpr, target: &CollectTarget) -> String {
        match expr {
            StrExpr::Lit(s) => s.clone(),
            StrExpr::Tag(k) => self.tags.get(k).cloned().unwrap_or_default(),
            StrExpr::Target(k) => target.meta_value(k).unwrap_or_default().to_string(),
            StrExpr::Concat(parts) => parts.iter().map(|p| self.eval_str(p, target)).collect(),
        }
    }
}

fn divide(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' | ';' => {
                chars.next();
                tokens.push((Token::Sep, line));
                if c == '\n' {
                    line += 1;
                }
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while chars.peek().is_some_and(|c| *c != '\n') {
                    chars.next();
                }
            }
            '0'..='9' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text.parse::<f64>().map_err(|_| ScriptError::Parse {
                    line,
                    message: format!("bad number {text}"),
                })?;
                tokens.push((Token::Num(value), line));
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                text.push(escaped);
                            }
                        }
                        Some('\n') | None => {
                            return Err(ScriptError::Parse {
                                line,
                                message: "unterminated string".into(),
                            })
                        }
                        Some(other) => text.push(other),
                    }
                }
                tokens.push((Token::Str(text), line));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(text), line));
            }
            '+' | '-' | '*' | '/' | '(' | ')' | '[' | ']' | '=' | ',' | '.' => {
                chars.next();
                tokens.push((Token::Sym(c), line));
            }
            other => {
                return Err(ScriptError::Parse {
                    line,
                    message: format!("unexpected character {other:?}"),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |(_, line)| *line)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ScriptError> {
        Err(ScriptError::Parse {
            line: self.line(),
            message: message.into(),
        })
    }

    fn eat(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: char) -> Result<(), ScriptError> {
        if self.eat(sym) {
            Ok(())
        } else {
            self.error(format!("expected '{sym}'"))
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut statements = Vec::new();
        loop {
            while self.peek() == Some(&Token::Sep) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Ok(statements);
            }
            statements.push(self.statement()?);
            match self.peek() {
                None | Some(Token::Sep) => {}
                Some(other) => return self.error(format!("unexpected {other:?} after statement")),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Some(Token::Ident(word)) if word == "drop" => {
                self.pos += 1;
                Ok(Stmt::Drop(self.metric_ref()?))
            }
            Some(Token::Ident(word)) if word == "tags" => {
                self.pos += 1;
                let key = self.member()?;
                self.expect('=')?;
                Ok(Stmt::SetTag(key, self.str_expr()?))
            }
            _ => {
                let name = self.metric_ref()?;
                self.expect('=')?;
                Ok(Stmt::SetMetric(name, self.num_expr()?))
            }
        }
    }

    /// `.key` or `["key"]` after `tags` / `target`.
    fn member(&mut self) -> Result<String, ScriptError> {
        if self.eat('.') {
            return match self.next() {
                Some(Token::Ident(key)) => Ok(key),
                _ => self.error("expected key after '.'"),
            };
        }
        if self.eat('[') {
            let Some(Token::Str(key)) = self.next() else {
                return self.error("expected string key");
            };
            self.expect(']')?;
            return Ok(key);
        }
        self.error("expected '.' or '['")
    }

    fn metric_ref(&mut self) -> Result<String, ScriptError> {
        match self.next() {
            Some(Token::Ident(word)) if word == "result" => {
                self.expect('[')?;
                let Some(Token::Str(name)) = self.next() else {
                    return self.error("expected string metric name");
                };
                self.expect(']')?;
                Ok(name)
            }
            Some(Token::Ident(name)) => Ok(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                self.error("expected metric")
            }
        }
    }

    fn num_expr(&mut self) -> Result<NumExpr, ScriptError> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat('+') {
                Op::Add
            } else if self.eat('-') {
                Op::Sub
            } else {
                return Ok(lhs);
            };
            lhs = NumExpr::Bin(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<NumExpr, ScriptError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat('*') {
                Op::Mul
            } else if self.eat('/') {
                Op::Div
            } else {
                return Ok(lhs);
            };
            lhs = NumExpr::Bin(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<NumExpr, ScriptError> {
        if self.eat('-') {
            return Ok(NumExpr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<NumExpr, ScriptError> {
        match self.peek().cloned() {
            Some(Token::Num(v)) => {
                self.pos += 1;
                Ok(NumExpr::Lit(v))
            }
            Some(Token::Sym('(')) => {
                self.pos += 1;
                let inner = self.num_expr()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some(Token::Ident(word)) if word == "divide" => {
                self.pos += 1;
                self.expect('(')?;
                let a = self.num_expr()?;
                self.expect(',')?;
                let b = self.num_expr()?;
                self.expect(')')?;
                Ok(NumExpr::Bin(Op::Div, Box::new(a), Box::new(b)))
            }
            Some(Token::Ident(_)) => Ok(NumExpr::Metric(self.metric_ref()?)),
            _ => self.error("expected number, metric or '('"),
        }
    }

    fn str_expr(&mut self) -> Result<StrExpr, ScriptError> {
        let mut parts = vec![self.str_atom()?];
        while self.eat('+') {
            parts.push(self.str_atom()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            StrExpr::Concat(parts)
        })
    }

    fn str_atom(&mut self) -> Result<StrExpr, ScriptError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(StrExpr::Lit(s)),
            Some(Token::Ident(word)) if word == "tags" => Ok(StrExpr::Tag(self.member()?)),
            Some(Token::Ident(word)) if word == "target" => Ok(StrExpr::Target(self.member()?)),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                self.error("expected string, tags.<k> or target.<k>")
            }
        }
    }
}
