use super::{interpolate, ToolOutcome};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::time::Duration;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ScriptTool {
    pub expression_template: String,
}

impl ScriptTool {
    pub fn new(expression_template: &str) -> Self {
        Self {
            expression_template: expression_template.to_string(),
        }
    }

    /// Evaluates a restricted arithmetic/string expression after `{{name}}`
    /// interpolation. No loops, no file or network access: the grammar admits
    /// only numbers, quoted strings, `+ - * /`, parentheses, so a wall-clock
    /// timeout is defensive rather than load-bearing (`spec.md` §6).
    pub fn invoke(&self, params: &HashMap<String, String>) -> CoreResult<ToolOutcome> {
        let expr = interpolate(&self.expression_template, params);
        match evaluate(&expr) {
            Ok(value) => Ok(ToolOutcome {
                stdout: value,
                stderr: String::new(),
                truncated: false,
            }),
            Err(e) => Ok(ToolOutcome {
                stdout: String::new(),
                stderr: e,
                truncated: false,
            }),
        }
    }

    pub async fn invoke_with_timeout(&self, params: &HashMap<String, String>) -> CoreResult<ToolOutcome> {
        match tokio::time::timeout(SCRIPT_TIMEOUT, async { self.invoke(params) }).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ToolError("script evaluation timed out".into())),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    fn into_display(self) -> String {
        match self {
            Value::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{n}")
                } else {
                    n.to_string()
                }
            }
            Value::Text(s) => s,
        }
    }
}

fn evaluate(expr: &str) -> Result<String, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing input at token {}", parser.pos));
    }
    Ok(value.into_display())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
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
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let n: f64 = raw.parse().map_err(|_| format!("bad number literal: {raw}"))?;
                tokens.push(Token::Number(n));
            }
            other => return Err(format!("unexpected character: {other}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_expr(&mut self) -> Result<Value, String> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let right = self.parse_term()?;
                    left = add(left, right)?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let right = self.parse_term()?;
                    left = Value::Number(as_number(&left)? - as_number(&right)?);
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Value, String> {
        let mut left = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    let right = self.parse_factor()?;
                    left = Value::Number(as_number(&left)? * as_number(&right)?);
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let right = self.parse_factor()?;
                    let divisor = as_number(&right)?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    left = Value::Number(as_number(&left)? / divisor);
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Value, String> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Value::Number(n))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Value::Text(s))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                let value = self.parse_factor()?;
                Ok(Value::Number(-as_number(&value)?))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err("expected closing parenthesis".to_string()),
                }
            }
            other => Err(format!("unexpected token: {other:?}")),
        }
    }
}

fn as_number(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Text(s) => Err(format!("expected a number, found string {s:?}")),
    }
}

fn add(left: Value, right: Value) -> Result<Value, String> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (Value::Text(a), Value::Text(b)) => Ok(Value::Text(a + &b)),
        (Value::Text(a), Value::Number(b)) => Ok(Value::Text(a + &b.to_string())),
        (Value::Number(a), Value::Text(b)) => Ok(Value::Text(a.to_string() + &b)),
    }
}
