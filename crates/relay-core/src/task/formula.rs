//! Arithmetic evaluation for calculate tasks and formula fields.
//!
//! Grammar:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := ('-' | '+') factor | number | '(' expr ')'
//! ```
//!
//! Anything outside the grammar is rejected instead of being filtered out.

use crate::CoreError;
use serde_json::{Number, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {}
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '0'..='9' | '.' => {
                let start = i;
                while i + 1 < chars.len() && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..=i].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    CoreError::ExpressionError(format!("Invalid number '{}'", literal))
                })?;
                tokens.push(Token::Num(value));
            }
            other => {
                return Err(CoreError::ExpressionError(format!(
                    "Unexpected character '{}' in '{}'",
                    other, input
                )))
            }
        }
        i += 1;
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<f64, CoreError> {
        let mut value = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.bump();
            let rhs = self.term()?;
            value = if op == Token::Plus { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, CoreError> {
        let mut value = self.factor()?;
        while let Some(op @ (Token::Star | Token::Slash)) = self.peek() {
            self.bump();
            let rhs = self.factor()?;
            if op == Token::Star {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err(CoreError::ExpressionError("Division by zero".to_string()));
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, CoreError> {
        match self.bump() {
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::Plus) => self.factor(),
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(CoreError::ExpressionError("Missing ')'".to_string())),
                }
            }
            Some(token) => Err(CoreError::ExpressionError(format!(
                "Unexpected token {:?}",
                token
            ))),
            None => Err(CoreError::ExpressionError(
                "Unexpected end of expression".to_string(),
            )),
        }
    }
}

/// Evaluate an arithmetic expression
pub fn evaluate(expression: &str) -> Result<f64, CoreError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(CoreError::ExpressionError("Empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(CoreError::ExpressionError(format!(
            "Trailing input in '{}'",
            expression
        )));
    }
    if !value.is_finite() {
        return Err(CoreError::ExpressionError(format!(
            "'{}' is not a finite number",
            expression
        )));
    }
    Ok(value)
}

/// JSON number for a result, integral when the value has no fraction
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}
