use std::collections::BTreeMap;

use thiserror::Error;

use crate::flow::parse_number;
use crate::state::format_number;

/// 表达式求值错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("unexpected character `{0}` at {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("operator `{0}` needs numeric operands")]
    NotNumeric(char),
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f64),
    Text(String),
}

impl Operand {
    fn from_variable(raw: Option<&String>) -> Self {
        match raw {
            Some(value) => match parse_number(value) {
                Some(n) => Operand::Number(n),
                None => Operand::Text(value.clone()),
            },
            None => Operand::Text(String::new()),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Operand::Number(n) => Some(*n),
            Operand::Text(text) if text.trim().is_empty() => Some(0.0),
            Operand::Text(text) => parse_number(text),
        }
    }

    fn into_text(self) -> String {
        match self {
            Operand::Number(n) => format_number(n),
            Operand::Text(text) => text,
        }
    }
}

/// 计算简单表达式
///
/// 支持 `+ - * / %`、括号、数字、引号字符串以及变量引用（`name` 或 `{{name}}`）。
/// `+` 遇到非数字操作数时做字符串拼接，缺失变量视为空字符串
pub fn evaluate(
    expression: &str,
    variables: &BTreeMap<String, String>,
) -> Result<String, ExpressionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        variables,
    };
    let value = parser.expr()?;
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(ExpressionError::UnexpectedToken(format!("{token:?}")));
    }
    Ok(value.into_text())
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
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
            '{' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let mut end = start;
                while end + 1 < chars.len() && !(chars[end] == '}' && chars[end + 1] == '}') {
                    end += 1;
                }
                if end + 1 >= chars.len() {
                    return Err(ExpressionError::UnexpectedEnd);
                }
                let name: String = chars[start..end].iter().collect();
                tokens.push(Token::Ident(name.trim().to_string()));
                i = end + 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(ExpressionError::UnexpectedEnd);
                }
                tokens.push(Token::Text(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedToken(raw.clone()))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExpressionError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    variables: &'a BTreeMap<String, String>,
}

impl<'a> Parser<'a> {
    fn peek_op(&self) -> Option<char> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Operand, ExpressionError> {
        let mut left = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek_op() {
            self.pos += 1;
            let right = self.term()?;
            left = match (op, left.as_number(), right.as_number()) {
                ('+', Some(l), Some(r)) => Operand::Number(l + r),
                ('+', _, _) => Operand::Text(left.into_text() + &right.into_text()),
                (_, Some(l), Some(r)) => Operand::Number(l - r),
                _ => return Err(ExpressionError::NotNumeric(op)),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Operand, ExpressionError> {
        let mut left = self.factor()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek_op() {
            self.pos += 1;
            let right = self.factor()?;
            let (l, r) = match (left.as_number(), right.as_number()) {
                (Some(l), Some(r)) => (l, r),
                _ => return Err(ExpressionError::NotNumeric(op)),
            };
            left = match op {
                '*' => Operand::Number(l * r),
                _ if r == 0.0 => return Err(ExpressionError::DivisionByZero),
                '/' => Operand::Number(l / r),
                _ => Operand::Number(l % r),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Operand, ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Operand::Number(n)),
            Token::Text(text) => Ok(Operand::Text(text)),
            Token::Ident(name) => Ok(Operand::from_variable(self.variables.get(&name))),
            Token::Op('-') => {
                let value = self.factor()?;
                value
                    .as_number()
                    .map(|n| Operand::Number(-n))
                    .ok_or(ExpressionError::NotNumeric('-'))
            }
            Token::LParen => {
                let value = self.expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    Some(other) => Err(ExpressionError::UnexpectedToken(format!("{other:?}"))),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            other => Err(ExpressionError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("balance".to_string(), "120".to_string());
        vars.insert("bonus".to_string(), "7.5".to_string());
        vars.insert("name".to_string(), "Alice".to_string());
        vars
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(evaluate("1 + 2 * 3", &vars()).unwrap(), "7");
        assert_eq!(evaluate("(1 + 2) * 3", &vars()).unwrap(), "9");
        assert_eq!(evaluate("-4 + 10 % 3", &vars()).unwrap(), "-3");
    }

    #[test]
    fn test_variables() {
        assert_eq!(evaluate("balance + bonus", &vars()).unwrap(), "127.5");
        assert_eq!(evaluate("{{balance}} * 2", &vars()).unwrap(), "240");
        assert_eq!(evaluate("missing + 1", &vars()).unwrap(), "1");
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(evaluate("'Hi ' + name", &vars()).unwrap(), "Hi Alice");
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            evaluate("balance / 0", &vars()).unwrap_err(),
            ExpressionError::DivisionByZero
        );
        assert!(evaluate("name * 2", &vars()).is_err());
        assert!(evaluate("(1 + 2", &vars()).is_err());
        assert!(evaluate("1 $ 2", &vars()).is_err());
    }
}
