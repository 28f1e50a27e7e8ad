// classes.rs - Class expression evaluation.
//
// Grammar (loosest binding first):
//
//   expr   := term   ( ('|' | '||') term )*
//   term   := factor ( ('.' | '&') factor )*
//   factor := '!' factor | '(' expr ')' | name
//
// Names are matched against whatever the caller considers defined, so the
// same evaluator serves promise guards and `classes` promise expressions.

use crate::error::EvalError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    Or,
    And,
    Not,
    Open,
    Close,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Token::Or);
            }
            '.' | '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == ':' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(name));
            }
            other => {
                return Err(EvalError::ClassExpression {
                    expression: expression.to_string(),
                    reason: format!("unexpected character '{}'", other),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a, F> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    is_defined: F,
}

impl<F: Fn(&str) -> bool> Parser<'_, F> {
    fn error(&self, reason: &str) -> EvalError {
        EvalError::ClassExpression {
            expression: self.expression.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<bool, EvalError> {
        let mut value = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.term()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<bool, EvalError> {
        let mut value = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.factor()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<bool, EvalError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(!self.factor()?)
            }
            Some(Token::Open) => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.error("missing ')'"));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok((self.is_defined)(&name))
            }
            Some(_) => Err(self.error("expected a class name, '!' or '('")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// Evaluate `expression`, asking `is_defined` about every class name.
pub fn evaluate<F>(expression: &str, is_defined: F) -> Result<bool, EvalError>
where
    F: Fn(&str) -> bool,
{
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        expression,
        tokens,
        pos: 0,
        is_defined,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing tokens"));
    }
    Ok(value)
}
