//! Fused element-wise expressions carried by MemBound operators.
//!
//! Inputs are referenced by position, so an expression is independent of the
//! tensor identities it is applied to. [`FusedExpr::render`] produces the
//! textual form handed to synthesizers (infix arithmetic plus function calls
//! over variable names) and [`FusedExpr::parse`] reads it back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Log,
    Sqrt,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 8] = [
        UnaryOp::Neg,
        UnaryOp::Abs,
        UnaryOp::Relu,
        UnaryOp::Sigmoid,
        UnaryOp::Tanh,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sqrt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
        }
    }

    pub fn from_name(name: &str) -> Option<UnaryOp> {
        UnaryOp::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
}

impl BinaryOp {
    /// Infix symbol, `None` for operators rendered as calls.
    pub fn symbol(self) -> Option<char> {
        match self {
            BinaryOp::Add => Some('+'),
            BinaryOp::Sub => Some('-'),
            BinaryOp::Mul => Some('*'),
            BinaryOp::Div => Some('/'),
            BinaryOp::Pow | BinaryOp::Max | BinaryOp::Min => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        }
    }

    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Pow => lhs.powf(rhs),
            BinaryOp::Max => lhs.max(rhs),
            BinaryOp::Min => lhs.min(rhs),
        }
    }

    pub fn from_name(name: &str) -> Option<BinaryOp> {
        [
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::Div,
            BinaryOp::Pow,
            BinaryOp::Max,
            BinaryOp::Min,
        ]
        .into_iter()
        .find(|op| op.name() == name)
    }

    fn from_call(name: &str) -> Option<BinaryOp> {
        match name {
            "pow" => Some(BinaryOp::Pow),
            "max" => Some(BinaryOp::Max),
            "min" => Some(BinaryOp::Min),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FusedExpr {
    Input(usize),
    Const(f32),
    Unary(UnaryOp, Box<FusedExpr>),
    Binary(BinaryOp, Box<FusedExpr>, Box<FusedExpr>),
}

impl FusedExpr {
    pub fn input(index: usize) -> Self {
        FusedExpr::Input(index)
    }

    pub fn constant(value: f32) -> Self {
        FusedExpr::Const(value)
    }

    pub fn unary(op: UnaryOp, operand: FusedExpr) -> Self {
        FusedExpr::Unary(op, Box::new(operand))
    }

    pub fn binary(op: BinaryOp, lhs: FusedExpr, rhs: FusedExpr) -> Self {
        FusedExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn add(lhs: FusedExpr, rhs: FusedExpr) -> Self {
        Self::binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: FusedExpr, rhs: FusedExpr) -> Self {
        Self::binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: FusedExpr, rhs: FusedExpr) -> Self {
        Self::binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(lhs: FusedExpr, rhs: FusedExpr) -> Self {
        Self::binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn relu(operand: FusedExpr) -> Self {
        Self::unary(UnaryOp::Relu, operand)
    }

    /// Largest input index referenced, `None` for constant expressions.
    pub fn max_input(&self) -> Option<usize> {
        match self {
            FusedExpr::Input(index) => Some(*index),
            FusedExpr::Const(_) => None,
            FusedExpr::Unary(_, operand) => operand.max_input(),
            FusedExpr::Binary(_, lhs, rhs) => match (lhs.max_input(), rhs.max_input()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }

    /// Rejects references past `input_count` and non-finite constants.
    pub fn validate(&self, input_count: usize) -> Result<()> {
        match self {
            FusedExpr::Input(index) if *index >= input_count => Err(Error::config(format!(
                "fused expression references input {index} but the operator has {input_count} inputs"
            ))),
            FusedExpr::Input(_) => Ok(()),
            FusedExpr::Const(value) if !value.is_finite() => Err(Error::config(format!(
                "fused expression constant {value} is not finite"
            ))),
            FusedExpr::Const(_) => Ok(()),
            FusedExpr::Unary(_, operand) => operand.validate(input_count),
            FusedExpr::Binary(_, lhs, rhs) => {
                lhs.validate(input_count)?;
                rhs.validate(input_count)
            }
        }
    }

    /// Host reference evaluation for one element.
    pub fn eval(&self, inputs: &[f32]) -> f32 {
        match self {
            FusedExpr::Input(index) => inputs[*index],
            FusedExpr::Const(value) => *value,
            FusedExpr::Unary(op, operand) => op.apply(operand.eval(inputs)),
            FusedExpr::Binary(op, lhs, rhs) => op.apply(lhs.eval(inputs), rhs.eval(inputs)),
        }
    }

    pub fn render<S: AsRef<str>>(&self, names: &[S]) -> Result<String> {
        let mut out = String::new();
        self.render_into(names, &mut out)?;
        Ok(out)
    }

    fn render_into<S: AsRef<str>>(&self, names: &[S], out: &mut String) -> Result<()> {
        match self {
            FusedExpr::Input(index) => {
                let name = names.get(*index).ok_or_else(|| {
                    Error::config(format!("no variable name for fused input {index}"))
                })?;
                out.push_str(name.as_ref());
            }
            FusedExpr::Const(value) => {
                if value.is_sign_negative() {
                    out.push_str(&format!("({value:?})"));
                } else {
                    out.push_str(&format!("{value:?}"));
                }
            }
            FusedExpr::Unary(op, operand) => {
                out.push_str(op.name());
                out.push('(');
                operand.render_into(names, out)?;
                out.push(')');
            }
            FusedExpr::Binary(op, lhs, rhs) => match op.symbol() {
                Some(symbol) => {
                    out.push('(');
                    lhs.render_into(names, out)?;
                    out.push(' ');
                    out.push(symbol);
                    out.push(' ');
                    rhs.render_into(names, out)?;
                    out.push(')');
                }
                None => {
                    out.push_str(op.name());
                    out.push('(');
                    lhs.render_into(names, out)?;
                    out.push_str(", ");
                    rhs.render_into(names, out)?;
                    out.push(')');
                }
            },
        }
        Ok(())
    }

    /// Parses the rendered form back, resolving variables against `names`.
    pub fn parse<S: AsRef<str>>(text: &str, names: &[S]) -> Result<FusedExpr> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            names: names.iter().map(|name| name.as_ref()).collect(),
        };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::config(format!(
                "trailing input in fused expression at token {}",
                parser.pos
            )));
        }
        Ok(expr)
    }
}

impl fmt::Display for FusedExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = self.max_input().map_or(0, |max| max + 1);
        let names: Vec<String> = (0..limit).map(|index| format!("in{index}")).collect();
        match self.render(&names) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f32),
    Symbol(char),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal.parse::<f32>().map_err(|_| {
                Error::config(format!("invalid numeric literal '{literal}' in fused expression"))
            })?;
            tokens.push(Token::Number(value));
        } else if "+-*/(),".contains(c) {
            tokens.push(Token::Symbol(c));
            i += 1;
        } else {
            return Err(Error::config(format!(
                "unexpected character '{c}' in fused expression"
            )));
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    names: Vec<&'a str>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, symbol: char) -> Result<()> {
        if self.eat(symbol) {
            Ok(())
        } else {
            Err(Error::config(format!(
                "expected '{symbol}' at token {} of fused expression",
                self.pos
            )))
        }
    }

    fn expr(&mut self) -> Result<FusedExpr> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat('+') {
                BinaryOp::Add
            } else if self.eat('-') {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.term()?;
            lhs = FusedExpr::binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<FusedExpr> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat('*') {
                BinaryOp::Mul
            } else if self.eat('/') {
                BinaryOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = FusedExpr::binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<FusedExpr> {
        if self.eat('-') {
            return Ok(match self.unary()? {
                FusedExpr::Const(value) => FusedExpr::Const(-value),
                other => FusedExpr::unary(UnaryOp::Neg, other),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<FusedExpr> {
        let token = self.peek().cloned().ok_or_else(|| {
            Error::config("unexpected end of fused expression".to_string())
        })?;
        self.pos += 1;
        match token {
            Token::Number(value) => Ok(FusedExpr::Const(value)),
            Token::Symbol('(') => {
                let inner = self.expr()?;
                self.expect(')')?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.eat('(') {
                    return self.call(&name);
                }
                self.names
                    .iter()
                    .position(|candidate| *candidate == name)
                    .map(FusedExpr::Input)
                    .ok_or_else(|| {
                        Error::config(format!("unknown variable '{name}' in fused expression"))
                    })
            }
            Token::Symbol(symbol) => Err(Error::config(format!(
                "unexpected '{symbol}' in fused expression"
            ))),
        }
    }

    fn call(&mut self, name: &str) -> Result<FusedExpr> {
        if let Some(op) = UnaryOp::ALL.into_iter().find(|op| op.name() == name) {
            let operand = self.expr()?;
            self.expect(')')?;
            return Ok(FusedExpr::unary(op, operand));
        }
        if let Some(op) = BinaryOp::from_call(name) {
            let lhs = self.expr()?;
            self.expect(',')?;
            let rhs = self.expr()?;
            self.expect(')')?;
            return Ok(FusedExpr::binary(op, lhs, rhs));
        }
        Err(Error::config(format!(
            "unknown function '{name}' in fused expression"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["var_3".to_string(), "var_4".to_string()]
    }

    #[test]
    fn render_uses_variable_names_and_calls() {
        let expr = FusedExpr::relu(FusedExpr::mul(
            FusedExpr::add(FusedExpr::input(0), FusedExpr::input(1)),
            FusedExpr::constant(0.5),
        ));
        assert_eq!(expr.render(&names()).unwrap(), "relu(((var_3 + var_4) * 0.5))");
    }

    #[test]
    fn parse_respects_precedence() {
        let parsed = FusedExpr::parse("var_3 + var_4 * 2.0", &names()).unwrap();
        let expected = FusedExpr::add(
            FusedExpr::input(0),
            FusedExpr::mul(FusedExpr::input(1), FusedExpr::constant(2.0)),
        );
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rendered_text_parses_back_to_the_same_tree() {
        let expr = FusedExpr::binary(
            BinaryOp::Max,
            FusedExpr::unary(UnaryOp::Neg, FusedExpr::constant(1.0)),
            FusedExpr::binary(
                BinaryOp::Pow,
                FusedExpr::input(1),
                FusedExpr::sub(FusedExpr::constant(-2.5), FusedExpr::input(0)),
            ),
        );
        let text = expr.render(&names()).unwrap();
        assert_eq!(FusedExpr::parse(&text, &names()).unwrap(), expr);
    }

    #[test]
    fn parse_rejects_unknown_variables_and_functions() {
        assert!(FusedExpr::parse("var_9 + 1.0", &names()).is_err());
        assert!(FusedExpr::parse("gelu(var_3)", &names()).is_err());
        assert!(FusedExpr::parse("(var_3 + var_4", &names()).is_err());
    }

    #[test]
    fn eval_matches_manual_arithmetic() {
        let expr = FusedExpr::parse("sigmoid(var_3) * var_4 - 1e-1", &names()).unwrap();
        let x = 0.3f32;
        let y = -2.0f32;
        let expected = (1.0 / (1.0 + (-x).exp())) * y - 0.1;
        assert_eq!(expr.eval(&[x, y]), expected);
    }

    #[test]
    fn validate_rejects_out_of_range_inputs() {
        let expr = FusedExpr::add(FusedExpr::input(0), FusedExpr::input(2));
        assert!(expr.validate(2).is_err());
        assert!(expr.validate(3).is_ok());
        assert!(FusedExpr::constant(f32::NAN).validate(1).is_err());
    }
}
