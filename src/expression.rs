// 🧮 Expression Language
// Small, side-effect-free expressions for derived variables, record checks and aggregations.
// Parsed once per rule definition; evaluated per record against a read-only scope.

use crate::error::ExpressionError;
use crate::parser::FieldValue;
use chrono::{Days, NaiveDate};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// RUNTIME VALUES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Date(_) => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
        }
    }

    /// JSON scalars map directly; arrays and objects have no expression form
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            _ => Value::Null,
        }
    }
}

impl From<&FieldValue> for Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => Value::Text(s.clone()),
            FieldValue::Integer(n) => Value::Number(*n as f64),
            FieldValue::Date(d) => Value::Date(*d),
            FieldValue::Currency(cents) => Value::Number(*cents as f64 / 100.0),
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Null => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y%m%d"))
        .ok()
}

/// Ordering between two values. `Ok(None)` when either side is null.
pub fn compare_values(a: &Value, b: &Value) -> Result<Option<Ordering>, ExpressionError> {
    let mismatch = || {
        ExpressionError::TypeMismatch(format!("cannot compare {} with {}", a.type_name(), b.type_name()))
    };

    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(None),
        (Value::Number(x), Value::Number(y)) => Ok(x.partial_cmp(y)),
        (Value::Text(x), Value::Text(y)) => Ok(Some(x.cmp(y))),
        (Value::Date(x), Value::Date(y)) => Ok(Some(x.cmp(y))),
        (Value::Bool(x), Value::Bool(y)) => Ok(Some(x.cmp(y))),
        (Value::Number(x), Value::Text(t)) => {
            let y: f64 = t.trim().parse().map_err(|_| mismatch())?;
            Ok(x.partial_cmp(&y))
        }
        (Value::Text(t), Value::Number(y)) => {
            let x: f64 = t.trim().parse().map_err(|_| mismatch())?;
            Ok(x.partial_cmp(y))
        }
        (Value::Date(x), Value::Text(t)) => {
            let y = parse_date_text(t).ok_or_else(mismatch)?;
            Ok(Some(x.cmp(&y)))
        }
        (Value::Text(t), Value::Date(y)) => {
            let x = parse_date_text(t).ok_or_else(mismatch)?;
            Ok(Some(x.cmp(y)))
        }
        _ => Err(mismatch()),
    }
}

/// Equality never faults: incompatible types are simply unequal
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => matches!(compare_values(a, b), Ok(Some(Ordering::Equal))),
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Len,
    Trim,
    Upper,
    Lower,
    Abs,
    Round,
    Substr,
    IsNull,
    Coalesce,
    Min,
    Max,
    In,
    StartsWith,
    EndsWith,
    Number,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        let f = match name.to_ascii_lowercase().as_str() {
            "len" => Function::Len,
            "trim" => Function::Trim,
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "abs" => Function::Abs,
            "round" => Function::Round,
            "substr" => Function::Substr,
            "isnull" => Function::IsNull,
            "coalesce" => Function::Coalesce,
            "min" => Function::Min,
            "max" => Function::Max,
            "in" => Function::In,
            "startswith" => Function::StartsWith,
            "endswith" => Function::EndsWith,
            "number" => Function::Number,
            _ => return None,
        };
        Some(f)
    }

    /// (min, max) argument counts; `None` = variadic
    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::Len
            | Function::Trim
            | Function::Upper
            | Function::Lower
            | Function::Abs
            | Function::IsNull
            | Function::Number => (1, Some(1)),
            Function::Round => (1, Some(2)),
            Function::Substr => (2, Some(3)),
            Function::StartsWith | Function::EndsWith => (2, Some(2)),
            Function::Coalesce | Function::Min | Function::Max => (1, None),
            Function::In => (2, None),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Function::Len => "len",
            Function::Trim => "trim",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Substr => "substr",
            Function::IsNull => "isnull",
            Function::Coalesce => "coalesce",
            Function::Min => "min",
            Function::Max => "max",
            Function::In => "in",
            Function::StartsWith => "startswith",
            Function::EndsWith => "endswith",
            Function::Number => "number",
        }
    }
}

// ============================================================================
// LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Number(n) => write!(f, "{}", n),
            Tok::Str(s) => write!(f, "'{}'", s),
            Tok::Ident(s) => f.write_str(s),
            Tok::True => f.write_str("true"),
            Tok::False => f.write_str("false"),
            Tok::Null => f.write_str("null"),
            Tok::LParen => f.write_str("("),
            Tok::RParen => f.write_str(")"),
            Tok::Comma => f.write_str(","),
            Tok::Plus => f.write_str("+"),
            Tok::Minus => f.write_str("-"),
            Tok::Star => f.write_str("*"),
            Tok::Slash => f.write_str("/"),
            Tok::Percent => f.write_str("%"),
            Tok::EqEq => f.write_str("=="),
            Tok::NotEq => f.write_str("!="),
            Tok::Lt => f.write_str("<"),
            Tok::Le => f.write_str("<="),
            Tok::Gt => f.write_str(">"),
            Tok::Ge => f.write_str(">="),
            Tok::And => f.write_str("&&"),
            Tok::Or => f.write_str("||"),
            Tok::Not => f.write_str("!"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(Tok, usize)>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse()
                .map_err(|_| ExpressionError::UnexpectedChar { ch: c, pos: start })?;
            tokens.push((Tok::Number(n), start));
            continue;
        }

        if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(ExpressionError::UnterminatedString(start)),
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') if chars.get(i + 1).is_some() => {
                        text.push(chars[i + 1]);
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((Tok::Str(text), start));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let tok = match word.to_ascii_lowercase().as_str() {
                "true" => Tok::True,
                "false" => Tok::False,
                "null" => Tok::Null,
                "and" => Tok::And,
                "or" => Tok::Or,
                "not" => Tok::Not,
                _ => Tok::Ident(word),
            };
            tokens.push((tok, start));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (tok, width) = match (c, next) {
            ('=', Some('=')) => (Tok::EqEq, 2),
            ('!', Some('=')) => (Tok::NotEq, 2),
            ('<', Some('=')) => (Tok::Le, 2),
            ('>', Some('=')) => (Tok::Ge, 2),
            ('&', Some('&')) => (Tok::And, 2),
            ('|', Some('|')) => (Tok::Or, 2),
            ('<', _) => (Tok::Lt, 1),
            ('>', _) => (Tok::Gt, 1),
            ('!', _) => (Tok::Not, 1),
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            (',', _) => (Tok::Comma, 1),
            ('+', _) => (Tok::Plus, 1),
            ('-', _) => (Tok::Minus, 1),
            ('*', _) => (Tok::Star, 1),
            ('/', _) => (Tok::Slash, 1),
            ('%', _) => (Tok::Percent, 1),
            _ => return Err(ExpressionError::UnexpectedChar { ch: c, pos: start }),
        };
        tokens.push((tok, start));
        i += width;
    }

    Ok(tokens)
}

// ============================================================================
// PARSER (precedence climbing)
// ============================================================================

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<(Tok, usize)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn unexpected(&self, expected: &str) -> ExpressionError {
        match self.tokens.get(self.pos) {
            Some((tok, pos)) => ExpressionError::UnexpectedToken {
                found: tok.to_string(),
                pos: *pos,
                expected: expected.to_string(),
            },
            None => ExpressionError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, tok: Tok, expected: &str) -> Result<(), ExpressionError> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn binary_op(tok: &Tok) -> Option<(BinaryOp, u8)> {
        let op = match tok {
            Tok::Or => (BinaryOp::Or, 1),
            Tok::And => (BinaryOp::And, 2),
            Tok::EqEq => (BinaryOp::Eq, 3),
            Tok::NotEq => (BinaryOp::NotEq, 3),
            Tok::Lt => (BinaryOp::Lt, 4),
            Tok::Le => (BinaryOp::Le, 4),
            Tok::Gt => (BinaryOp::Gt, 4),
            Tok::Ge => (BinaryOp::Ge, 4),
            Tok::Plus => (BinaryOp::Add, 5),
            Tok::Minus => (BinaryOp::Sub, 5),
            Tok::Star => (BinaryOp::Mul, 6),
            Tok::Slash => (BinaryOp::Div, 6),
            Tok::Percent => (BinaryOp::Mod, 6),
            _ => return None,
        };
        Some(op)
    }

    fn expression(&mut self, min_prec: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;

        while let Some((op, prec)) = self.peek().and_then(Self::binary_op) {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Some(Tok::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some((tok, pos)) = self.advance() else {
            return Err(ExpressionError::UnexpectedEnd);
        };

        match tok {
            Tok::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::LParen => {
                let inner = self.expression(0)?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                if self.peek() != Some(&Tok::LParen) {
                    return Ok(Expr::Ident(name));
                }
                self.pos += 1;
                let function =
                    Function::lookup(&name).ok_or(ExpressionError::UnknownFunction(name.clone()))?;
                let mut args = Vec::new();
                if self.peek() != Some(&Tok::RParen) {
                    loop {
                        args.push(self.expression(0)?);
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Tok::RParen, "')' or ','")?;
                check_arity(function, args.len())?;
                Ok(Expr::Call(function, args))
            }
            other => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
                pos,
                expected: "a value".to_string(),
            }),
        }
    }
}

fn check_arity(function: Function, got: usize) -> Result<(), ExpressionError> {
    let (min, max) = function.arity();
    if got < min || max.is_some_and(|m| got > m) {
        let expected = match max {
            Some(m) if m == min => min.to_string(),
            Some(m) => format!("{}-{}", min, m),
            None => format!("at least {}", min),
        };
        return Err(ExpressionError::Arity {
            name: function.name().to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Name resolution for identifiers
pub trait Scope {
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl<F> Scope for F
where
    F: Fn(&str) -> Option<Value>,
{
    fn resolve(&self, name: &str) -> Option<Value> {
        self(name)
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExpressionError::UnexpectedEnd);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression(0)?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.unexpected("end of expression"));
        }
        Ok(expr)
    }

    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => scope
                .resolve(name)
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone())),
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!inner.eval(scope)?.is_truthy())),
            Expr::Unary(UnaryOp::Neg, inner) => match inner.eval(scope)? {
                Value::Null => Ok(Value::Null),
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(ExpressionError::TypeMismatch(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
            },
            Expr::Binary(BinaryOp::And, l, r) => {
                if !l.eval(scope)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(r.eval(scope)?.is_truthy()))
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                if l.eval(scope)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(r.eval(scope)?.is_truthy()))
            }
            Expr::Binary(op, l, r) => {
                let a = l.eval(scope)?;
                let b = r.eval(scope)?;
                binary(*op, a, b)
            }
            Expr::Call(function, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*function, values)
            }
        }
    }

    /// Evaluate and interpret the result as a boolean
    pub fn eval_bool(&self, scope: &dyn Scope) -> Result<bool, ExpressionError> {
        Ok(self.eval(scope)?.is_truthy())
    }
}

fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value, ExpressionError> {
    let ordering = |a: &Value, b: &Value, test: fn(Ordering) -> bool| -> Result<Value, ExpressionError> {
        Ok(Value::Bool(compare_values(a, b)?.is_some_and(test)))
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&a, &b))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&a, &b))),
        BinaryOp::Lt => ordering(&a, &b, |o| o == Ordering::Less),
        BinaryOp::Le => ordering(&a, &b, |o| o != Ordering::Greater),
        BinaryOp::Gt => ordering(&a, &b, |o| o == Ordering::Greater),
        BinaryOp::Ge => ordering(&a, &b, |o| o != Ordering::Less),
        BinaryOp::Add => add(a, b),
        BinaryOp::Sub => subtract(a, b),
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => arithmetic(op, a, b),
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit in eval"),
    }
}

fn add(a: Value, b: Value) -> Result<Value, ExpressionError> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
        (Value::Date(d), Value::Number(n)) | (Value::Number(n), Value::Date(d)) => {
            shift_days(d, n).map(Value::Date)
        }
        (a @ Value::Text(_), b) | (a, b @ Value::Text(_)) => Ok(Value::Text(format!("{}{}", a, b))),
        (a, b) => Err(ExpressionError::TypeMismatch(format!(
            "cannot add {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn subtract(a: Value, b: Value) -> Result<Value, ExpressionError> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x - y)),
        (Value::Date(d), Value::Number(n)) => shift_days(d, -n).map(Value::Date),
        (Value::Date(x), Value::Date(y)) => Ok(Value::Number((x - y).num_days() as f64)),
        (a, b) => Err(ExpressionError::TypeMismatch(format!(
            "cannot subtract {} from {}",
            b.type_name(),
            a.type_name()
        ))),
    }
}

/// Move a date by whole days; out-of-range results are a fault, not a panic
fn shift_days(date: NaiveDate, days: f64) -> Result<NaiveDate, ExpressionError> {
    let out_of_range = || ExpressionError::DateOutOfRange(format!("{} shifted by {} days", date, days));
    if !days.is_finite() {
        return Err(out_of_range());
    }
    let whole = days.trunc() as i64;
    let shifted = if whole >= 0 {
        date.checked_add_days(Days::new(whole.unsigned_abs()))
    } else {
        date.checked_sub_days(Days::new(whole.unsigned_abs()))
    };
    shifted.ok_or_else(out_of_range)
}

fn arithmetic(op: BinaryOp, a: Value, b: Value) -> Result<Value, ExpressionError> {
    let (x, y) = match (&a, &b) {
        (Value::Null, _) | (_, Value::Null) => return Ok(Value::Null),
        (Value::Number(x), Value::Number(y)) => (*x, *y),
        _ => {
            return Err(ExpressionError::TypeMismatch(format!(
                "arithmetic on {} and {}",
                a.type_name(),
                b.type_name()
            )))
        }
    };

    match op {
        BinaryOp::Mul => Ok(Value::Number(x * y)),
        BinaryOp::Div if y == 0.0 => Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => Ok(Value::Number(x / y)),
        BinaryOp::Mod if y == 0.0 => Err(ExpressionError::DivisionByZero),
        _ => Ok(Value::Number(x % y)),
    }
}

fn text_of(value: &Value) -> String {
    value.to_string()
}

fn number_arg(function: Function, value: &Value) -> Result<Option<f64>, ExpressionError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(Some(*n)),
        other => Err(ExpressionError::TypeMismatch(format!(
            "{}() expects a number, got {}",
            function.name(),
            other.type_name()
        ))),
    }
}

fn call(function: Function, args: Vec<Value>) -> Result<Value, ExpressionError> {
    let first = args.first().cloned().unwrap_or(Value::Null);

    match function {
        Function::Len => Ok(Value::Number(text_of(&first).chars().count() as f64)),
        Function::Trim | Function::Upper | Function::Lower => {
            if first.is_null() {
                return Ok(Value::Null);
            }
            let text = text_of(&first);
            Ok(Value::Text(match function {
                Function::Trim => text.trim().to_string(),
                Function::Upper => text.to_uppercase(),
                _ => text.to_lowercase(),
            }))
        }
        Function::Abs => Ok(number_arg(function, &first)?.map_or(Value::Null, |n| Value::Number(n.abs()))),
        Function::Round => {
            let Some(n) = number_arg(function, &first)? else {
                return Ok(Value::Null);
            };
            let places = match args.get(1) {
                Some(v) => number_arg(function, v)?.unwrap_or(0.0),
                None => 0.0,
            };
            let factor = 10f64.powi(places as i32);
            Ok(Value::Number((n * factor).round() / factor))
        }
        Function::Substr => {
            if first.is_null() {
                return Ok(Value::Null);
            }
            let text = text_of(&first);
            let start = number_arg(function, &args[1])?.unwrap_or(0.0).max(0.0) as usize;
            let taken: String = match args.get(2) {
                Some(len) => {
                    let len = number_arg(function, len)?.unwrap_or(0.0).max(0.0) as usize;
                    text.chars().skip(start).take(len).collect()
                }
                None => text.chars().skip(start).collect(),
            };
            Ok(Value::Text(taken))
        }
        Function::IsNull => Ok(Value::Bool(first.is_null())),
        Function::Coalesce => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        Function::Min | Function::Max => {
            let mut best: Option<Value> = None;
            for value in args.into_iter().filter(|v| !v.is_null()) {
                best = match best {
                    None => Some(value),
                    Some(current) => {
                        let ord = compare_values(&value, &current)?;
                        let replace = match function {
                            Function::Min => ord == Some(Ordering::Less),
                            _ => ord == Some(Ordering::Greater),
                        };
                        Some(if replace { value } else { current })
                    }
                };
            }
            Ok(best.unwrap_or(Value::Null))
        }
        Function::In => Ok(Value::Bool(args[1..].iter().any(|v| values_equal(&first, v)))),
        Function::StartsWith | Function::EndsWith => {
            if first.is_null() {
                return Ok(Value::Bool(false));
            }
            let text = text_of(&first);
            let affix = text_of(&args[1]);
            Ok(Value::Bool(match function {
                Function::StartsWith => text.starts_with(&affix),
                _ => text.ends_with(&affix),
            }))
        }
        Function::Number => match first {
            Value::Number(n) => Ok(Value::Number(n)),
            Value::Text(t) => Ok(t.trim().parse().map(Value::Number).unwrap_or(Value::Null)),
            Value::Bool(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
            _ => Ok(Value::Null),
        },
    }
}

// ============================================================================
// MESSAGE TEMPLATES
// ============================================================================

/// Replace `{name}` placeholders; unknown placeholders are left as written
pub fn render_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match lookup(key.trim()) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn eval(src: &str, vars: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
        let lookup = |name: &str| vars.get(name).cloned();
        Expr::parse(src)?.eval(&lookup)
    }

    #[test]
    fn test_precedence() {
        let vars = scope(&[]);
        assert_eq!(eval("1 + 2 * 3", &vars), Ok(Value::Number(7.0)));
        assert_eq!(eval("(1 + 2) * 3", &vars), Ok(Value::Number(9.0)));
        assert_eq!(eval("10 - 4 - 3", &vars), Ok(Value::Number(3.0)));
        assert_eq!(eval("1 < 2 && 3 > 2 || false", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval("not 1 == 2", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval("-2 * 3", &vars), Ok(Value::Number(-6.0)));
    }

    #[test]
    fn test_identifiers_and_unknowns() {
        let vars = scope(&[("debit", Value::Number(10.5)), ("credit", Value::Number(10.5))]);
        assert_eq!(eval("debit == credit", &vars), Ok(Value::Bool(true)));
        assert_eq!(
            eval("missing + 1", &vars),
            Err(ExpressionError::UnknownIdentifier("missing".into()))
        );
    }

    #[test]
    fn test_text_and_dates() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let vars = scope(&[
            ("name", Value::Text("  acme ".into())),
            ("opened", Value::Date(d)),
        ]);

        assert_eq!(eval("upper(trim(name))", &vars), Ok(Value::Text("ACME".into())));
        assert_eq!(eval("len(name)", &vars), Ok(Value::Number(7.0)));
        assert_eq!(eval("'id-' + 42", &vars), Ok(Value::Text("id-42".into())));
        assert_eq!(eval("opened > '2024-01-01'", &vars), Ok(Value::Bool(true)));
        assert_eq!(
            eval("opened + 1", &vars),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()))
        );
        assert_eq!(eval("opened - (opened - 10)", &vars), Ok(Value::Number(10.0)));
    }

    #[test]
    fn test_null_semantics() {
        let vars = scope(&[("x", Value::Null)]);
        assert_eq!(eval("x + 1", &vars), Ok(Value::Null));
        assert_eq!(eval("x == null", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval("x > 1", &vars), Ok(Value::Bool(false)));
        assert_eq!(eval("isnull(x)", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval("coalesce(x, 5)", &vars), Ok(Value::Number(5.0)));
    }

    #[test]
    fn test_functions() {
        let vars = scope(&[("code", Value::Text("MX-1234".into()))]);
        assert_eq!(eval("substr(code, 3, 2)", &vars), Ok(Value::Text("12".into())));
        assert_eq!(eval("startswith(code, 'MX')", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval("in(code, 'A', 'MX-1234')", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval("round(2.345, 2)", &vars), Ok(Value::Number(2.35)));
        assert_eq!(eval("max(1, 7, 3)", &vars), Ok(Value::Number(7.0)));
        assert_eq!(eval("abs(0 - 4)", &vars), Ok(Value::Number(4.0)));
        assert_eq!(eval("number('12.5') * 2", &vars), Ok(Value::Number(25.0)));
    }

    #[test]
    fn test_runtime_faults() {
        let vars = scope(&[("t", Value::Text("abc".into()))]);
        assert_eq!(eval("1 / 0", &vars), Err(ExpressionError::DivisionByZero));
        assert!(matches!(eval("t > 3", &vars), Err(ExpressionError::TypeMismatch(_))));
        assert!(matches!(eval("t * 2", &vars), Err(ExpressionError::TypeMismatch(_))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Expr::parse("1 +"), Err(ExpressionError::UnexpectedEnd)));
        assert!(matches!(Expr::parse("'open"), Err(ExpressionError::UnterminatedString(0))));
        assert!(matches!(Expr::parse("a = b"), Err(ExpressionError::UnexpectedChar { ch: '=', .. })));
        assert!(matches!(Expr::parse("nope(1)"), Err(ExpressionError::UnknownFunction(_))));
        assert!(matches!(Expr::parse("len(1, 2)"), Err(ExpressionError::Arity { .. })));
        assert!(matches!(Expr::parse("1 2"), Err(ExpressionError::UnexpectedToken { .. })));
        assert!(matches!(Expr::parse(""), Err(ExpressionError::UnexpectedEnd)));
    }

    #[test]
    fn test_short_circuit_skips_faults() {
        let vars = scope(&[]);
        assert_eq!(eval("false && (1 / 0 > 0)", &vars), Ok(Value::Bool(false)));
        assert_eq!(eval("true || missing", &vars), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_date_shift_out_of_range_faults() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let vars = scope(&[("d", Value::Date(day))]);

        assert_eq!(eval("d + 1", &vars).unwrap(), Value::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
        assert_eq!(eval("d - 31", &vars).unwrap(), Value::Date(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()));

        // 1e200 * 1e200 is infinite
        let huge = format!("1{}", "0".repeat(200));
        let sources = [
            "d + 1000000000000 > d".to_string(),
            "d - 1000000000000 > d".to_string(),
            "10000000000000000000000 + d > d".to_string(),
            format!("d + {} * {} > d", huge, huge),
        ];
        for src in &sources {
            let err = eval(src, &vars).unwrap_err();
            assert!(matches!(err, ExpressionError::DateOutOfRange(_)), "{}: {:?}", src, err);
        }
    }

    #[test]
    fn test_render_template() {
        let lookup = |key: &str| match key {
            "actual" => Some("50".to_string()),
            "expected" => Some("77".to_string()),
            _ => None,
        };
        assert_eq!(
            render_template("got {actual}, want {expected} ({other})", lookup),
            "got 50, want 77 ({other})"
        );
        assert_eq!(render_template("no braces", lookup), "no braces");
        assert_eq!(render_template("dangling {actual", lookup), "dangling {actual");
    }
}
