use crate::engine::types::{DType, Scalar, Schema};
use crate::error::EngineError;
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_while, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, opt, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded},
    IResult,
};
use smol_str::SmolStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Computed-column expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Scalar),
    /// Column reference; `index` is filled in by [`Expr::bind`].
    Column { name: SmolStr, index: Option<usize> },
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |s: &str| {
            let value = if s.contains('.') {
                s.parse::<f64>().map(Scalar::Float).unwrap_or(Scalar::None)
            } else {
                match s.parse::<i64>() {
                    Ok(i) => Scalar::Int(i),
                    // too large for i64
                    Err(_) => s.parse::<f64>().map(Scalar::Float).unwrap_or(Scalar::None),
                }
            };
            Expr::Literal(value)
        },
    )(input)
}

fn string_lit(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        |s: &str| Expr::Literal(Scalar::str(s)),
    )(input)
}

fn column(name: &str) -> Expr {
    Expr::Column {
        name: SmolStr::new(name),
        index: None,
    }
}

fn quoted_column(input: &str) -> IResult<&str, Expr> {
    map(delimited(char('"'), is_not("\""), char('"')), column)(input)
}

fn identifier(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(
            take_while1(|c: char| c.is_alphabetic() || c == '_'),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        )),
        column,
    )(input)
}

fn factor(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(preceded(char('-'), factor), |e| Expr::Neg(Box::new(e))),
        number,
        string_lit,
        quoted_column,
        identifier,
        delimited(char('('), expr, char(')')),
    )))(input)
}

fn fold(first: Expr, rest: Vec<(char, Expr)>) -> Expr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| {
        let op = match op {
            '+' => BinOp::Add,
            '-' => BinOp::Sub,
            '*' => BinOp::Mul,
            '/' => BinOp::Div,
            _ => BinOp::Rem,
        };
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    })
}

fn term(input: &str) -> IResult<&str, Expr> {
    let (input, first) = factor(input)?;
    let (input, rest) = many0(pair(ws(alt((char('*'), char('/'), char('%')))), factor))(input)?;
    Ok((input, fold(first, rest)))
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(pair(ws(alt((char('+'), char('-')))), term))(input)?;
    Ok((input, fold(first, rest)))
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, EngineError> {
        match all_consuming(expr)(src) {
            Ok((_, e)) => Ok(e),
            Err(e) => Err(EngineError::Expression {
                expr: src.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Resolve column names against the schema. Unknown names stay unbound
    /// and evaluate to `None`.
    pub fn bind(&mut self, schema: &Schema) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column { name, index } => *index = schema.column_index(name),
            Expr::Neg(inner) => inner.bind(schema),
            Expr::Binary(_, lhs, rhs) => {
                lhs.bind(schema);
                rhs.bind(schema);
            }
        }
    }

    pub fn eval(&self, row: &[Scalar]) -> Scalar {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Column { index, .. } => index
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default()
                .normalized(),
            Expr::Neg(inner) => match inner.eval(row) {
                Scalar::Int(i) => i
                    .checked_neg()
                    .map(Scalar::Int)
                    .unwrap_or(Scalar::Float(-(i as f64))),
                Scalar::Float(f) => Scalar::Float(-f),
                _ => Scalar::None,
            },
            Expr::Binary(op, lhs, rhs) => apply(*op, lhs.eval(row), rhs.eval(row)),
        }
    }

    /// Static result type given the schema.
    pub fn dtype(&self, schema: &Schema) -> DType {
        match self {
            Expr::Literal(v) => v.dtype(),
            Expr::Column { index, .. } => index.map(|i| schema.dtype(i)).unwrap_or(DType::None),
            Expr::Neg(inner) => match inner.dtype(schema) {
                d if d.is_numeric() => d,
                _ => DType::None,
            },
            Expr::Binary(op, lhs, rhs) => match (lhs.dtype(schema), rhs.dtype(schema)) {
                (DType::Str, DType::Str) if *op == BinOp::Add => DType::Str,
                (DType::Int, DType::Int) if *op != BinOp::Div => DType::Int,
                (a, b) if a.is_numeric() && b.is_numeric() => DType::Float,
                _ => DType::None,
            },
        }
    }
}

fn apply(op: BinOp, lhs: Scalar, rhs: Scalar) -> Scalar {
    match (&lhs, &rhs) {
        (Scalar::Str(a), Scalar::Str(b)) if op == BinOp::Add => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            return Scalar::Str(SmolStr::from(s));
        }
        (Scalar::Int(a), Scalar::Int(b)) if op != BinOp::Div => {
            let exact = match op {
                BinOp::Add => a.checked_add(*b),
                BinOp::Sub => a.checked_sub(*b),
                BinOp::Mul => a.checked_mul(*b),
                BinOp::Rem if *b == 0 => return Scalar::None,
                BinOp::Rem => a.checked_rem(*b),
                BinOp::Div => None,
            };
            if let Some(v) = exact {
                return Scalar::Int(v);
            }
        }
        _ => {}
    }
    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Scalar::None;
    };
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::Rem if b == 0.0 => return Scalar::None,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
    };
    Scalar::Float(v)
}

/// A named, bound computed column.
#[derive(Clone, Debug)]
pub struct ComputedExpr {
    pub name: SmolStr,
    pub expr: Expr,
}

impl ComputedExpr {
    pub fn compile(name: &str, source: &str, schema: &Schema) -> Result<Self, EngineError> {
        let mut expr = Expr::parse(source)?;
        expr.bind(schema);
        Ok(Self {
            name: SmolStr::new(name),
            expr,
        })
    }

    #[inline]
    pub fn eval(&self, row: &[Scalar]) -> Scalar {
        self.expr.eval(row)
    }
}
