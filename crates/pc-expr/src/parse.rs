use pc_types::ScalarValue;

use crate::{BinaryOp, CompareOp, Expr, ExprError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    True,
    False,
}

/// Parses a formula into an expression tree.
///
/// Grammar (lowest to highest precedence):
///   or_expr    → and_expr ( "or" and_expr )*
///   and_expr   → not_expr ( "and" not_expr )*
///   not_expr   → "not" not_expr | comparison
///   comparison → add_expr ( ("==" | "!=" | ">" | ">=" | "<" | "<=") add_expr )?
///   add_expr   → mul_expr ( ("+" | "-") mul_expr )*
///   mul_expr   → unary ( ("*" | "/" | "%") unary )*
///   unary      → "-" unary | power
///   power      → atom ( "^" unary )?
///   atom       → NUMBER | STRING | "true" | "false" | IDENT | `QUOTED IDENT`
///              | IDENT "(" ( or_expr ( "," or_expr )* )? ")" | "(" or_expr ")"
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let result = parse_or(&tokens, &mut pos)?;
    if pos < tokens.len() {
        return Err(ExprError::Parse(format!(
            "unexpected token at position {pos}: {:?}",
            tokens[pos]
        )));
    }
    Ok(result)
}

fn number(text: &str) -> Result<Token, ExprError> {
    if text.contains('.') || text.contains('e') || text.contains('E') {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| ExprError::Parse(format!("invalid float: {text}")))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| ExprError::Parse(format!("invalid integer: {text}")))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '^' => Some(Token::Caret),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(token);
            i += 1;
            continue;
        }
        let next_is_eq = chars.get(i + 1) == Some(&'=');
        match c {
            '=' if next_is_eq => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '=' => {
                return Err(ExprError::Parse(
                    "expected '==' but found single '='".into(),
                ));
            }
            '!' if next_is_eq => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                return Err(ExprError::Parse(
                    "expected '!=' but found single '!'".into(),
                ));
            }
            '>' | '<' => {
                let token = match (c, next_is_eq) {
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    (_, true) => Token::Le,
                    (_, false) => Token::Lt,
                };
                tokens.push(token);
                i += if next_is_eq { 2 } else { 1 };
            }
            '\'' | '"' | '`' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExprError::Parse("unterminated quoted text".into()));
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(if quote == '`' {
                    Token::Ident(text)
                } else {
                    Token::Str(text)
                });
                i += 1;
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() {
                    let d = chars[i];
                    let exponent_sign = (d == '-' || d == '+')
                        && matches!(chars.get(i.wrapping_sub(1)), Some('e' | 'E'));
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(number(&text)?);
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            _ => {
                return Err(ExprError::Parse(format!("unexpected character: '{c}'")));
            }
        }
    }
    Ok(tokens)
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_and(tokens, pos)?;
    while tokens.get(*pos) == Some(&Token::Or) {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_not(tokens, pos)?;
    while tokens.get(*pos) == Some(&Token::And) {
        *pos += 1;
        let right = parse_not(tokens, pos)?;
        left = Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_not(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    if tokens.get(*pos) == Some(&Token::Not) {
        *pos += 1;
        let inner = parse_not(tokens, pos)?;
        return Ok(Expr::Not {
            expr: Box::new(inner),
        });
    }
    parse_comparison(tokens, pos)
}

fn parse_comparison(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let left = parse_add(tokens, pos)?;
    let op = match tokens.get(*pos) {
        Some(Token::EqEq) => Some(CompareOp::Eq),
        Some(Token::NotEq) => Some(CompareOp::Ne),
        Some(Token::Gt) => Some(CompareOp::Gt),
        Some(Token::Ge) => Some(CompareOp::Ge),
        Some(Token::Lt) => Some(CompareOp::Lt),
        Some(Token::Le) => Some(CompareOp::Le),
        _ => None,
    };
    if let Some(op) = op {
        *pos += 1;
        let right = parse_add(tokens, pos)?;
        return Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }
    Ok(left)
}

fn parse_add(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_mul(tokens, pos)?;
    loop {
        let op = match tokens.get(*pos) {
            Some(Token::Plus) => BinaryOp::Add,
            Some(Token::Minus) => BinaryOp::Sub,
            _ => break,
        };
        *pos += 1;
        let right = parse_mul(tokens, pos)?;
        left = binary(op, left, right);
    }
    Ok(left)
}

fn parse_mul(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let mut left = parse_unary(tokens, pos)?;
    loop {
        let op = match tokens.get(*pos) {
            Some(Token::Star) => BinaryOp::Mul,
            Some(Token::Slash) => BinaryOp::Div,
            Some(Token::Percent) => BinaryOp::Rem,
            _ => break,
        };
        *pos += 1;
        let right = parse_unary(tokens, pos)?;
        left = binary(op, left, right);
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    if tokens.get(*pos) == Some(&Token::Minus) {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Ok(match inner {
            Expr::Literal { value } if value.is_numeric() => Expr::Literal {
                value: value.negate(),
            },
            other => Expr::Neg {
                expr: Box::new(other),
            },
        });
    }
    parse_power(tokens, pos)
}

fn parse_power(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let base = parse_atom(tokens, pos)?;
    if tokens.get(*pos) == Some(&Token::Caret) {
        *pos += 1;
        let exponent = parse_unary(tokens, pos)?;
        return Ok(binary(BinaryOp::Pow, base, exponent));
    }
    Ok(base)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr, ExprError> {
    let Some(token) = tokens.get(*pos) else {
        return Err(ExprError::Parse("unexpected end of expression".into()));
    };
    *pos += 1;
    let literal = |value: ScalarValue| Ok(Expr::Literal { value });
    match token {
        Token::Int(n) => literal(ScalarValue::int64(*n)),
        Token::Float(f) => literal(ScalarValue::float64(*f)),
        Token::Str(s) => literal(ScalarValue::string(s.as_str())),
        Token::True => literal(ScalarValue::boolean(true)),
        Token::False => literal(ScalarValue::boolean(false)),
        Token::Ident(name) => {
            if tokens.get(*pos) == Some(&Token::LParen) {
                *pos += 1;
                let args = parse_args(tokens, pos)?;
                return Ok(Expr::Call {
                    function: name.to_ascii_lowercase(),
                    args,
                });
            }
            Ok(Expr::Column { name: name.clone() })
        }
        Token::LParen => {
            let inner = parse_or(tokens, pos)?;
            if tokens.get(*pos) != Some(&Token::RParen) {
                return Err(ExprError::Parse("expected closing ')'".into()));
            }
            *pos += 1;
            Ok(inner)
        }
        other => Err(ExprError::Parse(format!("unexpected token: {other:?}"))),
    }
}

fn parse_args(tokens: &[Token], pos: &mut usize) -> Result<Vec<Expr>, ExprError> {
    let mut args = Vec::new();
    if tokens.get(*pos) == Some(&Token::RParen) {
        *pos += 1;
        return Ok(args);
    }
    loop {
        args.push(parse_or(tokens, pos)?);
        match tokens.get(*pos) {
            Some(Token::Comma) => *pos += 1,
            Some(Token::RParen) => {
                *pos += 1;
                return Ok(args);
            }
            _ => return Err(ExprError::Parse("expected ',' or ')' in call".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use pc_types::ScalarValue;

    use super::parse_expr;
    use crate::{BinaryOp, CompareOp, Expr, ExprError};

    #[test]
    fn parse_precedence() {
        let expr = parse_expr("a + b * 2").expect("parse");
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. })),
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn parse_call_and_quoted_column() {
        let expr = parse_expr("pow(`net sales`, 2) >= 10").expect("parse");
        let Expr::Compare { op, left, .. } = expr else {
            panic!("expected comparison");
        };
        assert_eq!(op, CompareOp::Ge);
        let Expr::Call { function, args } = *left else {
            panic!("expected call");
        };
        assert_eq!(function, "pow");
        assert_eq!(
            args[0],
            Expr::Column {
                name: "net sales".to_owned()
            }
        );
    }

    #[test]
    fn negative_literal_folds() {
        assert_eq!(
            parse_expr("-3").expect("parse"),
            Expr::Literal {
                value: ScalarValue::int64(-3)
            }
        );
        assert!(matches!(
            parse_expr("-x").expect("parse"),
            Expr::Neg { .. }
        ));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_expr("a = b"), Err(ExprError::Parse(_))));
        assert!(matches!(parse_expr("(a + b"), Err(ExprError::Parse(_))));
        assert!(matches!(parse_expr("f(a,"), Err(ExprError::Parse(_))));
        assert!(matches!(parse_expr("'open"), Err(ExprError::Parse(_))));
    }
}
