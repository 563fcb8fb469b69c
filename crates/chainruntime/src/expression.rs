//! Expression evaluation for transform, condition and end nodes.
//!
//! Supports literals, variables with `.field` / `[index]` access, arithmetic,
//! comparison and boolean operators (`&&`/`and`, `||`/`or`, `!`/`not`),
//! parentheses and a handful of builtin functions. Strings may embed
//! `${expr}` placeholders which are resolved against the same context.

use chaincore::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Maximum nesting depth accepted by the parser
const MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),
}

type ExprResult<T> = Result<T, ExpressionError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

fn tokenize(input: &str) -> ExprResult<Vec<(Token, usize)>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| ExpressionError::Parse {
                    position: start,
                    message: format!("invalid number '{}'", text),
                })?;
                tokens.push((Token::Number(number), start));
                continue;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExpressionError::Parse {
                                position: start,
                                message: "unterminated string".to_string(),
                            })
                        }
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                text.push(match next {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => *other,
                                });
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(text), start));
                continue;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::Op("&&"),
                    "or" => Token::Op("||"),
                    "not" => Token::Op("!"),
                    _ => Token::Ident(word),
                };
                tokens.push((token, start));
                continue;
            }
            '(' => tokens.push((Token::LParen, start)),
            ')' => tokens.push((Token::RParen, start)),
            '[' => tokens.push((Token::LBracket, start)),
            ']' => tokens.push((Token::RBracket, start)),
            '.' => tokens.push((Token::Dot, start)),
            ',' => tokens.push((Token::Comma, start)),
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push((Token::Op(op), start));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '%' => "%",
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    _ => {
                        return Err(ExpressionError::Parse {
                            position: start,
                            message: format!("unexpected character '{}'", c),
                        })
                    }
                };
                tokens.push((Token::Op(op), start));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

fn precedence(op: &str) -> Option<u8> {
    match op {
        "||" => Some(1),
        "&&" => Some(2),
        "==" | "!=" => Some(3),
        "<" | "<=" | ">" | ">=" => Some(4),
        "+" | "-" => Some(5),
        "*" | "/" | "%" => Some(6),
        _ => None,
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.end)
    }

    fn error<T>(&self, message: impl Into<String>) -> ExprResult<T> {
        Err(ExpressionError::Parse {
            position: self.position(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> ExprResult<()> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected {}", what))
        }
    }

    fn parse_expression(&mut self, min_prec: u8, depth: usize) -> ExprResult<Expr> {
        if depth > MAX_DEPTH {
            return self.error("expression nested too deeply");
        }
        let mut left = self.parse_unary(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => *op,
                _ => break,
            };
            let prec = match precedence(op) {
                Some(p) if p >= min_prec => p,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_expression(prec + 1, depth + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self, depth: usize) -> ExprResult<Expr> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.pos += 1;
                Ok(Expr::Unary("!", Box::new(self.parse_unary(depth + 1)?)))
            }
            Some(Token::Op("-")) => {
                self.pos += 1;
                Ok(Expr::Unary("-", Box::new(self.parse_unary(depth + 1)?)))
            }
            _ => self.parse_postfix(depth),
        }
    }

    fn parse_postfix(&mut self, depth: usize) -> ExprResult<Expr> {
        let mut expr = self.parse_primary(depth)?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => expr = Expr::Field(Box::new(expr), name),
                        _ => return self.error("expected field name after '.'"),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expression(0, depth + 1)?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self, depth: usize) -> ExprResult<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let expr = self.parse_expression(0, depth + 1)?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expression(0, depth + 1)?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen, "')'")?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Var(name.trim_start_matches('$').to_string())),
            },
            Some(_) => {
                self.pos -= 1;
                self.error("unexpected token")
            }
            None => self.error("unexpected end of expression"),
        }
    }
}

fn parse(input: &str) -> ExprResult<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_expression(0, 0)?;
    if parser.pos < parser.tokens.len() {
        return parser.error("unexpected trailing input");
    }
    Ok(expr)
}

fn numeric(value: &Value, op: &str) -> ExprResult<f64> {
    value.as_f64().ok_or_else(|| {
        ExpressionError::Type(format!(
            "operator '{}' expects numbers, got {}",
            op,
            value.type_name()
        ))
    })
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left.to_json() == right.to_json(),
    }
}

fn compare(op: &'static str, left: &Value, right: &Value) -> ExprResult<bool> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let a = numeric(left, op)?;
            let b = numeric(right, op)?;
            a.partial_cmp(&b)
                .ok_or_else(|| ExpressionError::Type("cannot compare NaN".to_string()))?
        }
    };
    Ok(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn eval(expr: &Expr, context: &HashMap<String, Value>) -> ExprResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => context
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable(name.clone())),
        Expr::Field(object, field) => {
            let object = eval(object, context)?;
            Ok(object.get_field(field).unwrap_or(Value::Null))
        }
        Expr::Index(object, index) => {
            let object = eval(object, context)?;
            let index = eval(index, context)?;
            match (&object, &index) {
                (Value::Array(items), Value::Number(n)) => Ok(array_index(*n)
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)),
                (Value::Json(serde_json::Value::Array(items)), Value::Number(n)) => Ok(array_index(*n)
                    .and_then(|i| items.get(i))
                    .cloned()
                    .map(Value::from_json)
                    .unwrap_or(Value::Null)),
                (_, Value::String(key)) => Ok(object.get_field(key).unwrap_or(Value::Null)),
                _ => Err(ExpressionError::Type(format!(
                    "cannot index {} with {}",
                    object.type_name(),
                    index.type_name()
                ))),
            }
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, context)?;
            match *op {
                "!" => Ok(Value::Bool(!value.is_truthy())),
                _ => Ok(Value::Number(-numeric(&value, "-")?)),
            }
        }
        Expr::Binary(op, left, right) => {
            match *op {
                "&&" => {
                    let left = eval(left, context)?;
                    if !left.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    return Ok(Value::Bool(eval(right, context)?.is_truthy()));
                }
                "||" => {
                    let left = eval(left, context)?;
                    if left.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    return Ok(Value::Bool(eval(right, context)?.is_truthy()));
                }
                _ => {}
            }
            let left = eval(left, context)?;
            let right = eval(right, context)?;
            match *op {
                "+" => match (&left, &right) {
                    (Value::String(_), _) | (_, Value::String(_)) => {
                        Ok(Value::String(format!("{}{}", left, right)))
                    }
                    (Value::Array(a), Value::Array(b)) => {
                        Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
                    }
                    _ => Ok(Value::Number(numeric(&left, op)? + numeric(&right, op)?)),
                },
                "-" => Ok(Value::Number(numeric(&left, op)? - numeric(&right, op)?)),
                "*" => Ok(Value::Number(numeric(&left, op)? * numeric(&right, op)?)),
                "/" | "%" => {
                    let divisor = numeric(&right, op)?;
                    if divisor == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    let dividend = numeric(&left, op)?;
                    Ok(Value::Number(if *op == "/" {
                        dividend / divisor
                    } else {
                        dividend % divisor
                    }))
                }
                "==" => Ok(Value::Bool(loosely_equal(&left, &right))),
                "!=" => Ok(Value::Bool(!loosely_equal(&left, &right))),
                _ => Ok(Value::Bool(compare(op, &left, &right)?)),
            }
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, context))
                .collect::<ExprResult<Vec<_>>>()?;
            call_builtin(name, &args)
        }
    }
}

fn call_builtin(name: &str, args: &[Value]) -> ExprResult<Value> {
    let first = || {
        args.first()
            .ok_or_else(|| ExpressionError::Type(format!("{}() expects an argument", name)))
    };
    match name {
        "len" => match first()? {
            Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
            Value::Array(a) => Ok(Value::Number(a.len() as f64)),
            Value::Object(o) => Ok(Value::Number(o.len() as f64)),
            Value::Bytes(b) => Ok(Value::Number(b.len() as f64)),
            other => Err(ExpressionError::Type(format!("len() of {}", other.type_name()))),
        },
        "upper" => Ok(Value::String(first()?.to_string().to_uppercase())),
        "lower" => Ok(Value::String(first()?.to_string().to_lowercase())),
        "str" => Ok(Value::String(first()?.to_string())),
        "num" => {
            let value = first()?;
            match value {
                Value::String(s) => s.trim().parse::<f64>().map(Value::Number).map_err(|_| {
                    ExpressionError::Type(format!("cannot convert '{}' to a number", s))
                }),
                other => Ok(Value::Number(numeric(other, "num")?)),
            }
        }
        "abs" => Ok(Value::Number(numeric(first()?, "abs")?.abs())),
        "round" => Ok(Value::Number(numeric(first()?, "round")?.round())),
        "contains" => {
            let needle = args
                .get(1)
                .ok_or_else(|| ExpressionError::Type("contains() expects two arguments".to_string()))?;
            match first()? {
                Value::String(s) => Ok(Value::Bool(s.contains(&needle.to_string()))),
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| loosely_equal(i, needle)))),
                Value::Object(map) => Ok(Value::Bool(map.contains_key(&needle.to_string()))),
                other => Err(ExpressionError::Type(format!("contains() on {}", other.type_name()))),
            }
        }
        _ => Err(ExpressionError::UnknownFunction(name.to_string())),
    }
}

/// Evaluate an expression against the variable context.
pub fn evaluate(expression: &str, context: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
    let expr = parse(expression)?;
    eval(&expr, context)
}

/// Evaluate an expression and reduce it to its truthiness.
pub fn evaluate_condition(
    expression: &str,
    context: &HashMap<String, Value>,
) -> Result<bool, ExpressionError> {
    Ok(evaluate(expression, context)?.is_truthy())
}

/// Resolve `${expr}` placeholders in a string.
///
/// A string that consists of a single placeholder keeps the type of the
/// resolved value; otherwise placeholders are rendered into the text.
pub fn resolve_template(template: &str, context: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
    let trimmed = template.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed[2..].find("${").is_none() {
        let inner = &trimmed[2..trimmed.len() - 1];
        if !inner.contains('}') {
            return evaluate(inner, context);
        }
    }

    if !template.contains("${") {
        return Ok(Value::String(template.to_string()));
    }

    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| ExpressionError::Parse {
            position: template.len() - rest.len() + start,
            message: "unterminated placeholder".to_string(),
        })?;
        output.push_str(&evaluate(&after[..end], context)?.to_string());
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(Value::String(output))
}

/// Negative and fractional indices select nothing.
fn array_index(n: f64) -> Option<usize> {
    if n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 {
        Some(n as usize)
    } else {
        None
    }
}

/// Resolve placeholders in every string nested inside `value`.
pub fn resolve_value(value: &Value, context: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => resolve_template(s, context),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, context).map(|v| (k.clone(), v)))
            .collect::<Result<HashMap<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HashMap<String, Value> {
        let mut ctx = HashMap::new();
        ctx.insert("x".to_string(), Value::from(5));
        ctx.insert("name".to_string(), Value::from("flow"));
        ctx.insert(
            "user".to_string(),
            Value::from(serde_json::json!({"age": 42, "tags": ["a", "b"]})),
        );
        ctx
    }

    #[test]
    fn test_arithmetic_precedence() {
        let ctx = context();
        assert_eq!(evaluate("x * 2", &ctx).unwrap(), Value::Number(10.0));
        assert_eq!(evaluate("1 + 2 * 3", &ctx).unwrap(), Value::Number(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &ctx).unwrap(), Value::Number(9.0));
        assert_eq!(evaluate("-x + 1", &ctx).unwrap(), Value::Number(-4.0));
        assert_eq!(evaluate("7 % 4", &ctx).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let ctx = context();
        assert!(!evaluate_condition("x > 10", &ctx).unwrap());
        assert!(evaluate_condition("x >= 5 && name == 'flow'", &ctx).unwrap());
        assert!(evaluate_condition("x > 10 or not false", &ctx).unwrap());
        assert!(evaluate_condition("user.age == 42", &ctx).unwrap());
        assert!(evaluate_condition("user.tags[1] == \"b\"", &ctx).unwrap());
    }

    #[test]
    fn test_index_outside_array_is_null() {
        let mut ctx = context();
        ctx.insert(
            "items".to_string(),
            Value::Array(vec![Value::from("a"), Value::from("b")]),
        );
        assert_eq!(evaluate("items[1]", &ctx).unwrap(), Value::from("b"));
        assert_eq!(evaluate("items[-1]", &ctx).unwrap(), Value::Null);
        assert_eq!(evaluate("items[0.5]", &ctx).unwrap(), Value::Null);
        assert_eq!(evaluate("items[2]", &ctx).unwrap(), Value::Null);
        assert_eq!(evaluate("user.tags[-1]", &ctx).unwrap(), Value::Null);
        assert_eq!(evaluate("user.tags[0]", &ctx).unwrap(), Value::from("a"));
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        let ctx = context();
        assert!(!evaluate_condition("false && missing > 1", &ctx).unwrap());
        assert_eq!(
            evaluate("missing > 1", &ctx),
            Err(ExpressionError::UnknownVariable("missing".to_string()))
        );
    }

    #[test]
    fn test_builtins_and_concat() {
        let ctx = context();
        assert_eq!(evaluate("upper(name) + '!'", &ctx).unwrap(), Value::from("FLOW!"));
        assert_eq!(evaluate("len(user.tags)", &ctx).unwrap(), Value::Number(2.0));
        assert!(evaluate_condition("contains(user.tags, 'a')", &ctx).unwrap());
        assert!(matches!(
            evaluate("nope(1)", &ctx),
            Err(ExpressionError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_errors() {
        let ctx = context();
        assert_eq!(evaluate("x / 0", &ctx), Err(ExpressionError::DivisionByZero));
        assert!(matches!(evaluate("x +", &ctx), Err(ExpressionError::Parse { .. })));
        assert!(matches!(evaluate("x 2", &ctx), Err(ExpressionError::Parse { .. })));
        assert!(matches!(evaluate("name * 2", &ctx), Err(ExpressionError::Type(_))));
    }

    #[test]
    fn test_templates() {
        let ctx = context();
        assert_eq!(resolve_template("${x}", &ctx).unwrap(), Value::Number(5.0));
        assert_eq!(
            resolve_template("hello ${name}, x=${x * 2}", &ctx).unwrap(),
            Value::from("hello flow, x=10")
        );
        assert_eq!(resolve_template("plain", &ctx).unwrap(), Value::from("plain"));

        let mut params = HashMap::new();
        params.insert("count".to_string(), Value::from("${x}"));
        let resolved = resolve_value(&Value::Object(params), &ctx).unwrap();
        assert_eq!(resolved.get_field("count"), Some(Value::Number(5.0)));
    }
}
