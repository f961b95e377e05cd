//! Template Evaluator (C7): a small sandbox that evaluates a user-supplied
//! `result = <expr>` assignment against the extraction result list `data`.
//!
//! This is a hand-rolled recursive-descent parser over a restricted
//! grammar — function calls, string/int literals, indexing, and f-string
//! `{expr}` interpolation — not an embedded scripting engine, so extraction
//! rules can never execute arbitrary code. Any construct
//! outside this grammar is an evaluation error, surfaced as the literal
//! string `[EXECUTION ERROR: <detail>]` rather than propagated to the
//! caller.

use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// A value inside the evaluator: either a scalar or a list (the shape
/// `data` takes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    List(Vec<Value>),
}

impl Value {
    /// Renders a value as its final string form. Lists stringify as a
    /// comma-joined sequence of their stringified elements — the evaluator
    /// never hands a bare list back to the caller as "the" result, but
    /// intermediate expressions may produce one (e.g. `data` itself).
    pub fn stringify(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::List(items) => items
                .iter()
                .map(Value::stringify)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    fn flatten_into(&self, out: &mut Vec<String>) {
        match self {
            Value::Str(s) => out.push(s.clone()),
            Value::Int(i) => out.push(i.to_string()),
            Value::List(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }

    fn as_list(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

/// Evaluates `template` against the extraction results `data`, returning
/// the rendered string, or `[EXECUTION ERROR: <detail>]` on any parse or
/// evaluation failure. Never panics and never executes arbitrary code.
pub fn eval(template: &str, data: &[String]) -> String {
    match eval_inner(template, data) {
        Ok(value) => value.stringify(),
        Err(e) => format!("[EXECUTION ERROR: {e}]"),
    }
}

fn eval_inner(template: &str, data: &[String]) -> Result<Value, String> {
    let mut parser = Parser::new(template);
    parser.skip_ws();
    parser.expect_keyword("result")?;
    parser.skip_ws();
    parser.expect_char('=')?;
    parser.skip_ws();
    let value = parser.parse_expr(data)?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(format!("unexpected trailing input at offset {}", parser.pos));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Parser { chars: input.chars().collect(), pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(format!("expected '{expected}', found '{c}' at offset {}", self.pos - 1)),
            None => Err(format!("expected '{expected}', found end of input")),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), String> {
        let ident = self.parse_ident_raw()?;
        if ident == keyword {
            Ok(())
        } else {
            Err(format!("expected keyword '{keyword}', found '{ident}'"))
        }
    }

    fn parse_ident_raw(&mut self) -> Result<String, String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(format!("expected identifier at offset {start}"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_expr(&mut self, data: &[String]) -> Result<Value, String> {
        self.skip_ws();
        let mut value = self.parse_primary(data)?;
        loop {
            self.skip_ws();
            if self.peek() == Some('[') {
                self.pos += 1;
                self.skip_ws();
                let index_value = self.parse_expr(data)?;
                self.skip_ws();
                self.expect_char(']')?;
                let index = match index_value {
                    Value::Int(i) => i,
                    other => return Err(format!("index must be an integer, got {other:?}")),
                };
                value = index_into(&value, index)?;
            } else {
                break;
            }
        }
        Ok(value)
    }

    fn parse_primary(&mut self, data: &[String]) -> Result<Value, String> {
        self.skip_ws();
        match self.peek() {
            Some('"') | Some('\'') => self.parse_string_literal(data),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_int_literal(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_ident_or_call(data),
            Some(c) => Err(format!("unexpected character '{c}' at offset {}", self.pos)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn parse_int_literal(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|e| format!("invalid integer literal '{text}': {e}"))
    }

    fn parse_string_literal(&mut self, data: &[String]) -> Result<Value, String> {
        let quote = self.bump().unwrap();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string literal".to_string()),
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err("unterminated escape in string literal".to_string()),
                },
                Some('{') => {
                    let value = self.parse_expr(data)?;
                    self.skip_ws();
                    self.expect_char('}')?;
                    out.push_str(&value.stringify());
                }
                Some(c) => out.push(c),
            }
        }
        Ok(Value::Str(out))
    }

    fn parse_ident_or_call(&mut self, data: &[String]) -> Result<Value, String> {
        let ident = self.parse_ident_raw()?;
        self.skip_ws();
        if self.peek() == Some('(') {
            self.pos += 1;
            let args = self.parse_call_args(data)?;
            return call_function(&ident, args);
        }

        match ident.as_str() {
            "data" => Ok(Value::List(data.iter().cloned().map(Value::Str).collect())),
            other => Err(format!("unknown identifier '{other}'")),
        }
    }

    fn parse_call_args(&mut self, data: &[String]) -> Result<Vec<Value>, String> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr(data)?);
            self.skip_ws();
            match self.bump() {
                Some(',') => {
                    self.skip_ws();
                    continue;
                }
                Some(')') => break,
                Some(c) => return Err(format!("expected ',' or ')', found '{c}'")),
                None => return Err("unterminated argument list".to_string()),
            }
        }
        Ok(args)
    }
}

fn index_into(value: &Value, index: i64) -> Result<Value, String> {
    match value {
        Value::List(items) => {
            let idx = if index < 0 { items.len() as i64 + index } else { index };
            if idx < 0 || idx as usize >= items.len() {
                return Err(format!("index {index} out of bounds (len {})", items.len()));
            }
            Ok(items[idx as usize].clone())
        }
        other => Err(format!("cannot index non-list value {other:?}")),
    }
}

fn require_str(value: &Value, what: &str) -> Result<String, String> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(format!("{what} must be a string, got {other:?}")),
    }
}

fn require_int(value: &Value, what: &str) -> Result<i64, String> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(format!("{what} must be an integer, got {other:?}")),
    }
}

fn rand_alnum(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

fn rand_hex(n: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..n).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect()
}

fn call_function(name: &str, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "join" => {
            let sep = require_str(args.first().ok_or("join requires a separator")?, "join separator")?;
            let mut parts = Vec::new();
            for arg in &args[1..] {
                arg.flatten_into(&mut parts);
            }
            Ok(Value::Str(parts.join(&sep)))
        }
        "zip_join" => {
            let sep = require_str(args.first().ok_or("zip_join requires a separator")?, "zip_join separator")?;
            let iters: Vec<Vec<Value>> = args[1..].iter().map(Value::as_list).collect();
            let max_len = iters.iter().map(Vec::len).max().unwrap_or(0);
            let mut groups = Vec::with_capacity(max_len);
            for i in 0..max_len {
                let row: Vec<String> = iters
                    .iter()
                    .map(|it| it.get(i).map(Value::stringify).unwrap_or_default())
                    .collect();
                groups.push(Value::Str(row.join(&sep)));
            }
            Ok(Value::List(groups))
        }
        "date_cn" => Ok(Value::Str(Local::now().format("%Y年%m月%d日 %H:%M:%S").to_string())),
        "datetime" => Ok(Value::Str(Local::now().format("%Y-%m-%d %H:%M:%S").to_string())),
        "date" => Ok(Value::Str(Local::now().format("%Y-%m-%d").to_string())),
        "time" => Ok(Value::Str(Local::now().format("%H:%M:%S").to_string())),
        "timestamp_s" => Ok(Value::Int(chrono::Utc::now().timestamp())),
        "timestamp_ms" => Ok(Value::Int(chrono::Utc::now().timestamp_millis())),
        "uuid" => Ok(Value::Str(uuid::Uuid::new_v4().to_string())),
        "rand_int" => Ok(Value::Int(rand::thread_rng().gen_range(0..99_999))),
        "rand_str" => {
            let n = require_int(args.first().ok_or("rand_str requires a length")?, "rand_str length")?;
            Ok(Value::Str(rand_alnum(n.max(0) as usize)))
        }
        "rand_hex" => {
            let n = require_int(args.first().ok_or("rand_hex requires a length")?, "rand_hex length")?;
            Ok(Value::Str(rand_hex(n.max(0) as usize)))
        }
        "rand_str_8" => Ok(Value::Str(rand_alnum(8))),
        "rand_str_16" => Ok(Value::Str(rand_alnum(16))),
        "rand_hex_16" => Ok(Value::Str(rand_hex(16))),
        other => Err(format!("unknown function '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_with_separator_concatenates_data() {
        let data = vec!["abc".to_string(), "3600".to_string()];
        let rendered = eval("result = join(' | ', data)", &data);
        assert_eq!(rendered, "abc | 3600");
    }

    #[test]
    fn indexing_and_fstring_interpolation() {
        let data = vec!["token-123".to_string()];
        let rendered = eval("result = \"value: {data[0]}\"", &data);
        assert_eq!(rendered, "value: token-123");
    }

    #[test]
    fn zip_join_returns_a_list_indexable_per_row() {
        let data = vec!["a".to_string(), "b".to_string()];
        let rendered = eval("result = zip_join(',', data, data)[0]", &data);
        assert_eq!(rendered, "a,a");
    }

    #[test]
    fn zip_join_nested_inside_join_flattens_per_row() {
        let data = vec!["a".to_string(), "b".to_string()];
        let rendered = eval("result = join('|', zip_join(',', data, data))", &data);
        assert_eq!(rendered, "a,a|b,b");
    }

    #[test]
    fn unknown_function_is_an_execution_error() {
        let data: Vec<String> = vec![];
        let rendered = eval("result = nope()", &data);
        assert!(rendered.starts_with("[EXECUTION ERROR:"));
    }

    #[test]
    fn malformed_grammar_is_an_execution_error() {
        let data: Vec<String> = vec![];
        let rendered = eval("result = ", &data);
        assert!(rendered.starts_with("[EXECUTION ERROR:"));
    }

    #[test]
    fn rand_str_has_requested_length() {
        let data: Vec<String> = vec![];
        let rendered = eval("result = rand_str(12)", &data);
        assert_eq!(rendered.len(), 12);
    }

    #[test]
    fn rand_hex_is_lowercase_hex() {
        let data: Vec<String> = vec![];
        let rendered = eval("result = rand_hex_16()", &data);
        assert_eq!(rendered.len(), 16);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn out_of_bounds_index_is_an_execution_error() {
        let data = vec!["only".to_string()];
        let rendered = eval("result = data[5]", &data);
        assert!(rendered.starts_with("[EXECUTION ERROR:"));
    }
}
