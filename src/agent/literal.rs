//! Tool argument parsing.
//!
//! Arguments are strict JSON. Some smaller models emit Python-style
//! literals instead (`{'name': 'Cube', 'visible': True}`), so at execution
//! time a narrow literal parser is tried as a fallback. It accepts strings,
//! numbers, booleans, null, lists, tuples and dicts and nothing else.

use anyhow::{Result, anyhow, bail};
use serde_json::{Map, Number, Value};

/// Parse accumulated tool-call argument text.
///
/// Empty or whitespace-only text means "no arguments" (`{}`).
pub fn parse_arguments(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Ok(value),
        Err(json_err) => parse_literal(trimmed)
            .map_err(|lit_err| anyhow!("{} (literal fallback: {})", json_err, lit_err)),
    }
}

/// Parse a single safe literal expression.
pub fn parse_literal(text: &str) -> Result<Value> {
    let mut parser = LiteralParser {
        chars: text.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        bail!("unexpected trailing input at offset {}", parser.pos);
    }
    Ok(value)
}

/// Nesting limit for dicts and sequences, same as serde_json's.
const MAX_DEPTH: usize = 128;

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl LiteralParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            bail!("expected '{}' at offset {}", c, self.pos)
        }
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_ws();
        match self.peek() {
            Some(open @ ('{' | '[' | '(')) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    bail!("nesting deeper than {} at offset {}", MAX_DEPTH, self.pos);
                }
                let value = match open {
                    '{' => self.dict(),
                    '[' => self.sequence('[', ']'),
                    _ => self.sequence('(', ')'),
                }?;
                self.depth -= 1;
                Ok(value)
            }
            Some(q @ ('"' | '\'')) => Ok(Value::String(self.string(q)?)),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(c) => bail!("unexpected '{}' at offset {}", c, self.pos),
            None => bail!("unexpected end of input"),
        }
    }

    fn dict(&mut self) -> Result<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => bail!("unsupported dict key: {}", other),
            };
            self.expect(':')?;
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {}
                _ => bail!("expected ',' or '}}' at offset {}", self.pos),
            }
        }
    }

    fn sequence(&mut self, open: char, close: char) -> Result<Value> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {}
                _ => bail!("expected ',' or '{}' at offset {}", close, self.pos),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String> {
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '\\' => {
                    let escaped = self.peek().ok_or_else(|| anyhow!("dangling escape"))?;
                    self.pos += 1;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                }
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
        bail!("unterminated string")
    }

    fn number(&mut self) -> Result<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_'))
        {
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let raw = raw.strip_prefix('+').unwrap_or(&raw);

        if let Ok(i) = raw.parse::<i64>() {
            return Ok(Value::Number(i.into()));
        }
        let f: f64 = raw
            .parse()
            .map_err(|_| anyhow!("invalid number '{}'", raw))?;
        Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("non-finite number '{}'", raw))
    }

    fn keyword(&mut self) -> Result<Value> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            "None" | "null" => Ok(Value::Null),
            other => bail!("'{}' is not a literal", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_is_empty_object() {
        assert_eq!(parse_arguments("").unwrap(), json!({}));
        assert_eq!(parse_arguments("  \n").unwrap(), json!({}));
    }

    #[test]
    fn test_strict_json_passes_through() {
        assert_eq!(
            parse_arguments(r#"{"object_name": "Cube", "scale": [1, 2.5, 3]}"#).unwrap(),
            json!({"object_name": "Cube", "scale": [1, 2.5, 3]})
        );
    }

    #[test]
    fn test_python_literals() {
        assert_eq!(
            parse_arguments("{'name': 'Cube', 'visible': True, 'parent': None, 'loc': (0, -1.5, 2e1),}")
                .unwrap(),
            json!({"name": "Cube", "visible": true, "parent": null, "loc": [0, -1.5, 20.0]})
        );
    }

    #[test]
    fn test_escapes_in_single_quotes() {
        assert_eq!(
            parse_literal(r"'it\'s'").unwrap(),
            json!("it's")
        );
    }

    #[test]
    fn test_rejects_expressions() {
        assert!(parse_arguments("__import__('os').system('ls')").is_err());
        assert!(parse_arguments("{'a': 1 + 2}").is_err());
        assert!(parse_arguments("{'a': open}").is_err());
    }

    #[test]
    fn test_rejects_truncated_input() {
        let err = parse_arguments(r#"{"object_name": "Cu"#).unwrap_err();
        assert!(err.to_string().contains("literal fallback"));
    }

    #[test]
    fn test_rejects_deep_nesting() {
        let err = parse_arguments(&"[".repeat(100_000)).unwrap_err();
        assert!(err.to_string().contains("nesting deeper than 128"));

        let ok = format!("{}1{}", "[".repeat(100), "]".repeat(100));
        assert!(parse_literal(&ok).is_ok());
        let too_deep = format!("{}1{}", "(".repeat(129), ")".repeat(129));
        assert!(parse_literal(&too_deep).is_err());
    }
}
