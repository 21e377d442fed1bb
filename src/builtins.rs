//! Core filters, functions and tests, plus the escaping strategies.

use std::fmt::Write as _;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::registry::{Filter, Function, Registry, Test};
use crate::value::Value;

/// How a print statement escapes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscapeStrategy {
    Html,
    Js,
    Url,
}

impl EscapeStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "html" => Some(EscapeStrategy::Html),
            "js" => Some(EscapeStrategy::Js),
            "url" => Some(EscapeStrategy::Url),
            _ => None,
        }
    }

    pub fn escape(self, text: &str) -> String {
        match self {
            EscapeStrategy::Html => escape_html(text),
            EscapeStrategy::Js => escape_js(text),
            EscapeStrategy::Url => escape_url(text),
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_js(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_') {
            out.push(c);
            continue;
        }
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x80 => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04X}", unit);
                }
            }
        }
    }
    out
}

fn escape_url(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

pub(crate) fn register(registry: &mut Registry) {
    registry.add_filter("upper", Filter::new(upper));
    registry.add_filter("lower", Filter::new(lower));
    registry.add_filter("title", Filter::new(title));
    registry.add_filter("capitalize", Filter::new(capitalize));
    registry.add_filter("trim", Filter::new(trim));
    registry.add_filter("length", Filter::new(length));
    registry.add_filter("join", Filter::new(join));
    registry.add_filter("default", Filter::new(default).lenient());
    registry.add_filter("escape", Filter::new(escape).safe());
    registry.add_filter("e", Filter::new(escape).safe());
    registry.add_filter("raw", Filter::new(raw).safe());
    registry.add_filter("keys", Filter::new(keys));
    registry.add_filter("first", Filter::new(first));
    registry.add_filter("last", Filter::new(last));
    registry.add_filter("reverse", Filter::new(reverse));
    registry.add_filter("slice", Filter::new(slice));
    registry.add_filter("abs", Filter::new(abs));
    registry.add_filter("replace", Filter::new(replace));
    registry.add_filter("split", Filter::new(split));

    registry.add_function("range", Function::Native(range));
    registry.add_function("max", Function::Native(max));
    registry.add_function("min", Function::Native(min));
    registry.add_function("include", Function::Include);
    registry.add_function("template_from_string", Function::TemplateFromString);

    registry.add_test("defined", Test::new(defined).lenient());
    registry.add_test("null", Test::new(null));
    registry.add_test("none", Test::new(null));
    registry.add_test("empty", Test::new(empty));
    registry.add_test("even", Test::new(even));
    registry.add_test("odd", Test::new(odd));
    registry.add_test("iterable", Test::new(iterable));
    registry.add_test("divisible by", Test::new(divisible_by));
    registry.add_test("same as", Test::new(same_as));
}

fn arg<'a>(args: &'a [Value], index: usize) -> &'a Value {
    args.get(index).unwrap_or(&Value::Undefined)
}

/// Keeps markup safe when a string filter does not change its escaping.
fn same_kind(input: &Value, text: String) -> Value {
    match input {
        Value::Markup(_) => Value::Markup(text),
        _ => Value::String(text),
    }
}

fn upper(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(same_kind(input, input.to_string().to_uppercase()))
}

fn lower(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(same_kind(input, input.to_string().to_lowercase()))
}

fn title(input: &Value, _: &[Value]) -> Result<Value, String> {
    let mut out = String::new();
    let mut at_word_start = true;
    for c in input.to_string().chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    Ok(same_kind(input, out))
}

fn capitalize(input: &Value, _: &[Value]) -> Result<Value, String> {
    let text = input.to_string();
    let mut chars = text.chars();
    let out = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Ok(same_kind(input, out))
}

fn trim(input: &Value, args: &[Value]) -> Result<Value, String> {
    let text = input.to_string();
    let out = match arg(args, 0).as_str() {
        Some(chars) => {
            let set: Vec<char> = chars.chars().collect();
            text.trim_matches(|c| set.contains(&c)).to_string()
        }
        None => text.trim().to_string(),
    };
    Ok(same_kind(input, out))
}

fn length(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(Value::from(input.length()))
}

fn join(input: &Value, args: &[Value]) -> Result<Value, String> {
    let glue = arg(args, 0).to_string();
    let parts: Vec<String> = input.iter_pairs().into_iter().map(|(_, v)| v.to_string()).collect();
    Ok(Value::String(parts.join(&glue)))
}

fn default(input: &Value, args: &[Value]) -> Result<Value, String> {
    let empty = match input {
        Value::Undefined | Value::Null => true,
        Value::String(s) | Value::Markup(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Map(m) => m.is_empty(),
        _ => false,
    };
    if empty {
        Ok(match arg(args, 0) {
            Value::Undefined => Value::String(String::new()),
            other => other.clone(),
        })
    } else {
        Ok(input.clone())
    }
}

fn escape(input: &Value, args: &[Value]) -> Result<Value, String> {
    if input.is_safe() {
        return Ok(input.clone());
    }
    let name = arg(args, 0).as_str().unwrap_or("html");
    let strategy = EscapeStrategy::from_name(name).ok_or_else(|| {
        format!("Invalid escaping strategy \"{name}\" (valid ones: html, js, url).")
    })?;
    Ok(Value::Markup(strategy.escape(&input.to_string())))
}

fn raw(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(Value::Markup(input.to_string()))
}

fn keys(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(Value::Array(input.iter_pairs().into_iter().map(|(k, _)| k).collect()))
}

fn first(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(match input {
        Value::String(s) | Value::Markup(s) => s.chars().next().map(|c| Value::String(c.to_string())),
        other => other.iter_pairs().into_iter().next().map(|(_, v)| v),
    }
    .unwrap_or(Value::Undefined))
}

fn last(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(match input {
        Value::String(s) | Value::Markup(s) => s.chars().last().map(|c| Value::String(c.to_string())),
        other => other.iter_pairs().into_iter().last().map(|(_, v)| v),
    }
    .unwrap_or(Value::Undefined))
}

fn reverse(input: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(match input {
        Value::String(s) | Value::Markup(s) => same_kind(input, s.chars().rev().collect()),
        Value::Array(a) => Value::Array(a.iter().rev().cloned().collect()),
        Value::Map(m) => Value::Map(m.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => other.clone(),
    })
}

fn slice(input: &Value, args: &[Value]) -> Result<Value, String> {
    let len = input.length() as i64;
    let start = arg(args, 0).as_i64().unwrap_or(0);
    let start = if start < 0 { len.saturating_add(start).max(0) } else { start.min(len) };
    let end = match arg(args, 1) {
        Value::Undefined | Value::Null => len,
        count => {
            let count = count.as_i64().ok_or("The slice length must be a number.")?;
            if count < 0 {
                len.saturating_add(count).max(start)
            } else {
                start.saturating_add(count).min(len)
            }
        }
    };
    let (start, end) = (start as usize, end.max(start) as usize);
    Ok(match input {
        Value::String(s) | Value::Markup(s) => {
            same_kind(input, s.chars().skip(start).take(end - start).collect())
        }
        Value::Array(a) => Value::Array(a[start..end].to_vec()),
        Value::Map(m) => Value::Map(
            m.iter()
                .skip(start)
                .take(end - start)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    })
}

fn abs(input: &Value, _: &[Value]) -> Result<Value, String> {
    match input {
        Value::Int(i) => Ok(int_abs(*i)),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => match other.neg() {
            Ok(Value::Int(i)) => Ok(int_abs(i)),
            Ok(Value::Float(f)) => Ok(Value::Float(f.abs())),
            _ => Err(format!("The abs filter expects a number, got \"{}\".", other.type_name())),
        },
    }
}

/// `i64::MIN` has no integer absolute value.
fn int_abs(i: i64) -> Value {
    i.checked_abs().map(Value::Int).unwrap_or(Value::Float((i as f64).abs()))
}

fn replace(input: &Value, args: &[Value]) -> Result<Value, String> {
    let Value::Map(pairs) = arg(args, 0) else {
        return Err("The replace filter expects a mapping of replacements.".to_string());
    };
    let mut text = input.to_string();
    for (from, to) in pairs {
        text = text.replace(from.as_str(), &to.to_string());
    }
    Ok(same_kind(input, text))
}

fn split(input: &Value, args: &[Value]) -> Result<Value, String> {
    let text = input.to_string();
    let delimiter = arg(args, 0).to_string();
    let parts: Vec<Value> = if delimiter.is_empty() {
        text.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        text.split(delimiter.as_str()).map(Value::from).collect()
    };
    Ok(Value::Array(parts))
}

fn range(args: &[Value]) -> Result<Value, String> {
    let low = arg(args, 0).as_i64().ok_or("The range function expects integer bounds.")?;
    let high = arg(args, 1).as_i64().ok_or("The range function expects integer bounds.")?;
    let step = match arg(args, 2) {
        Value::Undefined => 1,
        step => step
            .as_i64()
            .and_then(i64::checked_abs)
            .ok_or("The range step must be an integer.")?,
    };
    if step == 0 {
        return Err("The range step cannot be zero.".to_string());
    }
    Ok(Value::Array(integer_range(low, high, step)))
}

pub(crate) fn integer_range(low: i64, high: i64, step: i64) -> Vec<Value> {
    let mut items = Vec::new();
    let mut current = low;
    if low <= high {
        while current <= high {
            items.push(Value::Int(current));
            match current.checked_add(step) {
                Some(next) => current = next,
                None => break,
            }
        }
    } else {
        while current >= high {
            items.push(Value::Int(current));
            match current.checked_sub(step) {
                Some(next) => current = next,
                None => break,
            }
        }
    }
    items
}

fn extremum(args: &[Value], want: std::cmp::Ordering) -> Result<Value, String> {
    let candidates: Vec<Value> = match args {
        [single] => single.iter_pairs().into_iter().map(|(_, v)| v).collect(),
        many => many.to_vec(),
    };
    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = match best {
            Some(current) if current.compare(&candidate) != Some(want.reverse()) => Some(current),
            _ => Some(candidate),
        };
    }
    Ok(best.unwrap_or(Value::Null))
}

fn max(args: &[Value]) -> Result<Value, String> {
    extremum(args, std::cmp::Ordering::Greater)
}

fn min(args: &[Value]) -> Result<Value, String> {
    extremum(args, std::cmp::Ordering::Less)
}

fn defined(input: &Value, _: &[Value]) -> Result<bool, String> {
    Ok(!input.is_undefined())
}

fn null(input: &Value, _: &[Value]) -> Result<bool, String> {
    Ok(input.is_none())
}

fn empty(input: &Value, _: &[Value]) -> Result<bool, String> {
    Ok(match input {
        Value::Undefined | Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) | Value::Markup(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Map(m) => m.is_empty(),
        _ => false,
    })
}

fn even(input: &Value, _: &[Value]) -> Result<bool, String> {
    input
        .as_i64()
        .map(|i| i % 2 == 0)
        .ok_or_else(|| format!("The even test expects an integer, got \"{}\".", input.type_name()))
}

fn odd(input: &Value, _: &[Value]) -> Result<bool, String> {
    input
        .as_i64()
        .map(|i| i % 2 != 0)
        .ok_or_else(|| format!("The odd test expects an integer, got \"{}\".", input.type_name()))
}

fn iterable(input: &Value, _: &[Value]) -> Result<bool, String> {
    Ok(matches!(input, Value::Array(_) | Value::Map(_)))
}

fn divisible_by(input: &Value, args: &[Value]) -> Result<bool, String> {
    match (input.as_i64(), arg(args, 0).as_i64()) {
        (_, Some(0)) => Err("Division by zero.".to_string()),
        (Some(a), Some(b)) => Ok(a % b == 0),
        _ => Err("The divisible by test expects integers.".to_string()),
    }
}

fn same_as(input: &Value, args: &[Value]) -> Result<bool, String> {
    Ok(input.same_as(arg(args, 0)))
}

/// Builds the `loop` mapping exposed inside `for` bodies.
pub(crate) fn loop_variable(index0: usize, length: usize) -> Value {
    let mut map = IndexMap::new();
    map.insert("index".to_string(), Value::from(index0 + 1));
    map.insert("index0".to_string(), Value::from(index0));
    map.insert("revindex".to_string(), Value::from(length - index0));
    map.insert("revindex0".to_string(), Value::from(length - index0 - 1));
    map.insert("first".to_string(), Value::Bool(index0 == 0));
    map.insert("last".to_string(), Value::Bool(index0 + 1 == length));
    map.insert("length".to_string(), Value::from(length));
    Value::Map(map)
}
