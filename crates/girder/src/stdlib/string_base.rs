//! String Method Table
//!
//! Selection on a string with a non-integer key consults this table; a
//! dot-call passes the string itself as the first argument.

use crate::array::GirderArray;
use crate::environment::Environment;
use crate::error::{EvalResult, exception};
use crate::value::Value;

pub(super) fn load(env: &mut Environment) {
    let methods: &[(&str, crate::environment::NativeFunction)] = &[
        ("Contains", contains),
        ("EndsWith", ends_with),
        ("StartsWith", starts_with),
        ("EqualsIgnoreCase", equals_ignore_case),
        ("IndexOf", index_of),
        ("LastIndexOf", last_index_of),
        ("IsEmpty", is_empty),
        ("Length", length),
        ("Matches", matches),
        ("Replace", replace),
        ("Split", split),
        ("ToCharArray", to_char_array),
        ("ToLowerCase", to_lower_case),
        ("ToUpperCase", to_upper_case),
        ("Trim", trim),
        ("TrimLeft", trim_left),
        ("TrimRight", trim_right),
    ];
    for &(name, function) in methods {
        let callable = env.bind_library(function, name);
        let key = Value::from(env.intern(name));
        env.string_vtable().set(key, callable.as_value());
    }
}

/// The receiver plus one string argument, the common method shape.
fn receiver_and_text<'a>(
    env: &mut Environment,
    args: &'a [Value],
    method: &str,
) -> EvalResult<(&'a str, &'a str)> {
    let receiver = args.first().and_then(Value::as_str);
    let text = args.get(1).and_then(Value::as_str);
    match (receiver, text) {
        (Some(receiver), Some(text)) => Ok((receiver, text)),
        _ => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("{} expects (string, string)", method),
        )),
    }
}

fn receiver(env: &mut Environment, args: &[Value], method: &str) -> EvalResult<String> {
    match args.first().and_then(Value::as_str) {
        Some(receiver) => Ok(receiver.to_string()),
        None => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("{} expects a string receiver", method),
        )),
    }
}

fn contains(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, text) = receiver_and_text(env, args, "Contains")?;
    Ok(Value::boolean(receiver.contains(text)))
}

fn ends_with(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, text) = receiver_and_text(env, args, "EndsWith")?;
    Ok(Value::boolean(receiver.ends_with(text)))
}

fn starts_with(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, text) = receiver_and_text(env, args, "StartsWith")?;
    Ok(Value::boolean(receiver.starts_with(text)))
}

fn equals_ignore_case(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, text) = receiver_and_text(env, args, "EqualsIgnoreCase")?;
    Ok(Value::boolean(
        receiver.to_lowercase() == text.to_lowercase(),
    ))
}

fn index_of(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, text) = receiver_and_text(env, args, "IndexOf")?;
    match receiver.find(text) {
        Some(byte_index) => {
            let position = receiver[..byte_index].chars().count() as i64;
            Ok(Value::integer(position))
        }
        None => Ok(Value::integer(-1)),
    }
}

fn last_index_of(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, text) = receiver_and_text(env, args, "LastIndexOf")?;
    match receiver.rfind(text) {
        Some(byte_index) => {
            let position = receiver[..byte_index].chars().count() as i64;
            Ok(Value::integer(position))
        }
        None => Ok(Value::integer(-1)),
    }
}

fn is_empty(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "IsEmpty")?;
    Ok(Value::boolean(receiver.is_empty()))
}

fn length(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "Length")?;
    Ok(Value::integer(receiver.chars().count() as i64))
}

/// Whole-string regex match; delegates to the regex engine backing the
/// Regex class.
fn matches(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, pattern) = receiver_and_text(env, args, "Matches")?;
    let (receiver, pattern) = (receiver.to_string(), pattern.to_string());
    let compiled = match regex::Regex::new(&pattern) {
        Ok(compiled) => compiled,
        Err(e) => {
            return Err(env.throw_message(
                exception::REGEX_ERROR,
                format!("invalid pattern: {}", e),
            ));
        }
    };
    Ok(Value::boolean(
        compiled.find(&receiver).is_some_and(|m| m.len() == receiver.len() && m.start() == 0),
    ))
}

fn replace(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = args.first().and_then(Value::as_str).map(str::to_string);
    let from = args.get(1).and_then(Value::as_str).map(str::to_string);
    let to = args.get(2).and_then(Value::as_str).map(str::to_string);
    let (Some(receiver), Some(from), Some(to)) = (receiver, from, to) else {
        return Err(env.throw_message(
            exception::TYPE_ERROR,
            "Replace expects (string, string, string)",
        ));
    };
    let replaced = receiver.replace(&from, &to);
    Ok(Value::from(env.intern(&replaced)))
}

fn split(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let (receiver, separator) = receiver_and_text(env, args, "Split")?;
    let (receiver, separator) = (receiver.to_string(), separator.to_string());
    let mut parts = Vec::new();
    if separator.is_empty() {
        for ch in receiver.chars() {
            let part = env.intern(&ch.to_string());
            parts.push(Value::from(part));
        }
    } else {
        for piece in receiver.split(&separator) {
            let part = env.intern(piece);
            parts.push(Value::from(part));
        }
    }
    Ok(Value::from(GirderArray::managed(parts)))
}

fn to_char_array(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "ToCharArray")?;
    let mut chars = Vec::new();
    for ch in receiver.chars() {
        let cell = env.intern(&ch.to_string());
        chars.push(Value::from(cell));
    }
    Ok(Value::from(GirderArray::managed(chars)))
}

fn to_lower_case(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "ToLowerCase")?;
    let lowered = receiver.to_lowercase();
    Ok(Value::from(env.intern(&lowered)))
}

fn to_upper_case(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "ToUpperCase")?;
    let raised = receiver.to_uppercase();
    Ok(Value::from(env.intern(&raised)))
}

fn trim(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "Trim")?;
    let trimmed = receiver.trim().to_string();
    Ok(Value::from(env.intern(&trimmed)))
}

fn trim_left(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "TrimLeft")?;
    let trimmed = receiver.trim_start().to_string();
    Ok(Value::from(env.intern(&trimmed)))
}

fn trim_right(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let receiver = receiver(env, args, "TrimRight")?;
    let trimmed = receiver.trim_end().to_string();
    Ok(Value::from(env.intern(&trimmed)))
}

#[cfg(test)]
mod tests {
    use crate::environment::{Environment, ProviderKind};
    use crate::value::Value;
    use std::collections::HashMap;

    fn run(source: &str) -> Value {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.compile_source(source, "test", HashMap::new()).unwrap();
        env.call(&callable, &[]).unwrap()
    }

    #[test]
    fn test_contains_and_affixes() {
        assert_eq!(run("return \"girder\".Contains(\"ird\");"), Value::boolean(true));
        assert_eq!(run("return \"girder\".StartsWith(\"gir\");"), Value::boolean(true));
        assert_eq!(run("return \"girder\".EndsWith(\"der\");"), Value::boolean(true));
        assert_eq!(run("return \"girder\".EndsWith(\"x\");"), Value::boolean(false));
    }

    #[test]
    fn test_index_of() {
        assert_eq!(run("return \"abcabc\".IndexOf(\"b\");"), Value::integer(1));
        assert_eq!(run("return \"abcabc\".LastIndexOf(\"b\");"), Value::integer(4));
        assert_eq!(run("return \"abc\".IndexOf(\"z\");"), Value::integer(-1));
    }

    #[test]
    fn test_case_and_trim() {
        assert_eq!(run("return \"AbC\".ToLowerCase();").as_str(), Some("abc"));
        assert_eq!(run("return \"AbC\".ToUpperCase();").as_str(), Some("ABC"));
        assert_eq!(run("return \"  x \".Trim();").as_str(), Some("x"));
        assert_eq!(run("return \"  x \".TrimLeft();").as_str(), Some("x "));
        assert_eq!(run("return \"  x \".TrimRight();").as_str(), Some("  x"));
    }

    #[test]
    fn test_split_and_join_round_trip() {
        assert_eq!(
            run("return \"a,b,c\".Split(\",\").Join(\"-\");").as_str(),
            Some("a-b-c")
        );
        assert_eq!(run("return #\"ab\".ToCharArray();"), Value::integer(2));
    }

    #[test]
    fn test_matches_whole_string() {
        assert_eq!(run("return \"abc123\".Matches(\"[a-c]+[0-9]+\");"), Value::boolean(true));
        assert_eq!(run("return \"abc123x\".Matches(\"[a-c]+[0-9]+\");"), Value::boolean(false));
    }

    #[test]
    fn test_replace() {
        assert_eq!(
            run("return \"a-b-c\".Replace(\"-\", \"+\");").as_str(),
            Some("a+b+c")
        );
    }
}
