//! Parameter template rendering.
//!
//! A template is a flat `name -> value` map. String values may embed `{name}`
//! tokens; every token whose name is present in the substitution set is replaced,
//! unknown tokens stay as literal text. Non-string values pass through untouched.
use std::collections::HashMap;

use serde_json::Value;

use crate::config::ParamTemplate;

pub const CREDENTIAL: &str = "credential";
pub const PRODUCT_ID: &str = "productId";
pub const QUANTITY: &str = "quantity";

/// Named substitution values, already stringified.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    values: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Render every value of `template`. Total: never fails, keeps the input's keys.
pub fn render(template: &ParamTemplate, values: &Substitutions) -> ParamTemplate {
    template
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => Value::String(render_str(text, values)),
                other => other.clone(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// Single left-to-right pass; substituted text is not re-scanned.
pub fn render_str(text: &str, values: &Substitutions) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];

        let Some(close) = after_open.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let name = &after_open[..close];
        // `{{x}` must still substitute the inner `{x}`.
        if name.contains('{') {
            out.push('{');
            rest = after_open;
            continue;
        }

        match values.get(name) {
            Some(replacement) => out.push_str(replacement),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after_open[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Flatten a rendered parameter value into its wire form.
pub fn param_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        structured => structured.to_string(),
    }
}
