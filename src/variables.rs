use indexmap::IndexMap;
use rand::seq::IndexedRandom;
use rand::Rng;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::env;
use std::sync::OnceLock;

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("Invalid variable regex"))
}

fn func_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(random|randint)\s*:\s*([^}]*?)\s*\}\}")
            .expect("Invalid function regex")
    })
}

fn env_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").expect("Invalid env regex"))
}

/// Values available to request templates.
///
/// `{{NAME}}` resolves from run-file vars, then the process environment, and
/// is left untouched when neither has it. `${NAME:default}` prefers the
/// process environment and falls back to vars, then to `default`.
///
/// Two functions are evaluated afresh on every substitution:
/// `{{random:NAME}}` picks one entry of the comma-separated list in `NAME`
/// and `{{randint:LOW:HIGH}}` draws an integer from the inclusive range.
/// Both are left untouched when their arguments do not resolve.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    vars: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env_vars(mut self) -> Self {
        self.vars.extend(env::vars());
        self
    }

    /// Later entries may reference earlier ones.
    pub fn with_config_vars(mut self, config_vars: &IndexMap<String, String>) -> Self {
        for (key, value) in config_vars {
            let expanded = self.substitute(value);
            self.vars.insert(key.clone(), expanded);
        }
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("{{") && !text.contains("${") {
            return text.to_string();
        }

        let result = func_regex().replace_all(text, |caps: &Captures| {
            self.call(&caps[1], &caps[2])
                .unwrap_or_else(|| caps[0].to_string())
        });

        let result = var_regex().replace_all(&result, |caps: &Captures| {
            self.vars
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        });

        env_regex()
            .replace_all(&result, |caps: &Captures| {
                let name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                env::var(name).unwrap_or_else(|_| {
                    self.vars
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| default.to_string())
                })
            })
            .into_owned()
    }

    fn call(&self, function: &str, args: &str) -> Option<String> {
        let mut rng = rand::rng();
        match function {
            "random" => {
                let items: Vec<&str> = self
                    .vars
                    .get(args)?
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .collect();
                items.choose(&mut rng).map(|item| item.to_string())
            }
            "randint" => {
                let (low, high) = args.split_once(':')?;
                let low: i64 = low.trim().parse().ok()?;
                let high: i64 = high.trim().parse().ok()?;
                (low <= high).then(|| rng.random_range(low..=high).to_string())
            }
            _ => None,
        }
    }

    /// Names referenced with `{{NAME}}` that have no value.
    pub fn unresolved(&self, text: &str) -> Vec<String> {
        var_regex()
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .filter(|name| !self.vars.contains_key(name))
            .collect()
    }
}
