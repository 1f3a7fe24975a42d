//! Host-provided functions callable from bytecode by name.

use std::collections::HashMap;

use super::{DictData, Value};

/// A foreign function. Receives its arguments in call order.
pub type ForeignFn = Box<dyn FnMut(&[Value]) -> Result<Value, String>>;

/// Lowercase name -> callable.
#[derive(Default)]
pub struct ForeignRegistry {
    functions: HashMap<String, ForeignFn>,
}

impl ForeignRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the dict helpers and `assert`.
    pub fn with_std() -> Self {
        let mut registry = Self::new();
        registry.register_std();
        registry
    }

    /// Register (or replace) a function. The name is lowercased.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: FnMut(&[Value]) -> Result<Value, String> + 'static,
    {
        self.functions.insert(name.to_lowercase(), Box::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(&name.to_lowercase())
    }

    /// Invoke a function, or None if it is not registered.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
        self.functions
            .get_mut(&name.to_lowercase())
            .map(|f| f(args))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn register_std(&mut self) {
        self.register("createdict", |_| Ok(Value::dict(DictData::new())));

        self.register("setdictkey", |args| {
            let [dict, key, value] = args else {
                return Err("SetDictKey(dict, key, value) expects 3 arguments".to_string());
            };
            let Value::Dict(d) = dict else {
                return Err(format!("SetDictKey: expected dict, got {}", dict.type_name()));
            };
            d.borrow_mut().insert(key.to_string(), value.clone());
            Ok(dict.clone())
        });

        let get_key = |args: &[Value]| {
            let [dict, key] = args else {
                return Err("GetJSONKey(dict, key) expects 2 arguments".to_string());
            };
            match dict {
                Value::Dict(d) => Ok(d.borrow().get(&key.to_string()).cloned().unwrap_or(Value::Nil)),
                Value::Nil => Ok(Value::Nil),
                other => Err(format!("GetJSONKey: expected dict, got {}", other.type_name())),
            }
        };
        self.register("getjsonkey", get_key);
        self.register("getdictkey", get_key);

        self.register("hasdictkey", |args| {
            let [dict, key] = args else {
                return Err("HasDictKey(dict, key) expects 2 arguments".to_string());
            };
            match dict {
                Value::Dict(d) => Ok(Value::Bool(d.borrow().contains_key(&key.to_string()))),
                other => Err(format!("HasDictKey: expected dict, got {}", other.type_name())),
            }
        });

        self.register("dictsize", |args| match args {
            [Value::Dict(d)] => Ok(Value::Int(d.borrow().len() as i64)),
            _ => Err("DictSize(dict) expects 1 dict argument".to_string()),
        });

        self.register("assert", |args| {
            let [cond, message] = args else {
                return Err("Assert(condition, message) expects 2 arguments".to_string());
            };
            if cond.is_truthy() {
                Ok(Value::Nil)
            } else {
                Err(message.to_string())
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_case_insensitive() {
        let mut registry = ForeignRegistry::new();
        registry.register("DrawText", |_| Ok(Value::Int(1)));
        assert!(registry.contains("drawtext"));
        assert_eq!(registry.call("DRAWTEXT", &[]), Some(Ok(Value::Int(1))));
        assert_eq!(registry.call("missing", &[]), None);
    }

    #[test]
    fn test_dict_helpers() {
        let mut registry = ForeignRegistry::with_std();
        let dict = registry.call("createdict", &[]).unwrap().unwrap();
        let same = registry
            .call("setdictkey", &[dict.clone(), Value::str("hp"), Value::Int(3)])
            .unwrap()
            .unwrap();
        assert_eq!(same, dict);

        let hp = registry
            .call("getjsonkey", &[dict.clone(), Value::str("hp")])
            .unwrap()
            .unwrap();
        assert_eq!(hp, Value::Int(3));

        let missing = registry
            .call("getjsonkey", &[dict, Value::str("mp")])
            .unwrap()
            .unwrap();
        assert_eq!(missing, Value::Nil);
    }

    #[test]
    fn test_assert_fails_with_message() {
        let mut registry = ForeignRegistry::with_std();
        let result = registry
            .call("assert", &[Value::Bool(false), Value::str("hp must be positive")])
            .unwrap();
        assert_eq!(result, Err("hp must be positive".to_string()));
    }
}
