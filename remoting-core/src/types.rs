//! Declared value types.
//!
//! Parameter and result types travel as plain strings on the wire. The
//! decoding side resolves them into a [`ValueType`] when it knows the name and
//! falls back to an open value otherwise.

use serde_json::Value;
use std::fmt;

/// A value type that both sides of a call agree on by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Void,
    Bool,
    Int,
    Long,
    Double,
    String,
    List,
    Map,
}

impl ValueType {
    /// Resolves a declared type name. Accepts the canonical names plus the
    /// common aliases used by other language bindings.
    pub fn resolve(name: &str) -> Option<Self> {
        let ty = match name {
            "void" | "()" => ValueType::Void,
            "boolean" | "bool" | "java.lang.Boolean" => ValueType::Bool,
            "int" | "i32" | "integer" | "java.lang.Integer" => ValueType::Int,
            "long" | "i64" | "java.lang.Long" => ValueType::Long,
            "double" | "float" | "f64" | "f32" | "java.lang.Double" => ValueType::Double,
            "string" | "String" | "str" | "java.lang.String" => ValueType::String,
            "list" | "array" | "Vec" | "java.util.List" => ValueType::List,
            "map" | "object" | "HashMap" | "java.util.Map" => ValueType::Map,
            _ => return None,
        };
        Some(ty)
    }

    /// Returns the canonical wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::Bool => "boolean",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Map => "map",
        }
    }

    /// Infers the narrowest type describing a value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Void,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(n) => match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => ValueType::Int,
                Some(_) => ValueType::Long,
                None if n.is_u64() => ValueType::Long,
                None => ValueType::Double,
            },
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::List,
            Value::Object(_) => ValueType::Map,
        }
    }

    /// Returns whether `value` conforms to this type. Reference types accept null.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Void, Value::Null) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::Int, Value::Number(n)) => {
                n.as_i64().map(|i| i32::try_from(i).is_ok()).unwrap_or(false)
            }
            (ValueType::Long, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ValueType::Double, Value::Number(_)) => true,
            (ValueType::String | ValueType::List | ValueType::Map, Value::Null) => true,
            (ValueType::String, Value::String(_)) => true,
            (ValueType::List, Value::Array(_)) => true,
            (ValueType::Map, Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_resolve_aliases() {
        assert_eq!(ValueType::resolve("int"), Some(ValueType::Int));
        assert_eq!(ValueType::resolve("i32"), Some(ValueType::Int));
        assert_eq!(ValueType::resolve("java.lang.String"), Some(ValueType::String));
        assert_eq!(ValueType::resolve("com.acme.Order"), None);
    }

    #[test]
    fn test_canonical_names_resolve_to_themselves() {
        for ty in [
            ValueType::Void,
            ValueType::Bool,
            ValueType::Int,
            ValueType::Long,
            ValueType::Double,
            ValueType::String,
            ValueType::List,
            ValueType::Map,
        ] {
            assert_eq!(ValueType::resolve(ty.name()), Some(ty));
        }
    }

    #[test]
    fn test_infer() {
        assert_eq!(ValueType::of(&json!(5)), ValueType::Int);
        assert_eq!(ValueType::of(&json!(5_000_000_000i64)), ValueType::Long);
        assert_eq!(ValueType::of(&json!(1.5)), ValueType::Double);
        assert_eq!(ValueType::of(&json!("x")), ValueType::String);
        assert_eq!(ValueType::of(&json!({"a": 1})), ValueType::Map);
        assert_eq!(ValueType::of(&Value::Null), ValueType::Void);
    }

    #[test]
    fn test_accepts() {
        assert!(ValueType::Int.accepts(&json!(2)));
        assert!(!ValueType::Int.accepts(&json!(5_000_000_000i64)));
        assert!(ValueType::Long.accepts(&json!(5_000_000_000i64)));
        assert!(ValueType::Double.accepts(&json!(2)));
        assert!(!ValueType::Int.accepts(&json!("2")));
        assert!(ValueType::String.accepts(&Value::Null));
        assert!(!ValueType::Bool.accepts(&Value::Null));
    }

    proptest! {
        #[test]
        fn prop_inferred_type_accepts_integer(n in any::<i64>()) {
            let value = json!(n);
            prop_assert!(ValueType::of(&value).accepts(&value));
            prop_assert!(ValueType::Long.accepts(&value));
            prop_assert!(ValueType::Double.accepts(&value));
        }

        #[test]
        fn prop_inferred_type_accepts_string(s in ".*") {
            let value = json!(s);
            prop_assert_eq!(ValueType::of(&value), ValueType::String);
            prop_assert!(!ValueType::Int.accepts(&value));
        }
    }
}
