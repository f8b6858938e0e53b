use std::collections::BTreeMap;

use minirpc::{
    Args, ServiceTable, Signature,
    codec::binary::{ArgSchema, BinaryReply, DIVIDE},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Schemas served by the binary divide server.
pub const BINARY_SCHEMAS: &[ArgSchema] = &[DIVIDE];

/// A JSON number that stays an integer while integer arithmetic suffices.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    fn combine(
        self,
        other: Number,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Number {
        if let (Number::Int(a), Number::Int(b)) = (self, other)
            && let Some(v) = int_op(a, b)
        {
            return Number::Int(v);
        }
        Number::Float(float_op(self.as_f64(), other.as_f64()))
    }
}

fn add(a: Number, b: Number) -> Number {
    a.combine(b, i64::checked_add, |a, b| a + b)
}

fn multiply(a: Number, b: Number) -> Number {
    a.combine(b, i64::checked_mul, |a, b| a * b)
}

fn subtract(a: Number, b: Number) -> Number {
    a.combine(b, i64::checked_sub, |a, b| a - b)
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

/// Registers the example business functions.
pub fn register_demo_methods(table: &mut ServiceTable) {
    table
        .add_method("hi", |(user,): (String,)| {
            Ok::<_, String>(format!("hi {user}, welcome"))
        })
        .add_method("hello", |(name,): (String,)| {
            Ok::<_, String>(format!("Hello, {name}!"))
        })
        .add_raw("add", |args: Args| {
            args.expect_at_most(3, &["c"])?;
            let a: Number = args.arg(0)?;
            let b: Number = args.arg(1)?;
            let c: Number = args.arg_or(2, "c", Number::Int(10))?;
            Ok(json!(add(add(a, b), c)))
        })
        .add_method("subtract", |(a, b): (Number, Number)| {
            Ok::<_, String>(subtract(a, b))
        })
        .add_method("multiply", |(a, b): (Number, Number)| {
            Ok::<_, String>(multiply(a, b))
        })
        .add_method("divide", |(a, b): (Number, Number)| {
            if b.as_f64() == 0.0 {
                Err("Division by zero error!")
            } else {
                Ok(a.as_f64() / b.as_f64())
            }
        })
        .add_method("square", |(number,): (Number,)| {
            Ok::<_, String>(multiply(number, number))
        })
        .add_method("area_of_circle", |(radius,): (Number,)| {
            Ok::<_, String>(std::f64::consts::PI * radius.as_f64().powi(2))
        })
        .add_method("to_uppercase", |(string,): (String,)| {
            Ok::<_, String>(string.to_uppercase())
        })
        .add_method("reverse_string", |(string,): (String,)| {
            Ok::<_, String>(string.chars().rev().collect::<String>())
        });

    let plain: [(&str, &[&str]); 9] = [
        ("hi", &["user"]),
        ("hello", &["name"]),
        ("subtract", &["a", "b"]),
        ("multiply", &["a", "b"]),
        ("divide", &["a", "b"]),
        ("square", &["number"]),
        ("area_of_circle", &["radius"]),
        ("to_uppercase", &["string"]),
        ("reverse_string", &["string"]),
    ];
    for (method, args) in plain {
        table.describe(
            method,
            Signature {
                method_args: names(args),
                ..Default::default()
            },
        );
    }
    let mut kwargs = serde_json::Map::new();
    kwargs.insert("c".into(), Value::from(10));
    table.describe(
        "add",
        Signature {
            method_args: names(&["a", "b"]),
            method_kwargs: kwargs,
        },
    );
}

/// Binary `divide(num1, num2=1)`.
pub fn binary_divide(method: &str, args: &BTreeMap<String, i32>) -> BinaryReply {
    if method != DIVIDE.method {
        return BinaryReply::Err(format!("no such method: {method}"));
    }
    let Some(&num1) = args.get("num1") else {
        return BinaryReply::Err("divide() missing required argument: 'num1'".into());
    };
    let num2 = args.get("num2").copied().unwrap_or(1);
    if num2 == 0 {
        return BinaryReply::Err("invalid operation: division by zero".into());
    }
    BinaryReply::Ok(num1 as f32 / num2 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minirpc::LIST_METHODS;

    fn table() -> ServiceTable {
        let mut table = ServiceTable::default();
        register_demo_methods(&mut table);
        table
    }

    fn call(table: &ServiceTable, method: &str, args: Value) -> minirpc::Result<Value> {
        let args = args.as_array().unwrap().clone();
        table.invoke(method, Args::new(args, serde_json::Map::new()))
    }

    #[test]
    fn test_demo_methods() {
        let table = table();
        assert_eq!(
            call(&table, "hi", json!(["accio"])).unwrap(),
            json!("hi accio, welcome")
        );
        assert_eq!(
            call(&table, "hello", json!(["accio"])).unwrap(),
            json!("Hello, accio!")
        );
        assert_eq!(call(&table, "add", json!([1, 2])).unwrap(), json!(13));
        assert_eq!(call(&table, "add", json!([1, 2, 3])).unwrap(), json!(6));
        assert_eq!(call(&table, "add", json!([1, 2.5])).unwrap(), json!(13.5));
        assert_eq!(call(&table, "subtract", json!([1, 2])).unwrap(), json!(-1));
        assert_eq!(call(&table, "multiply", json!([3, 4])).unwrap(), json!(12));
        assert_eq!(call(&table, "divide", json!([3, 2])).unwrap(), json!(1.5));
        assert_eq!(call(&table, "square", json!([5])).unwrap(), json!(25));
        assert_eq!(
            call(&table, "to_uppercase", json!(["abc"])).unwrap(),
            json!("ABC")
        );
        assert_eq!(
            call(&table, "reverse_string", json!(["abc"])).unwrap(),
            json!("cba")
        );
        let area = call(&table, "area_of_circle", json!([1])).unwrap();
        assert!((area.as_f64().unwrap() - std::f64::consts::PI).abs() < 1e-9);

        let err = call(&table, "divide", json!([1, 0])).unwrap_err();
        assert!(err.msg.contains("Division by zero"));
    }

    #[test]
    fn test_add_keyword() {
        let table = table();
        let kwargs = json!({"c": 0}).as_object().unwrap().clone();
        let res = table
            .invoke("add", Args::new(vec![json!(1), json!(2)], kwargs))
            .unwrap();
        assert_eq!(res, json!(3));

        let methods = table.invoke(LIST_METHODS, Args::default()).unwrap();
        let add = &methods.as_array().unwrap()[0];
        assert_eq!(add["method_name"], "add");
        assert_eq!(add["method_kwargs"], json!({"c": 10}));
    }

    #[test]
    fn test_binary_divide() {
        let mut args = BTreeMap::new();
        args.insert("num1".to_string(), 200);
        assert_eq!(binary_divide("divide", &args), BinaryReply::Ok(200.0));
        args.insert("num2".to_string(), 100);
        assert_eq!(binary_divide("divide", &args), BinaryReply::Ok(2.0));
        args.insert("num2".to_string(), 0);
        assert!(matches!(binary_divide("divide", &args), BinaryReply::Err(_)));
        assert!(matches!(
            binary_divide("divide", &BTreeMap::new()),
            BinaryReply::Err(_)
        ));
    }
}
