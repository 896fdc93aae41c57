//! Primitives and the gadget executor.
//!
//! A primitive is a named pure function over named ports. Gadget groups point
//! at a primitive by name; the registry resolves the name once per process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::PrimitiveInputError;
use crate::types::Value;

/// Port name → value
pub type Ports = BTreeMap<String, Value>;

pub type PrimitiveFn = fn(&Inputs<'_>) -> Result<Ports, PrimitiveInputError>;

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: String,
    /// Used when the port holds no value at fire time
    pub default: Option<Value>,
}

pub struct Primitive {
    pub name: String,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<String>,
    func: PrimitiveFn,
}

impl std::fmt::Debug for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Primitive")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Primitive {
    pub fn new(
        name: &str,
        inputs: &[(&str, Option<Value>)],
        outputs: &[&str],
        func: PrimitiveFn,
    ) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs
                .iter()
                .map(|(port, default)| InputSpec { name: port.to_string(), default: default.clone() })
                .collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            func,
        }
    }

    pub fn input(&self, port: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.name == port)
    }

    pub fn declares_output(&self, port: &str) -> bool {
        self.outputs.iter().any(|name| name == port)
    }
}

/// Typed access to a primitive's resolved inputs
pub struct Inputs<'a> {
    primitive: &'a str,
    values: &'a Ports,
}

impl<'a> Inputs<'a> {
    pub fn value(&self, port: &str) -> Result<&'a Value, PrimitiveInputError> {
        self.values.get(port).ok_or_else(|| PrimitiveInputError::MissingInput {
            primitive: self.primitive.to_string(),
            port: port.to_string(),
        })
    }

    pub fn number(&self, port: &str) -> Result<f64, PrimitiveInputError> {
        let value = self.value(port)?;
        value.as_number().ok_or_else(|| self.wrong_type(port, "number", value))
    }

    pub fn bool(&self, port: &str) -> Result<bool, PrimitiveInputError> {
        let value = self.value(port)?;
        value.as_bool().ok_or_else(|| self.wrong_type(port, "bool", value))
    }

    pub fn text(&self, port: &str) -> Result<&'a str, PrimitiveInputError> {
        let value = self.value(port)?;
        value.as_text().ok_or_else(|| self.wrong_type(port, "text", value))
    }

    pub fn invalid(&self, reason: impl Into<String>) -> PrimitiveInputError {
        PrimitiveInputError::Invalid { primitive: self.primitive.to_string(), reason: reason.into() }
    }

    fn wrong_type(&self, port: &str, expected: &'static str, value: &Value) -> PrimitiveInputError {
        PrimitiveInputError::WrongType {
            primitive: self.primitive.to_string(),
            port: port.to_string(),
            expected,
            actual: value.type_name(),
        }
    }
}

/// Primitives known to this process
#[derive(Debug, Default)]
pub struct PrimitiveRegistry {
    primitives: HashMap<String, Arc<Primitive>>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the arithmetic, logic and text primitives
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for primitive in builtins() {
            registry.register(primitive);
        }
        registry
    }

    /// Register a primitive. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, primitive: Primitive) {
        self.primitives.insert(primitive.name.clone(), Arc::new(primitive));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Primitive>> {
        self.primitives.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.primitives.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.primitives.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Run `primitive` for gadget `group_id`.
///
/// Missing inputs fall back to the declared default. Any failure means the
/// gadget did not fire: no outputs are returned at all.
pub fn fire(group_id: &str, primitive: &Primitive, inputs: &Ports) -> Result<Ports, PrimitiveInputError> {
    for port in inputs.keys() {
        if primitive.input(port).is_none() {
            return Err(PrimitiveInputError::UndeclaredPort {
                primitive: primitive.name.clone(),
                port: port.clone(),
            });
        }
    }

    let mut resolved = Ports::new();
    for spec in &primitive.inputs {
        match inputs.get(&spec.name).or(spec.default.as_ref()) {
            Some(value) => {
                resolved.insert(spec.name.clone(), value.clone());
            }
            None => {
                return Err(PrimitiveInputError::MissingInput {
                    primitive: primitive.name.clone(),
                    port: spec.name.clone(),
                })
            }
        }
    }

    let view = Inputs { primitive: &primitive.name, values: &resolved };
    let outputs = (primitive.func)(&view)?;
    if let Some(port) = outputs.keys().find(|port| !primitive.declares_output(port)) {
        return Err(view.invalid(format!("produced undeclared output {port}")));
    }

    tracing::trace!(gadget = %group_id, primitive = %primitive.name, outputs = outputs.len(), "Gadget fired");
    Ok(outputs)
}

fn single(port: &str, value: impl Into<Value>) -> Ports {
    let mut out = Ports::new();
    out.insert(port.to_string(), value.into());
    out
}

fn builtins() -> Vec<Primitive> {
    vec![
        Primitive::new("add", &[("a", None), ("b", None)], &["sum"], |i| {
            Ok(single("sum", i.number("a")? + i.number("b")?))
        }),
        Primitive::new("subtract", &[("a", None), ("b", None)], &["difference"], |i| {
            Ok(single("difference", i.number("a")? - i.number("b")?))
        }),
        Primitive::new("multiply", &[("a", None), ("b", None)], &["product"], |i| {
            Ok(single("product", i.number("a")? * i.number("b")?))
        }),
        Primitive::new("divide", &[("a", None), ("b", None)], &["quotient"], |i| {
            let divisor = i.number("b")?;
            if divisor == 0.0 {
                return Err(i.invalid("division by zero"));
            }
            Ok(single("quotient", i.number("a")? / divisor))
        }),
        Primitive::new("max", &[("a", None), ("b", None)], &["result"], |i| {
            Ok(single("result", i.number("a")?.max(i.number("b")?)))
        }),
        Primitive::new("min", &[("a", None), ("b", None)], &["result"], |i| {
            Ok(single("result", i.number("a")?.min(i.number("b")?)))
        }),
        // passes `value` through only while `open` is true
        Primitive::new(
            "gate",
            &[("value", None), ("open", Some(Value::Bool(false)))],
            &["output"],
            |i| {
                if i.bool("open")? {
                    Ok(single("output", i.value("value")?.clone()))
                } else {
                    Ok(Ports::new())
                }
            },
        ),
        Primitive::new("not", &[("input", None)], &["output"], |i| Ok(single("output", !i.bool("input")?))),
        Primitive::new("and", &[("a", None), ("b", None)], &["result"], |i| {
            Ok(single("result", i.bool("a")? && i.bool("b")?))
        }),
        Primitive::new("or", &[("a", None), ("b", None)], &["result"], |i| {
            Ok(single("result", i.bool("a")? || i.bool("b")?))
        }),
        Primitive::new(
            "concat",
            &[("a", None), ("b", None), ("separator", Some(Value::from("")))],
            &["result"],
            |i| Ok(single("result", format!("{}{}{}", i.text("a")?, i.text("separator")?, i.text("b")?))),
        ),
        Primitive::new("identity", &[("input", None)], &["output"], |i| {
            Ok(single("output", i.value("input")?.clone()))
        }),
        Primitive::new("equals", &[("a", None), ("b", None)], &["result"], |i| {
            Ok(single("result", i.value("a")? == i.value("b")?))
        }),
    ]
}
