//! Remote object identity, introspection and values.
//!
//! A remote object is announced with an [`ObjectDescriptor`] listing the
//! attributes and methods it publishes. Proxies validate every call against
//! the descriptor before any traffic reaches the transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique identifier of a proxy. Never reused while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(pub u64);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The transport's address for one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportId(pub String);

impl TransportId {
    /// Wrap a transport-specific address.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a proxy. Transitions are linear: Discovered → Active → Dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    /// Created from an announcement, not yet handed to the application.
    Discovered,
    /// Ready for method invocation; the creation callback has fired.
    Active,
    /// Torn down. Terminal.
    Dead,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Active => write!(f, "active"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Declared type of an attribute, argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    Double,
    String,
    Bool,
    Composite,
    Void,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "integer",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Bool => "boolean",
            Self::Composite => "composite",
            Self::Void => "void",
        };
        f.write_str(name)
    }
}

/// A value exchanged with a remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Composite(serde_json::Value),
    Void,
}

impl Value {
    /// The natural type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
            Self::Bool(_) => ValueType::Bool,
            Self::Composite(_) => ValueType::Composite,
            Self::Void => ValueType::Void,
        }
    }

    /// Whether this value is acceptable where `ty` is declared.
    ///
    /// Integers widen to floating point; floats satisfy both `Float` and `Double`.
    pub fn matches(&self, ty: ValueType) -> bool {
        matches!(
            (self, ty),
            (Self::Int(_), ValueType::Int | ValueType::Float | ValueType::Double)
                | (Self::Float(_), ValueType::Float | ValueType::Double)
                | (Self::String(_), ValueType::String)
                | (Self::Bool(_), ValueType::Bool)
                | (Self::Composite(_), ValueType::Composite)
                | (Self::Void, ValueType::Void)
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Composite(v) => write!(f, "{v}"),
            Self::Void => f.write_str("void"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// One positional argument of a published method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDesc {
    pub name: String,
    pub value_type: ValueType,
    /// Optional arguments may be omitted from the end of the argument list.
    #[serde(default)]
    pub optional: bool,
}

/// A published attribute with its last known value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDesc {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub readonly: bool,
    pub value: Value,
    #[serde(default)]
    pub description: String,
}

impl AttributeDesc {
    /// A writable attribute whose type is inferred from its initial value.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value_type: value.value_type(),
            readonly: false,
            value,
            description: String::new(),
        }
    }

    /// Mark the attribute read-only.
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A published method signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDesc {
    pub name: String,
    pub returns: ValueType,
    #[serde(default)]
    pub args: Vec<ArgumentDesc>,
    #[serde(default)]
    pub description: String,
}

impl MethodDesc {
    pub fn new(name: impl Into<String>, returns: ValueType) -> Self {
        Self {
            name: name.into(),
            returns,
            args: Vec::new(),
            description: String::new(),
        }
    }

    /// Append a required argument.
    pub fn arg(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.args.push(ArgumentDesc {
            name: name.into(),
            value_type,
            optional: false,
        });
        self
    }

    /// Append an optional argument.
    pub fn optional_arg(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.args.push(ArgumentDesc {
            name: name.into(),
            value_type,
            optional: true,
        });
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Number of arguments a caller must supply.
    pub fn required_args(&self) -> usize {
        self.args.iter().filter(|a| !a.optional).count()
    }

    /// Check an argument list against this signature.
    pub fn check_args(&self, args: &[Value]) -> Result<(), String> {
        let required = self.required_args();
        let total = self.args.len();
        if args.len() < required || args.len() > total {
            let qualifier = if required < total { "at least " } else { "" };
            return Err(format!(
                "{}() requires {qualifier}{required} arguments, total {total}, got {}",
                self.name,
                args.len()
            ));
        }
        for (i, (value, desc)) in args.iter().zip(&self.args).enumerate() {
            if !value.matches(desc.value_type) {
                return Err(format!(
                    "{}(): argument {} is not a {}",
                    self.name,
                    i + 1,
                    desc.value_type
                ));
            }
        }
        Ok(())
    }
}

/// Everything a remote object publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Logical type/name of the remote object.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDesc>,
    #[serde(default)]
    pub methods: Vec<MethodDesc>,
}

impl ObjectDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDesc) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_method(mut self, method: MethodDesc) -> Self {
        self.methods.push(method);
        self
    }

    /// Find a published attribute.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDesc> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Find a published method.
    pub fn method(&self, name: &str) -> Option<&MethodDesc> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Mutable access to a published attribute (cache refresh).
    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut AttributeDesc> {
        self.attributes.iter_mut().find(|a| a.name == name)
    }
}
