use crate::{bytecode::Instructions, flatten, hash};
use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    io::Write,
    rc::Rc,
};

/// Runtime values. Aggregates are shared by reference through `Rc`;
/// popping a value off the machine stack clones the handle, not the data.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Integer(i64),
    Boolean(bool),
    Null,
    String(Rc<String>),
    Array(Rc<Vec<Object>>),
    Hash(Rc<HashMap<HashKey, HashPair>>),
    CompiledFunction(Rc<CompiledFunction>),
    Closure(Rc<Closure>),
    Builtin(Builtin),
    Error(String),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Integer(_) => "INTEGER",
            Object::Boolean(_) => "BOOLEAN",
            Object::Null => "NULL",
            Object::String(_) => "STRING",
            Object::Array(_) => "ARRAY",
            Object::Hash(_) => "HASH",
            Object::CompiledFunction(_) => "COMPILED_FUNCTION",
            Object::Closure(_) => "CLOSURE",
            Object::Builtin(_) => "BUILTIN",
            Object::Error(_) => "ERROR",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Object::Boolean(value) => *value,
            Object::Null => false,
            _ => true,
        }
    }

    /// Only integers, booleans and strings can key a hash. The type name in
    /// the key keeps `1` and `"1"` from ever colliding.
    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Object::Integer(value) => Some(HashKey {
                object_type: self.type_name(),
                value: *value as u64,
            }),
            Object::Boolean(value) => Some(HashKey {
                object_type: self.type_name(),
                value: *value as u64,
            }),
            Object::String(value) => Some(HashKey {
                object_type: self.type_name(),
                value: hash(value.as_str()),
            }),
            _ => None,
        }
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Object::Integer(value) => write!(f, "{}", value),
            Object::Boolean(value) => write!(f, "{}", value),
            Object::Null => write!(f, "null"),
            Object::String(value) => write!(f, "{}", value),
            Object::Array(elements) => {
                write!(f, "[{}]", flatten(elements.as_slice(), ", "))
            }
            Object::Hash(pairs) => {
                let rendered = pairs
                    .values()
                    .map(|pair| format!("{}: {}", pair.key, pair.value))
                    .collect::<Vec<_>>();
                write!(f, "{{{}}}", rendered.join(", "))
            }
            Object::CompiledFunction(_) => write!(f, "<compiled function>"),
            Object::Closure(_) => write!(f, "<closure>"),
            Object::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name),
            Object::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub object_type: &'static str,
    pub value: u64,
}

/// The original key object rides along with the value so hashes can be
/// displayed and iterated without reversing the digest.
#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Object,
    pub value: Object,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_parameters: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub func: Rc<CompiledFunction>,
    pub free: Vec<Object>,
}

pub type BuiltinFunction = fn(&[Object], &mut dyn Write) -> Object;

#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFunction,
}

impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
