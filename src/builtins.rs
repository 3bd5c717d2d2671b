use crate::{Builtin, Object};
use std::{io::Write, rc::Rc};

/// The registry order is fixed: `OpGetBuiltin n` refers to `BUILTINS[n]`,
/// so the compiler and the machine must agree on it.
pub const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "len",
        func: len,
    },
    Builtin {
        name: "puts",
        func: puts,
    },
    Builtin {
        name: "first",
        func: first,
    },
    Builtin {
        name: "last",
        func: last,
    },
    Builtin {
        name: "rest",
        func: rest,
    },
    Builtin {
        name: "push",
        func: push,
    },
];

fn len(args: &[Object], _output: &mut dyn Write) -> Object {
    if args.len() != 1 {
        return wrong_number_of_arguments(args.len(), 1);
    }
    match &args[0] {
        Object::String(value) => Object::Integer(value.len() as i64),
        Object::Array(elements) => Object::Integer(elements.len() as i64),
        argument => Object::Error(format!(
            "argument to `len` not supported, got {}",
            argument.type_name()
        )),
    }
}

fn puts(args: &[Object], output: &mut dyn Write) -> Object {
    for argument in args {
        let _ = writeln!(output, "{}", argument);
    }
    Object::Null
}

fn first(args: &[Object], _output: &mut dyn Write) -> Object {
    if args.len() != 1 {
        return wrong_number_of_arguments(args.len(), 1);
    }
    match &args[0] {
        Object::Array(elements) => {
            elements.first().cloned().unwrap_or(Object::Null)
        }
        argument => Object::Error(format!(
            "argument to `first` must be ARRAY, got {}",
            argument.type_name()
        )),
    }
}

fn last(args: &[Object], _output: &mut dyn Write) -> Object {
    if args.len() != 1 {
        return wrong_number_of_arguments(args.len(), 1);
    }
    match &args[0] {
        Object::Array(elements) => {
            elements.last().cloned().unwrap_or(Object::Null)
        }
        argument => Object::Error(format!(
            "argument to `last` must be ARRAY, got {}",
            argument.type_name()
        )),
    }
}

fn rest(args: &[Object], _output: &mut dyn Write) -> Object {
    if args.len() != 1 {
        return wrong_number_of_arguments(args.len(), 1);
    }
    match &args[0] {
        Object::Array(elements) => {
            if elements.is_empty() {
                Object::Null
            } else {
                Object::Array(Rc::new(elements[1..].to_vec()))
            }
        }
        argument => Object::Error(format!(
            "argument to `rest` must be ARRAY, got {}",
            argument.type_name()
        )),
    }
}

fn push(args: &[Object], _output: &mut dyn Write) -> Object {
    if args.len() != 2 {
        return wrong_number_of_arguments(args.len(), 2);
    }
    match &args[0] {
        Object::Array(elements) => {
            let mut extended = elements.as_ref().clone();
            extended.push(args[1].clone());
            Object::Array(Rc::new(extended))
        }
        argument => Object::Error(format!(
            "argument to `push` must be ARRAY, got {}",
            argument.type_name()
        )),
    }
}

fn wrong_number_of_arguments(got: usize, want: usize) -> Object {
    Object::Error(format!(
        "wrong number of arguments. got={}, want={}",
        got, want
    ))
}
