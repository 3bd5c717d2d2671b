use crate::{
    builtins::BUILTINS,
    bytecode::{self, Instructions, Opcode},
    compiler::Bytecode,
    object::{Builtin, Closure, CompiledFunction, HashPair, Object},
};
use anyhow::{bail, Result};
use std::{
    collections::HashMap,
    io::{self, Write},
    rc::Rc,
};

pub const STACK_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

/// Activation record for one call: the closure being run, the instruction
/// pointer into its code, and where on the operand stack its locals start.
#[derive(Debug, Clone)]
pub struct Frame {
    pub closure: Rc<Closure>,
    pub ip: isize,
    pub base_pointer: usize,
}

impl Frame {
    pub fn new(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Self {
            closure,
            ip: -1,
            base_pointer,
        }
    }

    pub fn instructions(&self) -> &Instructions {
        &self.closure.func.instructions
    }
}

pub struct VirtualMachine {
    pub constants: Vec<Object>,
    pub stack: Vec<Object>,
    pub stack_pointer: usize,
    pub globals: Vec<Object>,
    frames: Vec<Frame>,
    frame_index: usize,
    output: Box<dyn Write>,
}

impl VirtualMachine {
    pub fn new(bytecode: Bytecode) -> Self {
        let main_fn = CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        };
        let main_closure = Closure {
            func: Rc::new(main_fn),
            free: Vec::new(),
        };
        let main_frame = Frame::new(Rc::new(main_closure), 0);

        let mut frames = Vec::with_capacity(MAX_FRAMES);
        frames.push(main_frame);

        Self {
            constants: bytecode.constants,
            stack: vec![Object::Null; STACK_SIZE],
            stack_pointer: 0,
            globals: vec![Object::Null; GLOBALS_SIZE],
            frames,
            frame_index: 1,
            output: Box::new(io::stdout()),
        }
    }

    /// Runs against an externally owned globals vector, so an embedder can
    /// carry global bindings from one program to the next.
    pub fn new_with_globals_store(
        bytecode: Bytecode,
        globals: Vec<Object>,
    ) -> Self {
        let mut vm = Self::new(bytecode);
        vm.globals = globals;
        vm
    }

    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    /// The value most recently popped off the stack. After a successful run
    /// this is the result of the program's final expression statement.
    pub fn last_popped(&self) -> Object {
        self.stack
            .get(self.stack_pointer)
            .cloned()
            .unwrap_or(Object::Null)
    }

    pub fn run(&mut self) -> Result<()> {
        // The fetch-decode-execute cycle. The instruction pointer starts
        // at -1 and is advanced before the fetch.
        while self.current_frame().ip
            < self.current_frame().instructions().len() as isize - 1
        {
            self.current_frame_mut().ip += 1;
            let ip = self.current_frame().ip as usize;
            let byte = self.current_frame().instructions()[ip];
            let opcode = match Opcode::from_byte(byte) {
                Some(opcode) => opcode,
                None => bail!("unknown opcode: {}", byte),
            };

            match opcode {
                Opcode::Constant => {
                    let constant_index = self.read_u16_operand() as usize;
                    let constant = self.constants[constant_index].clone();
                    self.push(constant)?;
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div => {
                    self.execute_binary_operation(opcode)?;
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::True => {
                    self.push(Object::Boolean(true))?;
                }
                Opcode::False => {
                    self.push(Object::Boolean(false))?;
                }
                Opcode::Equal
                | Opcode::NotEqual
                | Opcode::GreaterThan => {
                    self.execute_comparison(opcode)?;
                }
                Opcode::Bang => {
                    let operand = self.pop()?;
                    self.push(Object::Boolean(!operand.is_truthy()))?;
                }
                Opcode::Minus => {
                    let operand = self.pop()?;
                    match operand {
                        Object::Integer(value) => {
                            self.push(Object::Integer(-value))?;
                        }
                        operand => bail!(
                            "unsupported type for negation: {}",
                            operand.type_name()
                        ),
                    }
                }
                Opcode::Jump => {
                    let position = self.read_u16_operand() as isize;
                    self.current_frame_mut().ip = position - 1;
                }
                Opcode::JumpNotTruthy => {
                    let position = self.read_u16_operand() as isize;
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = position - 1;
                    }
                }
                Opcode::Null => {
                    self.push(Object::Null)?;
                }
                Opcode::SetGlobal => {
                    let global_index = self.read_u16_operand() as usize;
                    let value = self.pop()?;
                    self.globals[global_index] = value;
                }
                Opcode::GetGlobal => {
                    let global_index = self.read_u16_operand() as usize;
                    let value = self.globals[global_index].clone();
                    self.push(value)?;
                }
                Opcode::Array => {
                    let num_elements = self.read_u16_operand() as usize;
                    let elements = self.stack
                        [self.stack_pointer - num_elements..self.stack_pointer]
                        .to_vec();
                    self.stack_pointer -= num_elements;
                    self.push(Object::Array(Rc::new(elements)))?;
                }
                Opcode::Hash => {
                    let num_elements = self.read_u16_operand() as usize;
                    let hash = self.build_hash(
                        self.stack_pointer - num_elements,
                        self.stack_pointer,
                    )?;
                    self.stack_pointer -= num_elements;
                    self.push(hash)?;
                }
                Opcode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.execute_index_expression(left, index)?;
                }
                Opcode::Call => {
                    let num_args = self.read_u8_operand() as usize;
                    self.execute_call(num_args)?;
                }
                Opcode::ReturnValue => {
                    let return_value = self.pop()?;
                    let frame = self.pop_frame();
                    self.stack_pointer = frame.base_pointer - 1;
                    self.push(return_value)?;
                }
                Opcode::Return => {
                    let frame = self.pop_frame();
                    self.stack_pointer = frame.base_pointer - 1;
                    self.push(Object::Null)?;
                }
                Opcode::SetLocal => {
                    let local_index = self.read_u8_operand() as usize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.pop()?;
                    self.stack[base_pointer + local_index] = value;
                }
                Opcode::GetLocal => {
                    let local_index = self.read_u8_operand() as usize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.stack[base_pointer + local_index].clone();
                    self.push(value)?;
                }
                Opcode::GetBuiltin => {
                    let builtin_index = self.read_u8_operand() as usize;
                    self.push(Object::Builtin(BUILTINS[builtin_index]))?;
                }
                Opcode::Closure => {
                    let constant_index = self.read_u16_operand() as usize;
                    let num_free = self.read_u8_operand() as usize;
                    self.push_closure(constant_index, num_free)?;
                }
                Opcode::GetFree => {
                    let free_index = self.read_u8_operand() as usize;
                    let value =
                        self.current_frame().closure.free[free_index].clone();
                    self.push(value)?;
                }
                Opcode::CurrentClosure => {
                    let closure = Rc::clone(&self.current_frame().closure);
                    self.push(Object::Closure(closure))?;
                }
            }
        }
        Ok(())
    }

    fn execute_binary_operation(&mut self, opcode: Opcode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        match (&left, &right) {
            (Object::Integer(left), Object::Integer(right)) => {
                let result = match opcode {
                    Opcode::Add => left + right,
                    Opcode::Sub => left - right,
                    Opcode::Mul => left * right,
                    Opcode::Div => {
                        if *right == 0 {
                            bail!("division by zero");
                        }
                        left / right
                    }
                    opcode => bail!(
                        "unknown integer operator: {}",
                        bytecode::lookup(opcode).name
                    ),
                };
                self.push(Object::Integer(result))
            }
            (Object::String(left), Object::String(right))
                if opcode == Opcode::Add =>
            {
                self.push(Object::String(Rc::new(format!(
                    "{}{}",
                    left, right
                ))))
            }
            _ => bail!(
                "unsupported types for binary operation: {} {}",
                left.type_name(),
                right.type_name()
            ),
        }
    }

    fn execute_comparison(&mut self, opcode: Opcode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        if let (Object::Integer(left), Object::Integer(right)) =
            (&left, &right)
        {
            let result = match opcode {
                Opcode::Equal => left == right,
                Opcode::NotEqual => left != right,
                Opcode::GreaterThan => left > right,
                opcode => bail!(
                    "unknown operator: {}",
                    bytecode::lookup(opcode).name
                ),
            };
            return self.push(Object::Boolean(result));
        }
        match opcode {
            Opcode::Equal => {
                self.push(Object::Boolean(identity_equal(&left, &right)))
            }
            Opcode::NotEqual => {
                self.push(Object::Boolean(!identity_equal(&left, &right)))
            }
            opcode => bail!(
                "unknown operator: {} ({} {})",
                bytecode::lookup(opcode).name,
                left.type_name(),
                right.type_name()
            ),
        }
    }

    fn build_hash(&self, start: usize, end: usize) -> Result<Object> {
        let mut pairs = HashMap::new();
        for i in (start..end).step_by(2) {
            let key = self.stack[i].clone();
            let value = self.stack[i + 1].clone();
            let hash_key = match key.hash_key() {
                Some(hash_key) => hash_key,
                None => {
                    bail!("unusable as hash key: {}", key.type_name())
                }
            };
            pairs.insert(hash_key, HashPair { key, value });
        }
        Ok(Object::Hash(Rc::new(pairs)))
    }

    fn execute_index_expression(
        &mut self,
        left: Object,
        index: Object,
    ) -> Result<()> {
        match (&left, &index) {
            (Object::Array(elements), Object::Integer(i)) => {
                let element = if *i < 0 || *i as usize >= elements.len() {
                    Object::Null
                } else {
                    elements[*i as usize].clone()
                };
                self.push(element)
            }
            (Object::Hash(pairs), index) => {
                let hash_key = match index.hash_key() {
                    Some(hash_key) => hash_key,
                    None => bail!(
                        "unusable as hash key: {}",
                        index.type_name()
                    ),
                };
                let value = pairs
                    .get(&hash_key)
                    .map(|pair| pair.value.clone())
                    .unwrap_or(Object::Null);
                self.push(value)
            }
            _ => bail!(
                "index operator not supported: {}",
                left.type_name()
            ),
        }
    }

    fn execute_call(&mut self, num_args: usize) -> Result<()> {
        let callee = self.stack[self.stack_pointer - 1 - num_args].clone();
        match callee {
            Object::Closure(closure) => self.call_closure(closure, num_args),
            Object::Builtin(builtin) => self.call_builtin(builtin, num_args),
            _ => bail!("calling non-closure and non-builtin"),
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        num_args: usize,
    ) -> Result<()> {
        if num_args != closure.func.num_parameters {
            bail!(
                "wrong number of arguments: want={}, got={}",
                closure.func.num_parameters,
                num_args
            );
        }
        if self.frame_index >= MAX_FRAMES {
            bail!("frame overflow");
        }
        let num_locals = closure.func.num_locals;
        let frame = Frame::new(closure, self.stack_pointer - num_args);
        let base_pointer = frame.base_pointer;
        if base_pointer + num_locals >= STACK_SIZE {
            bail!("stack overflow");
        }
        self.push_frame(frame);
        // Arguments already sit in the first local slots; the rest of the
        // frame's locals are reserved above them.
        self.stack_pointer = base_pointer + num_locals;
        Ok(())
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        num_args: usize,
    ) -> Result<()> {
        let args = self.stack
            [self.stack_pointer - num_args..self.stack_pointer]
            .to_vec();
        let result = (builtin.func)(&args, self.output.as_mut());
        self.stack_pointer = self.stack_pointer - num_args - 1;
        self.push(result)
    }

    fn push_closure(
        &mut self,
        constant_index: usize,
        num_free: usize,
    ) -> Result<()> {
        let constant = self.constants[constant_index].clone();
        let func = match constant {
            Object::CompiledFunction(func) => func,
            constant => bail!("not a function: {}", constant.type_name()),
        };
        let free = self.stack
            [self.stack_pointer - num_free..self.stack_pointer]
            .to_vec();
        self.stack_pointer -= num_free;
        self.push(Object::Closure(Rc::new(Closure { func, free })))
    }

    fn current_frame(&self) -> &Frame {
        &self.frames[self.frame_index - 1]
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        &mut self.frames[self.frame_index - 1]
    }

    fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
        self.frame_index += 1;
    }

    fn pop_frame(&mut self) -> Frame {
        self.frame_index -= 1;
        self.frames.pop().unwrap()
    }

    fn read_u16_operand(&mut self) -> u16 {
        let frame = self.current_frame_mut();
        let ip = frame.ip as usize;
        let operand =
            bytecode::read_u16(&frame.closure.func.instructions[ip + 1..]);
        frame.ip += 2;
        operand
    }

    fn read_u8_operand(&mut self) -> u8 {
        let frame = self.current_frame_mut();
        let ip = frame.ip as usize;
        let operand =
            bytecode::read_u8(&frame.closure.func.instructions[ip + 1..]);
        frame.ip += 1;
        operand
    }

    fn push(&mut self, object: Object) -> Result<()> {
        if self.stack_pointer >= STACK_SIZE {
            bail!("stack overflow");
        }
        self.stack[self.stack_pointer] = object;
        self.stack_pointer += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Object> {
        if self.stack_pointer == 0 {
            bail!("stack underflow");
        }
        self.stack_pointer -= 1;
        // The slot is left in place so last_popped can observe it.
        Ok(self.stack[self.stack_pointer].clone())
    }
}

/// Equality for non-integers follows the singleton model: booleans and null
/// compare by value, aggregates only when they are the same object.
fn identity_equal(left: &Object, right: &Object) -> bool {
    match (left, right) {
        (Object::Boolean(left), Object::Boolean(right)) => left == right,
        (Object::Null, Object::Null) => true,
        (Object::String(left), Object::String(right)) => {
            Rc::ptr_eq(left, right)
        }
        (Object::Array(left), Object::Array(right)) => Rc::ptr_eq(left, right),
        (Object::Hash(left), Object::Hash(right)) => Rc::ptr_eq(left, right),
        (Object::Closure(left), Object::Closure(right)) => {
            Rc::ptr_eq(left, right)
        }
        _ => false,
    }
}
