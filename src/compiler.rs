use crate::{
    builtins::BUILTINS,
    bytecode::{self, Instructions, Opcode},
    object::{CompiledFunction, Object},
    Expression, Operator, Statement,
};
use anyhow::{bail, Result};
use std::{collections::HashMap, rc::Rc, slice::Iter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    pub store: HashMap<String, Symbol>,
    pub num_definitions: usize,
    pub outer: Option<Box<SymbolTable>>,
    pub free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            ..Default::default()
        }
    }

    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.outer.is_some() {
            SymbolScope::Local
        } else {
            SymbolScope::Global
        };
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: self.num_definitions,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Binds a function's own name inside its body so the body can refer to
    /// the closure currently executing, before any global or local slot for
    /// it has been written.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        if let Some(ref mut outer) = self.outer {
            if let Some(symbol) = outer.resolve(name) {
                if symbol.scope == SymbolScope::Global
                    || symbol.scope == SymbolScope::Builtin
                {
                    return Some(symbol);
                }
                return Some(self.define_free(symbol));
            }
        }
        None
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol {
            name: original.name,
            scope: SymbolScope::Free,
            index: self.free_symbols.len() - 1,
        };
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }
}

#[derive(Debug, Default)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Object>,
}

impl Bytecode {
    pub fn disassemble(&self) -> String {
        bytecode::disassemble(&self.instructions)
    }
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

pub struct Compiler<'a> {
    pub statements: Iter<'a, Statement>,
    pub constants: Vec<Object>,
    pub symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
    scope_index: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(statements: &'a [Statement]) -> Self {
        let mut symbol_table = SymbolTable::new();
        for (index, builtin) in BUILTINS.iter().enumerate() {
            symbol_table.define_builtin(index, builtin.name);
        }
        Self {
            statements: statements.iter(),
            constants: Vec::new(),
            symbol_table,
            scopes: vec![CompilationScope::default()],
            scope_index: 0,
        }
    }

    /// Continues compiling against an existing symbol table and constant
    /// pool, so a line-by-line embedder shares globals across programs.
    pub fn new_with_state(
        statements: &'a [Statement],
        symbol_table: SymbolTable,
        constants: Vec<Object>,
    ) -> Self {
        Self {
            statements: statements.iter(),
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
            scope_index: 0,
        }
    }

    pub fn compile(&mut self) -> Result<Bytecode> {
        while let Some(statement) = self.statements.next() {
            self.compile_statement(statement)?;
        }
        Ok(Bytecode {
            instructions: self.current_instructions().clone(),
            constants: self.constants.clone(),
        })
    }

    fn compile_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Expression(expression) => {
                self.compile_expression(expression)?;
                self.emit(Opcode::Pop, &[]);
                Ok(())
            }
            Statement::Let(name, value) => {
                // The name is defined before the value compiles so that a
                // function body may refer to its own binding.
                let symbol = self.symbol_table.define(name);
                match value {
                    Expression::Function(parameters, body) => {
                        self.compile_function(
                            parameters,
                            body,
                            Some(name.as_str()),
                        )?;
                    }
                    value => self.compile_expression(value)?,
                }
                match symbol.scope {
                    SymbolScope::Global => {
                        self.emit(Opcode::SetGlobal, &[symbol.index]);
                    }
                    _ => {
                        self.emit(Opcode::SetLocal, &[symbol.index]);
                    }
                }
                Ok(())
            }
            Statement::Return(value) => {
                self.compile_expression(value)?;
                self.emit(Opcode::ReturnValue, &[]);
                Ok(())
            }
        }
    }

    fn compile_block(&mut self, block: &[Statement]) -> Result<()> {
        for statement in block {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    fn compile_expression(&mut self, expression: &Expression) -> Result<()> {
        match expression {
            Expression::Integer(value) => {
                let constant = self.add_constant(Object::Integer(*value));
                self.emit(Opcode::Constant, &[constant]);
            }
            Expression::StringLiteral(value) => {
                let constant = self
                    .add_constant(Object::String(Rc::new(value.to_string())));
                self.emit(Opcode::Constant, &[constant]);
            }
            Expression::Boolean(true) => {
                self.emit(Opcode::True, &[]);
            }
            Expression::Boolean(false) => {
                self.emit(Opcode::False, &[]);
            }
            Expression::Identifier(name) => {
                let symbol = match self.symbol_table.resolve(name) {
                    Some(symbol) => symbol,
                    None => bail!("undefined variable {}", name),
                };
                self.load_symbol(&symbol);
            }
            Expression::Prefix(operator, right) => {
                self.compile_expression(right)?;
                let opcode = match operator {
                    Operator::Not => Opcode::Bang,
                    Operator::Negate => Opcode::Minus,
                    operator => bail!("unknown operator: {}", operator),
                };
                self.emit(opcode, &[]);
            }
            Expression::Infix(left, Operator::LessThan, right) => {
                // `<` is sugar: the machine only knows `>`, so the operands
                // compile in swapped order.
                self.compile_expression(right)?;
                self.compile_expression(left)?;
                self.emit(Opcode::GreaterThan, &[]);
            }
            Expression::Infix(left, operator, right) => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                let opcode = match operator {
                    Operator::Add => Opcode::Add,
                    Operator::Subtract => Opcode::Sub,
                    Operator::Multiply => Opcode::Mul,
                    Operator::Divide => Opcode::Div,
                    Operator::GreaterThan => Opcode::GreaterThan,
                    Operator::Equal => Opcode::Equal,
                    Operator::NotEqual => Opcode::NotEqual,
                    operator => bail!("unknown operator: {}", operator),
                };
                self.emit(opcode, &[]);
            }
            Expression::If(condition, consequence, alternative) => {
                self.compile_expression(condition)?;
                let jump_not_truthy_position =
                    self.emit(Opcode::JumpNotTruthy, &[9999]);
                self.compile_block(consequence)?;
                if self.last_instruction_is(Opcode::Pop) {
                    self.remove_last_pop();
                }
                let jump_position = self.emit(Opcode::Jump, &[9999]);
                let after_consequence = self.current_instructions().len();
                self.change_operand(
                    jump_not_truthy_position,
                    after_consequence,
                );
                match alternative {
                    Some(alternative) => {
                        self.compile_block(alternative)?;
                        if self.last_instruction_is(Opcode::Pop) {
                            self.remove_last_pop();
                        }
                    }
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                }
                let after_alternative = self.current_instructions().len();
                self.change_operand(jump_position, after_alternative);
            }
            Expression::Function(parameters, body) => {
                self.compile_function(parameters, body, None)?;
            }
            Expression::Call(function, arguments) => {
                self.compile_expression(function)?;
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.emit(Opcode::Call, &[arguments.len()]);
            }
            Expression::Array(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
            }
            Expression::Hash(pairs) => {
                // Entries compile sorted by the key's textual form so that
                // structurally equal literals produce identical bytecode.
                let mut sorted = pairs.iter().collect::<Vec<_>>();
                sorted.sort_by_key(|pair| pair.0.to_string());
                for (key, value) in sorted {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2]);
            }
            Expression::Index(left, index) => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::Index, &[]);
            }
        }
        Ok(())
    }

    fn compile_function(
        &mut self,
        parameters: &[String],
        body: &[Statement],
        name: Option<&str>,
    ) -> Result<()> {
        self.enter_scope();
        if let Some(name) = name {
            self.symbol_table.define_function_name(name);
        }
        for parameter in parameters {
            self.symbol_table.define(parameter);
        }
        self.compile_block(body)?;
        if self.last_instruction_is(Opcode::Pop) {
            self.replace_last_pop_with_return();
        }
        if !self.last_instruction_is(Opcode::ReturnValue) {
            self.emit(Opcode::Return, &[]);
        }
        let free_symbols = self.symbol_table.free_symbols.clone();
        let num_locals = self.symbol_table.num_definitions;
        let instructions = self.leave_scope();

        // The captured originals load in the enclosing scope so OpClosure
        // finds them on top of the stack.
        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }
        let constant =
            self.add_constant(Object::CompiledFunction(Rc::new(
                CompiledFunction {
                    instructions,
                    num_locals,
                    num_parameters: parameters.len(),
                },
            )));
        self.emit(Opcode::Closure, &[constant, free_symbols.len()]);
        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => {
                self.emit(Opcode::GetBuiltin, &[symbol.index])
            }
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[]),
        };
    }

    fn add_constant(&mut self, object: Object) -> usize {
        self.constants.push(object);
        self.constants.len() - 1
    }

    fn emit(&mut self, opcode: Opcode, operands: &[usize]) -> usize {
        let instruction = bytecode::make(opcode, operands);
        let position = self.add_instruction(&instruction);
        self.set_last_instruction(opcode, position);
        position
    }

    fn add_instruction(&mut self, instruction: &[u8]) -> usize {
        let position = self.current_instructions().len();
        self.scopes[self.scope_index]
            .instructions
            .extend_from_slice(instruction);
        position
    }

    fn set_last_instruction(&mut self, opcode: Opcode, position: usize) {
        let scope = &mut self.scopes[self.scope_index];
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { opcode, position });
    }

    fn current_instructions(&self) -> &Instructions {
        &self.scopes[self.scope_index].instructions
    }

    fn last_instruction_is(&self, opcode: Opcode) -> bool {
        match self.scopes[self.scope_index].last_instruction {
            Some(instruction) => instruction.opcode == opcode,
            None => false,
        }
    }

    fn remove_last_pop(&mut self) {
        let scope = &mut self.scopes[self.scope_index];
        if let Some(last) = scope.last_instruction {
            scope.instructions.truncate(last.position);
            scope.last_instruction = scope.previous_instruction;
        }
    }

    fn replace_instruction(&mut self, position: usize, instruction: &[u8]) {
        let instructions = &mut self.scopes[self.scope_index].instructions;
        instructions[position..position + instruction.len()]
            .copy_from_slice(instruction);
    }

    fn replace_last_pop_with_return(&mut self) {
        let last = match self.scopes[self.scope_index].last_instruction {
            Some(last) => last,
            None => return,
        };
        let instruction = bytecode::make(Opcode::ReturnValue, &[]);
        self.replace_instruction(last.position, &instruction);
        self.scopes[self.scope_index].last_instruction =
            Some(EmittedInstruction {
                opcode: Opcode::ReturnValue,
                position: last.position,
            });
    }

    /// Rewrites the operand of the jump at `position` in place, once the
    /// target offset is known.
    fn change_operand(&mut self, position: usize, operand: usize) {
        if let Some(opcode) =
            Opcode::from_byte(self.current_instructions()[position])
        {
            let instruction = bytecode::make(opcode, &[operand]);
            self.replace_instruction(position, &instruction);
        }
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.scope_index += 1;
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().unwrap_or_default();
        self.scope_index -= 1;
        self.symbol_table = match self.symbol_table.outer.take() {
            Some(outer) => *outer,
            None => SymbolTable::new(),
        };
        scope.instructions
    }
}
