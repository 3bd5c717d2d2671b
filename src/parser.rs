use crate::{flatten, lexer::Token};
use anyhow::{bail, Result};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    slice::Iter,
};

pub type Identifier = String;

pub type Block = Vec<Statement>;

pub type Program = Vec<Statement>;

#[derive(Debug, PartialEq, Clone)]
pub enum Statement {
    Let(Identifier, Expression),
    Return(Expression),
    Expression(Expression),
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Self::Let(name, value) => write!(f, "let {} = {};", name, value),
            Self::Return(value) => write!(f, "return {};", value),
            Self::Expression(expression) => write!(f, "{}", expression),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Expression {
    Identifier(Identifier),
    Integer(i64),
    StringLiteral(String),
    Boolean(bool),
    Prefix(Operator, Box<Expression>),
    Infix(Box<Expression>, Operator, Box<Expression>),
    If(Box<Expression>, Block, Option<Block>),
    Function(Vec<Identifier>, Block),
    Call(Box<Expression>, Vec<Expression>),
    Array(Vec<Expression>),
    Hash(Vec<(Expression, Expression)>),
    Index(Box<Expression>, Box<Expression>),
}

impl Display for Expression {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let expression = match self {
            Self::Identifier(identifier) => identifier.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::StringLiteral(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Prefix(operator, right) => {
                format!("({}{})", operator, right)
            }
            Self::Infix(left, operator, right) => {
                format!("({} {} {})", left, operator, right)
            }
            Self::If(condition, consequence, alternative) => {
                let mut result = format!(
                    "if ({}) {{ {} }}",
                    condition,
                    flatten(consequence, " "),
                );
                if let Some(alternative) = alternative {
                    result.push_str(&format!(
                        " else {{ {} }}",
                        flatten(alternative, " ")
                    ));
                }
                result
            }
            Self::Function(parameters, body) => {
                format!(
                    "fn({}) {{ {} }}",
                    parameters.join(", "),
                    flatten(body, " ")
                )
            }
            Self::Call(function, arguments) => {
                format!("{}({})", function, flatten(arguments, ", "))
            }
            Self::Array(elements) => format!("[{}]", flatten(elements, ", ")),
            Self::Hash(pairs) => {
                let rendered = pairs
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, value))
                    .collect::<Vec<_>>();
                format!("{{{}}}", rendered.join(", "))
            }
            Self::Index(left, index) => format!("({}[{}])", left, index),
        };
        write!(f, "{}", expression)
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    Not,
    Negate,
}

impl Operator {
    pub fn from_token(token: &Token, is_prefix: bool) -> Result<Self> {
        Ok(match token {
            Token::Plus => Self::Add,
            Token::Minus if is_prefix => Self::Negate,
            Token::Minus => Self::Subtract,
            Token::Asterisk => Self::Multiply,
            Token::Slash => Self::Divide,
            Token::Equal => Self::Equal,
            Token::NotEqual => Self::NotEqual,
            Token::LessThan => Self::LessThan,
            Token::GreaterThan => Self::GreaterThan,
            Token::Bang => Self::Not,
            _ => bail!("Token is not an operator: {:?}", token),
        })
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let operator = match self {
            Self::Add => "+",
            Self::Subtract | Self::Negate => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::GreaterThan => ">",
            Self::Not => "!",
        };
        write!(f, "{}", operator)
    }
}

#[derive(Debug, PartialEq, PartialOrd, Copy, Clone)]
pub enum Precedence {
    Lowest,
    Equals,
    LessThanGreaterThan,
    Sum,
    Product,
    Prefix,
    Call,
    Index,
}

impl From<&Token> for Precedence {
    fn from(token: &Token) -> Self {
        match token {
            Token::Equal => Self::Equals,
            Token::NotEqual => Self::Equals,
            Token::LessThan => Self::LessThanGreaterThan,
            Token::GreaterThan => Self::LessThanGreaterThan,
            Token::Plus => Self::Sum,
            Token::Minus => Self::Sum,
            Token::Slash => Self::Product,
            Token::Asterisk => Self::Product,
            Token::LeftParentheses => Self::Call,
            Token::LeftBracket => Self::Index,
            _ => Self::Lowest,
        }
    }
}

pub struct Parser<'a> {
    pub tokens: Iter<'a, Token>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens: tokens.iter(),
        }
    }

    pub fn parse(&mut self) -> Result<Program> {
        let mut program = Program::new();
        while let Some(statement) = self.parse_statement()? {
            program.push(statement);
        }
        Ok(program)
    }

    pub fn parse_statement(&mut self) -> Result<Option<Statement>> {
        Ok(match self.peek_nth(0) {
            Token::EndOfFile => None,
            Token::Let => Some(self.parse_let_statement()?),
            Token::Return => Some(self.parse_return_statement()?),
            _ => Some(self.parse_expression_statement()?),
        })
    }

    fn parse_let_statement(&mut self) -> Result<Statement> {
        self.read_token();
        let name = match self.read_token() {
            Token::Identifier(name) => name.to_string(),
            token => {
                bail!("Expected identifier after 'let', found {:?}", token)
            }
        };
        if !matches!(self.read_token(), Token::Assign) {
            bail!("Expected '=' after 'let {}'", name);
        }
        let value = self.parse_expression(Precedence::Lowest)?;
        if matches!(self.peek_nth(0), Token::Semicolon) {
            self.read_token();
        }
        Ok(Statement::Let(name, value))
    }

    fn parse_return_statement(&mut self) -> Result<Statement> {
        self.read_token();
        let value = self.parse_expression(Precedence::Lowest)?;
        if matches!(self.peek_nth(0), Token::Semicolon) {
            self.read_token();
        }
        Ok(Statement::Return(value))
    }

    fn parse_expression_statement(&mut self) -> Result<Statement> {
        let expression = self.parse_expression(Precedence::Lowest)?;
        if matches!(self.peek_nth(0), Token::Semicolon) {
            self.read_token();
        }
        Ok(Statement::Expression(expression))
    }

    fn parse_expression(
        &mut self,
        precedence: Precedence,
    ) -> Result<Expression> {
        let mut advance = true;
        let mut expression = match self.peek_nth(0) {
            Token::Identifier(identifier) => {
                Expression::Identifier(identifier.to_string())
            }
            Token::Integer(value) => Expression::Integer(*value),
            Token::StringLiteral(value) => {
                Expression::StringLiteral(value.to_string())
            }
            Token::True => Expression::Boolean(true),
            Token::False => Expression::Boolean(false),
            Token::Bang | Token::Minus => {
                advance = false;
                self.parse_prefix_expression()?
            }
            Token::LeftParentheses => {
                advance = false;
                self.parse_grouped_expression()?
            }
            Token::If => {
                advance = false;
                self.parse_if_expression()?
            }
            Token::Function => {
                advance = false;
                self.parse_function_literal()?
            }
            Token::LeftBracket => {
                advance = false;
                self.parse_array_literal()?
            }
            Token::LeftBrace => {
                advance = false;
                self.parse_hash_literal()?
            }
            Token::EndOfFile => bail!("Unexpected end of file"),
            token => bail!("Token not valid for an expression: {:?}", token),
        };

        if advance {
            self.read_token();
        }

        while self.peek_nth(0) != &Token::Semicolon
            && precedence < Precedence::from(self.peek_nth(0))
        {
            match self.peek_nth(0) {
                Token::Plus
                | Token::Minus
                | Token::Slash
                | Token::Asterisk
                | Token::Equal
                | Token::NotEqual
                | Token::LessThan
                | Token::GreaterThan => {
                    expression =
                        self.parse_infix_expression(expression.clone())?;
                }
                Token::LeftParentheses => {
                    expression =
                        self.parse_call_expression(expression.clone())?;
                }
                Token::LeftBracket => {
                    expression =
                        self.parse_index_expression(expression.clone())?;
                }
                _ => break,
            };
        }

        Ok(expression)
    }

    fn parse_prefix_expression(&mut self) -> Result<Expression> {
        let operator = Operator::from_token(self.peek_nth(0), true)?;
        self.read_token();
        Ok(Expression::Prefix(
            operator,
            Box::new(self.parse_expression(Precedence::Prefix)?),
        ))
    }

    fn parse_infix_expression(
        &mut self,
        left_expression: Expression,
    ) -> Result<Expression> {
        let operator = Operator::from_token(self.peek_nth(0), false)?;
        let precedence = Precedence::from(self.peek_nth(0));
        self.read_token();
        Ok(Expression::Infix(
            Box::new(left_expression),
            operator,
            Box::new(self.parse_expression(precedence)?),
        ))
    }

    fn parse_grouped_expression(&mut self) -> Result<Expression> {
        self.read_token();
        let expression = self.parse_expression(Precedence::Lowest)?;
        if !matches!(self.read_token(), Token::RightParentheses) {
            bail!("Expected ')' to close a grouped expression");
        }
        Ok(expression)
    }

    fn parse_if_expression(&mut self) -> Result<Expression> {
        self.read_token();
        if !matches!(self.read_token(), Token::LeftParentheses) {
            bail!("Expected '(' after 'if'");
        }
        let condition = self.parse_expression(Precedence::Lowest)?;
        if !matches!(self.read_token(), Token::RightParentheses) {
            bail!("Expected ')' after the condition of an 'if'");
        }
        let consequence = self.parse_block()?;
        let alternative = if matches!(self.peek_nth(0), Token::Else) {
            self.read_token();
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Expression::If(Box::new(condition), consequence, alternative))
    }

    fn parse_function_literal(&mut self) -> Result<Expression> {
        self.read_token();
        if !matches!(self.read_token(), Token::LeftParentheses) {
            bail!("Expected '(' after 'fn'");
        }
        let mut parameters = Vec::new();
        while !matches!(self.peek_nth(0), Token::RightParentheses) {
            match self.read_token() {
                Token::Identifier(name) => parameters.push(name.to_string()),
                token => bail!("Expected parameter name, found {:?}", token),
            }
            if matches!(self.peek_nth(0), Token::Comma) {
                self.read_token();
            }
        }
        self.read_token();
        let body = self.parse_block()?;
        Ok(Expression::Function(parameters, body))
    }

    fn parse_call_expression(
        &mut self,
        expression: Expression,
    ) -> Result<Expression> {
        let arguments = self.parse_expression_list(&Token::RightParentheses)?;
        Ok(Expression::Call(Box::new(expression), arguments))
    }

    fn parse_index_expression(
        &mut self,
        expression: Expression,
    ) -> Result<Expression> {
        self.read_token();
        let index = self.parse_expression(Precedence::Lowest)?;
        if !matches!(self.read_token(), Token::RightBracket) {
            bail!("Expected ']' to close an index expression");
        }
        Ok(Expression::Index(Box::new(expression), Box::new(index)))
    }

    fn parse_array_literal(&mut self) -> Result<Expression> {
        let elements = self.parse_expression_list(&Token::RightBracket)?;
        Ok(Expression::Array(elements))
    }

    fn parse_hash_literal(&mut self) -> Result<Expression> {
        let mut pairs = Vec::new();
        self.read_token(); // {
        while self.peek_nth(0) != &Token::RightBrace {
            let key = self.parse_expression(Precedence::Lowest)?;
            if !matches!(self.read_token(), Token::Colon) {
                bail!("Expected ':' after a hash key");
            }
            let value = self.parse_expression(Precedence::Lowest)?;
            if matches!(self.peek_nth(0), Token::Comma) {
                self.read_token();
            }
            pairs.push((key, value));
        }
        self.read_token(); // }
        Ok(Expression::Hash(pairs))
    }

    fn parse_expression_list(
        &mut self,
        end_token: &Token,
    ) -> Result<Vec<Expression>> {
        self.read_token();
        let mut elements = Vec::new();
        while self.peek_nth(0) != end_token {
            elements.push(self.parse_expression(Precedence::Lowest)?);

            if matches!(self.peek_nth(0), Token::Comma) {
                self.read_token();
            }
        }
        self.read_token();
        Ok(elements)
    }

    fn parse_block(&mut self) -> Result<Block> {
        if !matches!(self.read_token(), Token::LeftBrace) {
            bail!("Expected '{{' to open a block");
        }
        let mut statements = Vec::new();
        while !matches!(self.peek_nth(0), Token::RightBrace | Token::EndOfFile)
        {
            match self.parse_statement()? {
                Some(statement) => statements.push(statement),
                None => break,
            }
        }
        if !matches!(self.read_token(), Token::RightBrace) {
            bail!("Expected '}}' to close a block");
        }
        Ok(statements)
    }

    fn read_token(&mut self) -> &Token {
        self.tokens.next().unwrap_or(&Token::EndOfFile)
    }

    fn peek_nth(&self, n: usize) -> &Token {
        self.tokens.clone().nth(n).unwrap_or(&Token::EndOfFile)
    }
}
