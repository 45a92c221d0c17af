use thiserror::Error;

use crate::{
    ast::{BinOp, Expr, Token, TypeRef, UnaryOp},
    lexer::{LexError, Lexer},
    value::Value,
};

/// Errors raised while parsing query text. Offsets are in characters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("expected {expected} at offset {position}, found {found}")]
    Expected {
        expected: String,
        found: String,
        position: usize,
    },

    #[error("unexpected {found} at offset {position}")]
    Unexpected { found: String, position: usize },

    #[error("invalid anonymous type member declarator at offset {0}")]
    InvalidMember(usize),
}

/// Type keywords that always start a cast when parenthesized.
const TYPE_KEYWORDS: &[&str] = &[
    "int", "long", "double", "decimal", "string", "char", "bool", "object", "DateTime",
];

pub struct Parser {
    tokens: Vec<(Token, usize)>,
    index: usize,
}

impl Parser {
    pub fn new(mut lexer: Lexer) -> Result<Self, ParseError> {
        let tokens = lexer.tokenize()?;
        Ok(Parser { tokens, index: 0 })
    }

    fn current(&self) -> &Token {
        self.peek(0)
    }

    fn peek(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.index + offset)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|(_, p)| *p)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        if !self.check(&expected) {
            return Err(self.expected(&expected.to_string()));
        }
        self.advance();
        Ok(())
    }

    fn expected(&self, what: &str) -> ParseError {
        ParseError::Expected {
            expected: what.to_string(),
            found: self.current().to_string(),
            position: self.position(),
        }
    }

    fn unexpected(&self) -> ParseError {
        ParseError::Unexpected {
            found: self.current().to_string(),
            position: self.position(),
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.current() {
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.expected("identifier")),
        }
    }

    /// Parse the whole input as one expression.
    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expression()?;
        if !self.check(&Token::Eof) {
            return Err(self.unexpected());
        }
        Ok(expr)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        if let Some(params) = self.lambda_parameters() {
            return self.parse_lambda(params);
        }
        self.parse_conditional()
    }

    /// Detect `x =>` and `(a, b) =>` without consuming anything.
    fn lambda_parameters(&self) -> Option<Vec<String>> {
        match (self.peek(0), self.peek(1)) {
            (Token::Identifier(name), Token::Arrow) => Some(vec![name.clone()]),
            (Token::LeftParen, _) => {
                let mut params = Vec::new();
                let mut offset = 1;
                if self.peek(offset) == &Token::RightParen {
                    return (self.peek(offset + 1) == &Token::Arrow).then_some(params);
                }
                loop {
                    match self.peek(offset) {
                        Token::Identifier(name) => params.push(name.clone()),
                        _ => return None,
                    }
                    offset += 1;
                    match self.peek(offset) {
                        Token::Comma => offset += 1,
                        Token::RightParen => break,
                        _ => return None,
                    }
                }
                (self.peek(offset + 1) == &Token::Arrow).then_some(params)
            }
            _ => None,
        }
    }

    fn parse_lambda(&mut self, params: Vec<String>) -> Result<Expr, ParseError> {
        // skip the parameter list up to and including the arrow
        while !self.check(&Token::Arrow) {
            self.advance();
        }
        self.advance();
        let body = self.parse_expression()?;
        Ok(Expr::Lambda { params, body: Box::new(body) })
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let test = self.parse_coalesce()?;
        if !self.check(&Token::Question) {
            return Ok(test);
        }
        self.advance();
        let if_true = self.parse_expression()?;
        self.expect(Token::Colon)?;
        let if_false = self.parse_expression()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        })
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_or()?;
        if self.check(&Token::QuestionQuestion) {
            self.advance();
            let right = self.parse_coalesce()?;
            return Ok(Expr::binary(BinOp::Coalesce, left, right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(&Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::binary(BinOp::OrElse, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.check(&Token::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::binary(BinOp::AndAlso, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.current() {
                Token::EqualEqual => BinOp::Equal,
                Token::NotEqual => BinOp::NotEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current() {
                Token::Less => BinOp::LessThan,
                Token::LessEqual => BinOp::LessEqual,
                Token::Greater => BinOp::GreaterThan,
                Token::GreaterEqual => BinOp::GreaterEqual,
                Token::Is => {
                    self.advance();
                    let type_name = self.parse_type_name()?;
                    left = Expr::TypeIs { operand: Box::new(left), type_name };
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinOp::Multiply,
                Token::Slash => BinOp::Divide,
                Token::Percent => BinOp::Modulo,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.current() {
            Token::Bang => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::unary(UnaryOp::Not, operand))
            }
            Token::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(match operand {
                    Expr::Constant(Value::Int32(n)) => Expr::Constant(Value::Int32(-n)),
                    Expr::Constant(Value::Int64(n)) => Expr::Constant(Value::Int64(-n)),
                    Expr::Constant(Value::Double(n)) => Expr::Constant(Value::Double(-n)),
                    Expr::Constant(Value::Decimal(d)) => Expr::Constant(Value::Decimal(-d)),
                    other => Expr::unary(UnaryOp::Negate, other),
                })
            }
            Token::LeftParen if self.is_cast() => {
                self.advance();
                let to = TypeRef::from_name(&self.parse_type_name()?);
                self.expect(Token::RightParen)?;
                let operand = self.parse_unary()?;
                Ok(Expr::Convert { operand: Box::new(operand), to })
            }
            _ => self.parse_postfix(),
        }
    }

    /// `(T)` followed by the start of an operand.
    fn is_cast(&self) -> bool {
        let Token::Identifier(name) = self.peek(1) else {
            return false;
        };
        let mut offset = 2;
        while self.peek(offset) == &Token::Dot {
            if !matches!(self.peek(offset + 1), Token::Identifier(_)) {
                return false;
            }
            offset += 2;
        }
        if self.peek(offset) == &Token::Question {
            offset += 1;
        }
        if self.peek(offset) != &Token::RightParen {
            return false;
        }
        let starts_operand = matches!(
            self.peek(offset + 1),
            Token::Identifier(_)
                | Token::Integer(_)
                | Token::Long(_)
                | Token::Double(_)
                | Token::Decimal(_)
                | Token::String(_)
                | Token::Char(_)
                | Token::True
                | Token::False
                | Token::Null
                | Token::New
                | Token::LeftParen
                | Token::Bang
        );
        starts_operand || TYPE_KEYWORDS.contains(&name.as_str())
    }

    /// Dotted type name with an optional nullable marker (`System.Int32`, `int?`).
    fn parse_type_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.expect_identifier()?;
        while self.check(&Token::Dot) && matches!(self.peek(1), Token::Identifier(_)) {
            self.advance();
            name.push('.');
            name.push_str(&self.expect_identifier()?);
        }
        if self.check(&Token::Question) && !self.starts_operand_after_question() {
            self.advance();
            name.push('?');
        }
        Ok(name)
    }

    /// Distinguish `x is int? ...` from a conditional `x is Cat ? a : b`.
    fn starts_operand_after_question(&self) -> bool {
        !matches!(
            self.peek(1),
            Token::RightParen | Token::Comma | Token::RightBrace | Token::Eof | Token::Greater
        )
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    let type_args = self.parse_type_arguments()?;
                    if self.check(&Token::LeftParen) {
                        let args = self.parse_arguments()?;
                        expr = Expr::Call {
                            target: Some(Box::new(expr)),
                            method: name,
                            type_args,
                            args,
                        };
                    } else {
                        expr = Expr::member(expr, name);
                    }
                }
                Token::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(Token::RightBracket)?;
                    expr = Expr::index(expr, index);
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Generic arguments on a method call: `OfType<Cat>(`.
    fn parse_type_arguments(&mut self) -> Result<Vec<TypeRef>, ParseError> {
        if !self.check(&Token::Less) || !self.is_type_argument_list() {
            return Ok(Vec::new());
        }
        self.advance();
        let mut types = vec![TypeRef::from_name(&self.parse_type_name()?)];
        while self.check(&Token::Comma) {
            self.advance();
            types.push(TypeRef::from_name(&self.parse_type_name()?));
        }
        self.expect(Token::Greater)?;
        Ok(types)
    }

    fn is_type_argument_list(&self) -> bool {
        let mut offset = 1;
        loop {
            match self.peek(offset) {
                Token::Identifier(_) | Token::Dot | Token::Comma | Token::Question => offset += 1,
                Token::Greater => return self.peek(offset + 1) == &Token::LeftParen,
                _ => return false,
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(Token::LeftParen)?;
        let mut args = Vec::new();
        if self.check(&Token::RightParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            match self.current() {
                Token::Comma => {
                    self.advance();
                }
                Token::RightParen => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.expected("',' or ')'")),
            }
        }
    }

    /// Parse primary expressions (atoms): literals, names, parentheses and `new`
    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.current().clone() {
            Token::Integer(n) => {
                self.advance();
                Ok(Expr::Constant(match i32::try_from(n) {
                    Ok(small) => Value::Int32(small),
                    Err(_) => Value::Int64(n),
                }))
            }
            Token::Long(n) => {
                self.advance();
                Ok(Expr::Constant(Value::Int64(n)))
            }
            Token::Double(n) => {
                self.advance();
                Ok(Expr::Constant(Value::Double(n)))
            }
            Token::Decimal(d) => {
                self.advance();
                Ok(Expr::Constant(Value::Decimal(d)))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::Constant(Value::String(s)))
            }
            Token::Char(c) => {
                self.advance();
                Ok(Expr::Constant(Value::String(c.to_string())))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Constant(Value::Boolean(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Constant(Value::Boolean(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Constant(Value::Null))
            }
            Token::Identifier(name) => {
                self.advance();
                if self.check(&Token::LeftParen) {
                    let args = self.parse_arguments()?;
                    return Ok(Expr::static_call(name, args));
                }
                Ok(Expr::Identifier(name))
            }
            Token::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                Ok(expr)
            }
            Token::New => {
                self.advance();
                self.parse_new()
            }
            _ => Err(self.unexpected()),
        }
    }

    /// `new { .. }`, `new T { .. }`, `new T()`, `new[] { .. }`, `new T[] { .. }`
    fn parse_new(&mut self) -> Result<Expr, ParseError> {
        let type_name = match self.current() {
            Token::Identifier(_) => Some(self.parse_type_name()?),
            _ => None,
        };

        if self.check(&Token::LeftBracket) {
            self.advance();
            self.expect(Token::RightBracket)?;
            return self.parse_array_items();
        }

        if type_name.is_some() && self.check(&Token::LeftParen) {
            self.expect(Token::LeftParen)?;
            self.expect(Token::RightParen)?;
            if !self.check(&Token::LeftBrace) {
                return Ok(Expr::New { type_name, members: Vec::new() });
            }
        }

        self.expect(Token::LeftBrace)?;
        let mut members = Vec::new();
        while !self.check(&Token::RightBrace) {
            members.push(self.parse_member_declarator()?);
            if self.check(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RightBrace)?;
        Ok(Expr::New { type_name, members })
    }

    fn parse_member_declarator(&mut self) -> Result<(String, Expr), ParseError> {
        if let (Token::Identifier(name), Token::Assign) = (self.peek(0), self.peek(1)) {
            let name = name.clone();
            self.advance();
            self.advance();
            return Ok((name, self.parse_expression()?));
        }
        let position = self.position();
        let value = self.parse_expression()?;
        let name = match &value {
            Expr::Member { name, .. } | Expr::Identifier(name) => name.clone(),
            _ => return Err(ParseError::InvalidMember(position)),
        };
        Ok((name, value))
    }

    fn parse_array_items(&mut self) -> Result<Expr, ParseError> {
        self.expect(Token::LeftBrace)?;
        let mut items = Vec::new();
        while !self.check(&Token::RightBrace) {
            items.push(self.parse_expression()?);
            if self.check(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RightBrace)?;
        Ok(Expr::NewArray(items))
    }
}

/// Parse query text into an expression graph.
///
/// # Examples
///
/// ```
/// use docstage::parse_query;
///
/// let expr = parse_query("docs.Where(x => x.Age > 21)").unwrap();
/// assert_eq!(expr.to_string(), "docs.Where(x => x.Age > 21)");
/// ```
pub fn parse_query(text: &str) -> Result<Expr, ParseError> {
    Parser::new(Lexer::new(text))?.parse()
}
