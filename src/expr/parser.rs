use regex::{Regex, RegexBuilder};

use super::lexer::{Lexer, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Concat => "&",
            BinOp::Eq => "=",
            BinOp::NotEq => "!=",
            BinOp::Lt => "<",
            BinOp::LtEq => "<=",
            BinOp::Gt => ">",
            BinOp::GtEq => ">=",
            BinOp::In => "in",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Regex(Regex),
    Name(String),
    Wildcard,
    /// `$`
    Context,
    /// `$$`
    Root,
    Variable(String),
    Path(Box<Node>, Box<Node>),
    Filter(Box<Node>, Box<Node>),
    Negate(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Condition(Box<Node>, Box<Node>, Option<Box<Node>>),
    Call(Box<Node>, Vec<Node>),
    Chain(Box<Node>, Box<Node>),
    Lambda(Vec<String>, Box<Node>),
    Array(Vec<Node>),
    Object(Vec<(Node, Node)>),
    Block(Vec<Node>),
    Bind(String, Box<Node>),
}

fn binding_power(token: &Token) -> u8 {
    match token {
        Token::LParen | Token::LBracket => 80,
        Token::Dot => 75,
        Token::Star | Token::Slash | Token::Percent => 60,
        Token::Plus | Token::Minus | Token::Amp => 50,
        Token::Eq
        | Token::NotEq
        | Token::Lt
        | Token::LtEq
        | Token::Gt
        | Token::GtEq
        | Token::In
        | Token::Chain => 40,
        Token::And => 30,
        Token::Or => 25,
        Token::Question => 20,
        Token::Assign => 10,
        _ => 0,
    }
}

fn binary_op(token: &Token) -> Option<BinOp> {
    let op = match token {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        Token::Amp => BinOp::Concat,
        Token::Eq => BinOp::Eq,
        Token::NotEq => BinOp::NotEq,
        Token::Lt => BinOp::Lt,
        Token::LtEq => BinOp::LtEq,
        Token::Gt => BinOp::Gt,
        Token::GtEq => BinOp::GtEq,
        Token::In => BinOp::In,
        Token::And => BinOp::And,
        Token::Or => BinOp::Or,
        _ => return None,
    };
    Some(op)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Eof => "end of expression".to_string(),
        Token::Name(name) => format!("name '{name}'"),
        Token::Var(name) => format!("variable '${name}'"),
        Token::Str(text) => format!("string {text:?}"),
        Token::Number(num) => format!("number {num}"),
        other => format!("{other:?}"),
    }
}

pub(crate) struct Parser {
    lexer: Lexer,
    current: Token,
}

impl Parser {
    pub fn parse(source: &str) -> Result<Node, String> {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token()?;
        let mut parser = Parser { lexer, current };
        if parser.current == Token::Eof {
            return Err("empty expression".to_string());
        }
        let node = parser.expression(0)?;
        if parser.current != Token::Eof {
            return Err(format!("unexpected {}", describe(&parser.current)));
        }
        Ok(node)
    }

    fn advance(&mut self) -> Result<Token, String> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if self.current == expected {
            self.advance()?;
            Ok(())
        } else {
            Err(format!(
                "expected {}, found {}",
                describe(&expected),
                describe(&self.current)
            ))
        }
    }

    fn expression(&mut self, rbp: u8) -> Result<Node, String> {
        let mut left = self.prefix()?;
        while rbp < binding_power(&self.current) {
            left = self.infix(left)?;
        }
        Ok(left)
    }

    fn prefix(&mut self) -> Result<Node, String> {
        let token = self.advance()?;
        let node = match token {
            Token::Number(num) => Node::Number(num),
            Token::Str(text) => Node::Str(text),
            Token::True => Node::Bool(true),
            Token::False => Node::Bool(false),
            Token::Null => Node::Null,
            Token::Name(name) => Node::Name(name),
            Token::Star => Node::Wildcard,
            Token::Var(name) if name.is_empty() => Node::Context,
            Token::Var(name) if name == "$" => Node::Root,
            Token::Var(name) => Node::Variable(name),
            Token::Regex { pattern, flags } => Node::Regex(compile_regex(&pattern, &flags)?),
            Token::Minus => Node::Negate(Box::new(self.expression(70)?)),
            Token::LParen => {
                let mut exprs = Vec::new();
                while self.current != Token::RParen {
                    exprs.push(self.expression(0)?);
                    if self.current == Token::Semicolon {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                Node::Block(exprs)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while self.current != Token::RBracket {
                    items.push(self.expression(0)?);
                    if self.current == Token::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RBracket)?;
                Node::Array(items)
            }
            Token::LBrace => {
                let mut pairs = Vec::new();
                while self.current != Token::RBrace {
                    let key = self.expression(0)?;
                    self.expect(Token::Colon)?;
                    let value = self.expression(0)?;
                    pairs.push((key, value));
                    if self.current == Token::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RBrace)?;
                Node::Object(pairs)
            }
            Token::Function => {
                self.expect(Token::LParen)?;
                let mut params = Vec::new();
                while self.current != Token::RParen {
                    match self.advance()? {
                        Token::Var(name) if !name.is_empty() && name != "$" => params.push(name),
                        other => {
                            return Err(format!(
                                "function parameters must be variables, found {}",
                                describe(&other)
                            ))
                        }
                    }
                    if self.current == Token::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                self.expect(Token::LBrace)?;
                let body = self.expression(0)?;
                self.expect(Token::RBrace)?;
                Node::Lambda(params, Box::new(body))
            }
            other => return Err(format!("unexpected {}", describe(&other))),
        };
        Ok(node)
    }

    fn infix(&mut self, left: Node) -> Result<Node, String> {
        let token = self.advance()?;
        let bp = binding_power(&token);

        if let Some(op) = binary_op(&token) {
            let right = self.expression(bp)?;
            return Ok(Node::Binary(op, Box::new(left), Box::new(right)));
        }

        let node = match token {
            Token::Dot => Node::Path(Box::new(left), Box::new(self.expression(bp)?)),
            Token::LBracket => {
                if self.current == Token::RBracket {
                    // `a[]` keeps the sequence as is
                    self.advance()?;
                    return Ok(left);
                }
                let predicate = self.expression(0)?;
                self.expect(Token::RBracket)?;
                Node::Filter(Box::new(left), Box::new(predicate))
            }
            Token::LParen => {
                let mut args = Vec::new();
                while self.current != Token::RParen {
                    args.push(self.expression(0)?);
                    if self.current == Token::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                match left {
                    Node::Variable(_) | Node::Lambda(..) | Node::Call(..) | Node::Block(_) => {}
                    _ => return Err("only functions can be invoked".to_string()),
                }
                Node::Call(Box::new(left), args)
            }
            Token::Chain => Node::Chain(Box::new(left), Box::new(self.expression(bp)?)),
            Token::Question => {
                let then = self.expression(0)?;
                let otherwise = if self.current == Token::Colon {
                    self.advance()?;
                    Some(Box::new(self.expression(0)?))
                } else {
                    None
                };
                Node::Condition(Box::new(left), Box::new(then), otherwise)
            }
            Token::Assign => {
                let Node::Variable(name) = left else {
                    return Err("left side of := must be a variable".to_string());
                };
                // right associative
                Node::Bind(name, Box::new(self.expression(bp - 1)?))
            }
            other => return Err(format!("unexpected {}", describe(&other))),
        };
        Ok(node)
    }
}

fn compile_regex(pattern: &str, flags: &str) -> Result<Regex, String> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(format!("unsupported regular expression flag '{other}'")),
        };
    }
    builder
        .build()
        .map_err(|err| format!("invalid regular expression /{pattern}/: {err}"))
}
