#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Name(String),
    /// `$name`; the empty name is `$` (context), `"$"` is `$$` (input root)
    Var(String),
    Regex { pattern: String, flags: String },
    Dot,
    Comma,
    Colon,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Question,
    Chain,
    Assign,
    And,
    Or,
    In,
    True,
    False,
    Null,
    Function,
    Eof,
}

pub(crate) struct Lexer {
    input: Vec<char>,
    position: usize,
    // a '/' after an operand is division, anywhere else it opens a regex
    after_operand: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
            after_operand: false,
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_trivia(&mut self) -> Result<(), String> {
        loop {
            match self.current_char() {
                Some(ch) if ch.is_whitespace() => self.advance(),
                Some('/') if self.peek_char(1) == Some('*') => {
                    self.position += 2;
                    loop {
                        match self.current_char() {
                            None => return Err("unterminated comment".to_string()),
                            Some('*') if self.peek_char(1) == Some('/') => {
                                self.position += 2;
                                break;
                            }
                            Some(_) => self.advance(),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_string(&mut self, quote: char) -> Result<String, String> {
        let mut result = String::new();
        self.advance();

        while let Some(ch) = self.current_char() {
            match ch {
                c if c == quote => {
                    self.advance();
                    return Ok(result);
                }
                '\\' => {
                    self.advance();
                    match self.current_char() {
                        Some('n') => result.push('\n'),
                        Some('t') => result.push('\t'),
                        Some('r') => result.push('\r'),
                        Some('b') => result.push('\u{8}'),
                        Some('f') => result.push('\u{c}'),
                        Some('"') => result.push('"'),
                        Some('\'') => result.push('\''),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('u') => {
                            let hex: String = (1..=4).filter_map(|i| self.peek_char(i)).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .filter(|_| hex.len() == 4)
                                .and_then(char::from_u32)
                                .ok_or_else(|| format!("invalid unicode escape \\u{hex}"))?;
                            result.push(code);
                            self.position += 4;
                        }
                        Some(other) => return Err(format!("invalid escape sequence \\{other}")),
                        None => return Err("unterminated string".to_string()),
                    }
                    self.advance();
                }
                _ => {
                    result.push(ch);
                    self.advance();
                }
            }
        }

        Err("unterminated string".to_string())
    }

    fn read_backtick_name(&mut self) -> Result<String, String> {
        self.advance();
        let mut name = String::new();
        while let Some(ch) = self.current_char() {
            self.advance();
            if ch == '`' {
                return Ok(name);
            }
            name.push(ch);
        }
        Err("unterminated quoted name".to_string())
    }

    fn read_regex(&mut self) -> Result<Token, String> {
        self.advance();
        let mut pattern = String::new();
        loop {
            match self.current_char() {
                None => return Err("unterminated regular expression".to_string()),
                Some('\\') => {
                    self.advance();
                    match self.current_char() {
                        Some('/') => pattern.push('/'),
                        Some(other) => {
                            pattern.push('\\');
                            pattern.push(other);
                        }
                        None => return Err("unterminated regular expression".to_string()),
                    }
                    self.advance();
                }
                Some('/') => {
                    self.advance();
                    break;
                }
                Some(ch) => {
                    pattern.push(ch);
                    self.advance();
                }
            }
        }
        if pattern.is_empty() {
            return Err("empty regular expression".to_string());
        }
        let mut flags = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphabetic() {
                flags.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::Regex { pattern, flags })
    }

    fn read_number(&mut self) -> Result<Token, String> {
        let mut number = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                number.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if self.current_char() == Some('.') && self.peek_char(1).is_some_and(|c| c.is_ascii_digit())
        {
            number.push('.');
            self.advance();
            while let Some(ch) = self.current_char() {
                if ch.is_ascii_digit() {
                    number.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.current_char(), Some('e') | Some('E')) {
            let sign = matches!(self.peek_char(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_char(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..digit_at {
                    number.push(self.current_char().unwrap_or('e'));
                    self.advance();
                }
                while let Some(ch) = self.current_char() {
                    if ch.is_ascii_digit() {
                        number.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }
        number
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| format!("invalid number {number}"))
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn double(&mut self, token: Token) -> Token {
        self.position += 2;
        token
    }

    pub fn next_token(&mut self) -> Result<Token, String> {
        let token = self.scan()?;
        self.after_operand = matches!(
            token,
            Token::Number(_)
                | Token::Str(_)
                | Token::Name(_)
                | Token::Var(_)
                | Token::Regex { .. }
                | Token::RParen
                | Token::RBracket
                | Token::RBrace
                | Token::True
                | Token::False
                | Token::Null
        );
        Ok(token)
    }

    fn scan(&mut self) -> Result<Token, String> {
        self.skip_trivia()?;

        let Some(ch) = self.current_char() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '$' => {
                self.advance();
                match self.current_char() {
                    Some('$') => {
                        self.advance();
                        Token::Var("$".to_string())
                    }
                    Some(c) if c.is_alphanumeric() || c == '_' => {
                        Token::Var(self.read_identifier())
                    }
                    _ => Token::Var(String::new()),
                }
            }
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            ';' => self.single(Token::Semicolon),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),
            '{' => self.single(Token::LBrace),
            '}' => self.single(Token::RBrace),
            '+' => self.single(Token::Plus),
            '-' => self.single(Token::Minus),
            '*' => self.single(Token::Star),
            '%' => self.single(Token::Percent),
            '&' => self.single(Token::Amp),
            '?' => self.single(Token::Question),
            '=' => self.single(Token::Eq),
            '/' if self.after_operand => self.single(Token::Slash),
            '/' => self.read_regex()?,
            ':' if self.peek_char(1) == Some('=') => self.double(Token::Assign),
            ':' => self.single(Token::Colon),
            '~' if self.peek_char(1) == Some('>') => self.double(Token::Chain),
            '!' if self.peek_char(1) == Some('=') => self.double(Token::NotEq),
            '<' if self.peek_char(1) == Some('=') => self.double(Token::LtEq),
            '<' => self.single(Token::Lt),
            '>' if self.peek_char(1) == Some('=') => self.double(Token::GtEq),
            '>' => self.single(Token::Gt),
            '"' => Token::Str(self.read_string('"')?),
            '\'' => Token::Str(self.read_string('\'')?),
            '`' => Token::Name(self.read_backtick_name()?),
            c if c.is_ascii_digit() => self.read_number()?,
            c if c.is_alphabetic() || c == '_' => {
                let ident = self.read_identifier();
                match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "function" => Token::Function,
                    _ => Token::Name(ident),
                }
            }
            other => {
                return Err(format!(
                    "unexpected character '{other}' at position {}",
                    self.position
                ))
            }
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(input);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().unwrap();
            if token == Token::Eof {
                return out;
            }
            out.push(token);
        }
    }

    #[test]
    fn slash_after_operand_divides() {
        assert_eq!(
            tokens("a / 2"),
            vec![Token::Name("a".into()), Token::Slash, Token::Number(2.0)]
        );
    }

    #[test]
    fn slash_in_operand_position_opens_regex() {
        assert_eq!(
            tokens(r"$filter(services, /\/k8s-/i)"),
            vec![
                Token::Var("filter".into()),
                Token::LParen,
                Token::Name("services".into()),
                Token::Comma,
                Token::Regex {
                    pattern: "/k8s-".into(),
                    flags: "i".into()
                },
                Token::RParen,
            ]
        );
    }

    #[test]
    fn variables_and_operators() {
        assert_eq!(
            tokens("$$.a ~> $x != 1.5e2"),
            vec![
                Token::Var("$".into()),
                Token::Dot,
                Token::Name("a".into()),
                Token::Chain,
                Token::Var("x".into()),
                Token::NotEq,
                Token::Number(150.0),
            ]
        );
    }
}
