use crate::error::SyntaxError;

/// Token kinds for console script.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Function,
    If,
    Else,
    While,
    Do,
    For,
    Foreach,
    ForeachStr, // foreach$
    In,
    Switch,
    SwitchStr, // switch$
    Case,
    Or,
    Default,
    Break,
    Continue,
    Return,
    New,
    True,
    False,
    Spc,
    Tab,
    Nl,

    // Literals
    Int(u32),
    Float(f64),
    Str(String),
    TagStr(String),
    Ident(String),
    /// `%local` or `$global`, sigil included.
    Var(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    ShlEq,
    ShrEq,
    Eq,
    EqEq,
    NotEq,
    StrEq,    // $=
    StrNotEq, // !$=
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    At,
    Question,
    Colon,
    ColonColon,
    Dot,

    // Delimiters
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,

    // Special
    Eof,
}

/// A token with the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

impl Token {
    pub fn new(kind: TokenKind, line: u32) -> Self {
        Self { kind, line }
    }
}

/// The lexer for console script source.
pub struct Lexer<'a> {
    filename: &'a str,
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self {
            filename,
            source,
            chars: source.char_indices().peekable(),
            line: 1,
        }
    }

    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments()?;

            let line = self.line;
            let Some((_, ch)) = self.peek() else {
                tokens.push(Token::new(TokenKind::Eof, line));
                break;
            };

            let kind = match ch {
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '{' => self.single(TokenKind::LBrace),
                '}' => self.single(TokenKind::RBrace),
                '[' => self.single(TokenKind::LBracket),
                ']' => self.single(TokenKind::RBracket),
                ',' => self.single(TokenKind::Comma),
                ';' => self.single(TokenKind::Semi),
                '?' => self.single(TokenKind::Question),
                '@' => self.single(TokenKind::At),
                '~' => self.single(TokenKind::Tilde),
                '+' => {
                    self.advance();
                    if self.match_char('+') {
                        TokenKind::PlusPlus
                    } else if self.match_char('=') {
                        TokenKind::PlusEq
                    } else {
                        TokenKind::Plus
                    }
                }
                '-' => {
                    self.advance();
                    if self.match_char('-') {
                        TokenKind::MinusMinus
                    } else if self.match_char('=') {
                        TokenKind::MinusEq
                    } else {
                        TokenKind::Minus
                    }
                }
                '*' => self.with_assign(TokenKind::Star, TokenKind::StarEq),
                '/' => self.with_assign(TokenKind::Slash, TokenKind::SlashEq),
                '%' => {
                    if self.peek_second().is_some_and(is_ident_start) {
                        self.advance();
                        self.scan_variable('%')
                    } else {
                        self.with_assign(TokenKind::Percent, TokenKind::PercentEq)
                    }
                }
                '$' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::StrEq
                    } else if self.peek().is_some_and(|(_, c)| is_ident_start(c)) {
                        self.scan_variable('$')
                    } else {
                        return Err(self.error("expected a variable name after '$'"));
                    }
                }
                '^' => self.with_assign(TokenKind::Caret, TokenKind::CaretEq),
                '&' => {
                    self.advance();
                    if self.match_char('&') {
                        TokenKind::AndAnd
                    } else if self.match_char('=') {
                        TokenKind::AmpEq
                    } else {
                        TokenKind::Amp
                    }
                }
                '|' => {
                    self.advance();
                    if self.match_char('|') {
                        TokenKind::OrOr
                    } else if self.match_char('=') {
                        TokenKind::PipeEq
                    } else {
                        TokenKind::Pipe
                    }
                }
                '=' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::EqEq
                    } else {
                        TokenKind::Eq
                    }
                }
                '!' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::NotEq
                    } else if self.peek().map(|(_, c)| c) == Some('$')
                        && self.peek_second() == Some('=')
                    {
                        self.advance();
                        self.advance();
                        TokenKind::StrNotEq
                    } else {
                        TokenKind::Bang
                    }
                }
                '<' => {
                    self.advance();
                    if self.match_char('<') {
                        if self.match_char('=') {
                            TokenKind::ShlEq
                        } else {
                            TokenKind::Shl
                        }
                    } else if self.match_char('=') {
                        TokenKind::Le
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.advance();
                    if self.match_char('>') {
                        if self.match_char('=') {
                            TokenKind::ShrEq
                        } else {
                            TokenKind::Shr
                        }
                    } else if self.match_char('=') {
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }
                ':' => {
                    self.advance();
                    if self.match_char(':') {
                        TokenKind::ColonColon
                    } else {
                        TokenKind::Colon
                    }
                }
                '.' => {
                    if self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                        self.scan_number()?
                    } else {
                        self.single(TokenKind::Dot)
                    }
                }
                '"' => self.scan_string('"')?,
                '\'' => self.scan_string('\'')?,
                c if c.is_ascii_digit() => self.scan_number()?,
                c if is_ident_start(c) => self.scan_identifier(),
                _ => return Err(self.error(&format!("unexpected character '{}'", ch))),
            };

            tokens.push(Token::new(kind, line));
        }

        Ok(tokens)
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.chars.clone();
        chars.next();
        chars.next().map(|(_, c)| c)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((_, '\n')) = result {
            self.line += 1;
        }
        result
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek().map(|(_, c)| c) == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn with_assign(&mut self, plain: TokenKind, assign: TokenKind) -> TokenKind {
        self.advance();
        if self.match_char('=') { assign } else { plain }
    }

    fn offset(&mut self) -> usize {
        self.peek().map(|(i, _)| i).unwrap_or(self.source.len())
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.peek() {
                Some((_, c)) if c.is_whitespace() => {
                    self.advance();
                }
                Some((_, '/')) => match self.peek_second() {
                    Some('/') => {
                        while let Some((_, ch)) = self.peek() {
                            if ch == '\n' {
                                break;
                            }
                            self.advance();
                        }
                    }
                    Some('*') => {
                        self.advance();
                        self.advance();
                        loop {
                            match self.advance() {
                                None => return Err(self.error("unterminated block comment")),
                                Some((_, '*')) if self.match_char('/') => break,
                                Some(_) => {}
                            }
                        }
                    }
                    _ => return Ok(()),
                },
                _ => return Ok(()),
            }
        }
    }

    fn scan_number(&mut self) -> Result<TokenKind, SyntaxError> {
        let start = self.offset();

        if self.peek().map(|(_, c)| c) == Some('0')
            && matches!(self.peek_second(), Some('x') | Some('X'))
        {
            self.advance();
            self.advance();
            let digits_start = self.offset();
            while self.peek().is_some_and(|(_, c)| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let end = self.offset();
            let digits = &self.source[digits_start..end];
            let value = u32::from_str_radix(digits, 16)
                .map_err(|_| self.error(&format!("invalid hex number '0x{}'", digits)))?;
            return Ok(TokenKind::Int(value));
        }

        let mut is_float = false;
        while self.peek().is_some_and(|(_, c)| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek().map(|(_, c)| c) == Some('.')
            && self.peek_second().is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|(_, c)| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some((_, 'e' | 'E'))) {
            let mut look = self.chars.clone();
            look.next();
            let mut next = look.next().map(|(_, c)| c);
            if matches!(next, Some('+' | '-')) {
                next = look.next().map(|(_, c)| c);
            }
            if next.is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.advance();
                if matches!(self.peek(), Some((_, '+' | '-'))) {
                    self.advance();
                }
                while self.peek().is_some_and(|(_, c)| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        let end = self.offset();
        let text = &self.source[start..end];
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(&format!("invalid float '{}'", text)))?;
            Ok(TokenKind::Float(value))
        } else {
            // Integers that overflow 32 bits are kept as floats.
            match text.parse::<u32>() {
                Ok(value) => Ok(TokenKind::Int(value)),
                Err(_) => text
                    .parse::<f64>()
                    .map(TokenKind::Float)
                    .map_err(|_| self.error(&format!("invalid number '{}'", text))),
            }
        }
    }

    fn scan_string(&mut self, quote: char) -> Result<TokenKind, SyntaxError> {
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.advance() {
                None => return Err(self.error("unterminated string")),
                Some((_, '\n')) => return Err(self.error("newline in string constant")),
                Some((_, c)) if c == quote => break,
                Some((_, '\\')) => {
                    let Some((_, esc)) = self.advance() else {
                        return Err(self.error("unterminated string"));
                    };
                    match esc {
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        '\'' => value.push('\''),
                        'x' => {
                            let start = self.offset();
                            for _ in 0..2 {
                                if self.peek().is_some_and(|(_, c)| c.is_ascii_hexdigit()) {
                                    self.advance();
                                }
                            }
                            let end = self.offset();
                            let digits = &self.source[start..end];
                            let byte = u8::from_str_radix(digits, 16)
                                .map_err(|_| self.error("invalid \\x escape"))?;
                            value.push(byte as char);
                        }
                        other => {
                            return Err(
                                self.error(&format!("invalid escape sequence '\\{}'", other))
                            );
                        }
                    }
                }
                Some((_, c)) => value.push(c),
            }
        }

        Ok(if quote == '\'' {
            TokenKind::TagStr(value)
        } else {
            TokenKind::Str(value)
        })
    }

    /// Scan the name after a `%` or `$` sigil. Global names may contain `::`.
    fn scan_variable(&mut self, sigil: char) -> TokenKind {
        let mut name = String::new();
        name.push(sigil);
        loop {
            while let Some((_, c)) = self.peek() {
                if is_ident_char(c) {
                    name.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            let continues = self.peek().map(|(_, c)| c) == Some(':')
                && self.peek_second() == Some(':')
                && {
                    let mut look = self.chars.clone();
                    look.next();
                    look.next();
                    look.next().is_some_and(|(_, c)| is_ident_start(c))
                };
            if !continues {
                break;
            }
            self.advance();
            self.advance();
            name.push_str("::");
        }
        TokenKind::Var(name)
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.offset();
        while self.peek().is_some_and(|(_, c)| is_ident_char(c)) {
            self.advance();
        }
        let end = self.offset();
        let source = self.source;
        let ident = &source[start..end];

        match ident {
            "function" => TokenKind::Function,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "for" => TokenKind::For,
            "foreach" => {
                if self.match_char('$') {
                    TokenKind::ForeachStr
                } else {
                    TokenKind::Foreach
                }
            }
            "in" => TokenKind::In,
            "switch" => {
                if self.match_char('$') {
                    TokenKind::SwitchStr
                } else {
                    TokenKind::Switch
                }
            }
            "case" => TokenKind::Case,
            "or" => TokenKind::Or,
            "default" => TokenKind::Default,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "new" => TokenKind::New,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "SPC" => TokenKind::Spc,
            "TAB" => TokenKind::Tab,
            "NL" => TokenKind::Nl,
            _ => TokenKind::Ident(ident.to_string()),
        }
    }

    fn error(&self, message: &str) -> SyntaxError {
        SyntaxError {
            file: self.filename.to_string(),
            line: self.line,
            message: message.to_string(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new("test.cs", source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_variables_and_operators() {
        assert_eq!(
            kinds("%a = $Pref::Video::x % 3;"),
            vec![
                TokenKind::Var("%a".into()),
                TokenKind::Eq,
                TokenKind::Var("$Pref::Video::x".into()),
                TokenKind::Percent,
                TokenKind::Int(3),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_comparison_operators() {
        assert_eq!(
            kinds("%a $= \"x\" !$= %b"),
            vec![
                TokenKind::Var("%a".into()),
                TokenKind::StrEq,
                TokenKind::Str("x".into()),
                TokenKind::StrNotEq,
                TokenKind::Var("%b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("12 0x1F 1.5 .25 2e3"),
            vec![
                TokenKind::Int(12),
                TokenKind::Int(31),
                TokenKind::Float(1.5),
                TokenKind::Float(0.25),
                TokenKind::Float(2000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            kinds(r#""a\tb\x41" 'tag'"#),
            vec![
                TokenKind::Str("a\tbA".into()),
                TokenKind::TagStr("tag".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_suffixes() {
        assert_eq!(
            kinds("foreach$ switch$ SPC Parent::x"),
            vec![
                TokenKind::ForeachStr,
                TokenKind::SwitchStr,
                TokenKind::Spc,
                TokenKind::Ident("Parent".into()),
                TokenKind::ColonColon,
                TokenKind::Ident("x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let tokens = Lexer::new("test.cs", "// one\n/* two\nthree */ x\n").scan_tokens().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Ident("x".into()));
        assert_eq!(tokens[0].line, 3);
    }

    #[test]
    fn test_unterminated_string_reports_line() {
        let err = Lexer::new("test.cs", "\n\"abc").scan_tokens().unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.file, "test.cs");
    }

    #[test]
    fn test_modulo_before_number() {
        assert_eq!(
            kinds("7%2"),
            vec![
                TokenKind::Int(7),
                TokenKind::Percent,
                TokenKind::Int(2),
                TokenKind::Eof
            ]
        );
    }
}
