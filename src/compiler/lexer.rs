/// Token kinds for the CyberBasic dialect.
///
/// Keywords are case-insensitive. Newlines are significant and come through
/// as `Newline` tokens; `:` both separates statements and introduces enum
/// member lists and dict values.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Var,
    Let,
    Dim,
    As,
    If,
    Then,
    Else,
    ElseIf,
    EndIf,
    For,
    To,
    Step,
    Next,
    While,
    Wend,
    Repeat,
    Until,
    Select,
    Case,
    Function,
    Sub,
    End,
    Return,
    Module,
    Type,
    Entity,
    Const,
    Enum,
    On,
    StartCoroutine,
    Yield,
    WaitSeconds,
    Exit,
    Continue,
    Assert,
    Print,
    And,
    Or,
    Xor,
    Not,
    Mod,
    True,
    False,
    Nil,

    // Literals
    /// Numeric literal text, kept verbatim
    Number(String),
    Str(String),
    Ident(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Backslash, // integer division
    Caret,
    Percent,
    Eq,
    EqEq,
    NotEq, // <> or !=
    Lt,
    Le,
    Gt,
    Ge,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,

    // Special
    Newline,
    Eof,
}

/// Source location information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// A token with its kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// The lexer for CyberBasic source code.
pub struct Lexer<'a> {
    filename: &'a str,
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self {
            filename,
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
        }
    }

    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, String> {
        let mut tokens: Vec<Token> = Vec::new();

        loop {
            self.skip_whitespace_and_comments();

            let span = Span::new(self.line, self.column);

            let Some((_, ch)) = self.peek() else {
                tokens.push(Token::new(TokenKind::Eof, span));
                break;
            };

            let kind = match ch {
                '\n' => {
                    self.advance();
                    // Collapse blank lines into one separator
                    if matches!(tokens.last(), Some(t) if t.kind == TokenKind::Newline) {
                        continue;
                    }
                    TokenKind::Newline
                }
                '(' => {
                    self.advance();
                    TokenKind::LParen
                }
                ')' => {
                    self.advance();
                    TokenKind::RParen
                }
                '[' => {
                    self.advance();
                    TokenKind::LBracket
                }
                ']' => {
                    self.advance();
                    TokenKind::RBracket
                }
                '{' => {
                    self.advance();
                    TokenKind::LBrace
                }
                '}' => {
                    self.advance();
                    TokenKind::RBrace
                }
                ',' => {
                    self.advance();
                    TokenKind::Comma
                }
                ':' => {
                    self.advance();
                    TokenKind::Colon
                }
                '.' => {
                    if self.next_is_digit() {
                        self.scan_number()
                    } else {
                        self.advance();
                        TokenKind::Dot
                    }
                }
                '+' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::PlusEq
                    } else {
                        TokenKind::Plus
                    }
                }
                '-' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::MinusEq
                    } else {
                        TokenKind::Minus
                    }
                }
                '*' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::StarEq
                    } else {
                        TokenKind::Star
                    }
                }
                '/' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::SlashEq
                    } else {
                        TokenKind::Slash
                    }
                }
                '\\' => {
                    self.advance();
                    TokenKind::Backslash
                }
                '^' => {
                    self.advance();
                    TokenKind::Caret
                }
                '%' => {
                    self.advance();
                    TokenKind::Percent
                }
                '!' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::NotEq
                    } else {
                        return Err(self.error("expected '!='"));
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
                '<' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::Le
                    } else if self.match_char('>') {
                        TokenKind::NotEq
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }
                '"' => self.scan_string()?,
                '0'..='9' => self.scan_number(),
                'a'..='z' | 'A'..='Z' | '_' => match self.scan_identifier() {
                    Some(kind) => kind,
                    // REM comment: the rest of the line is already consumed
                    None => continue,
                },
                _ => return Err(self.error(&format!("unexpected character '{}'", ch))),
            };

            tokens.push(Token::new(kind, span));
        }

        Ok(tokens)
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.chars.peek().copied()
    }

    fn offset(&mut self) -> usize {
        self.peek().map(|(i, _)| i).unwrap_or(self.source.len())
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((_, ch)) = result {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
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

    /// Whether the character after the current one is an ASCII digit.
    fn next_is_digit(&self) -> bool {
        let mut chars = self.chars.clone();
        chars.next();
        matches!(chars.peek(), Some((_, c)) if c.is_ascii_digit())
    }

    fn skip_to_end_of_line(&mut self) {
        while let Some((_, ch)) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some((_, ' ' | '\t' | '\r')) => {
                    self.advance();
                }
                Some((_, '\'')) => self.skip_to_end_of_line(),
                // Line continuation
                Some((_, '_')) if self.continuation_follows() => {
                    self.skip_to_end_of_line();
                    self.advance();
                }
                _ => break,
            }
        }
    }

    /// `_` followed only by blanks up to the end of the line.
    fn continuation_follows(&self) -> bool {
        let mut chars = self.chars.clone();
        chars.next();
        for (_, ch) in chars {
            match ch {
                ' ' | '\t' | '\r' => continue,
                '\n' => return true,
                _ => return false,
            }
        }
        false
    }

    fn scan_number(&mut self) -> TokenKind {
        let start = self.offset();

        while let Some((_, ch)) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else {
                break;
            }
        }

        if let Some((_, '.')) = self.peek()
            && self.next_is_digit()
        {
            self.advance(); // consume '.'
            while let Some((_, ch)) = self.peek() {
                if ch.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let end = self.offset();
        TokenKind::Number(self.source[start..end].to_string())
    }

    fn scan_string(&mut self) -> Result<TokenKind, String> {
        self.advance(); // consume opening quote

        let mut value = String::new();

        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some((_, '"')) => {
                    self.advance();
                    break;
                }
                Some((_, '\\')) => {
                    self.advance();
                    match self.peek() {
                        Some((_, 'n')) => {
                            self.advance();
                            value.push('\n');
                        }
                        Some((_, 't')) => {
                            self.advance();
                            value.push('\t');
                        }
                        Some((_, '\\')) => {
                            self.advance();
                            value.push('\\');
                        }
                        Some((_, '"')) => {
                            self.advance();
                            value.push('"');
                        }
                        Some((_, ch)) => {
                            return Err(self.error(&format!("invalid escape sequence '\\{}'", ch)));
                        }
                        None => return Err(self.error("unterminated string")),
                    }
                }
                Some((_, '\n')) => {
                    return Err(self.error("unterminated string (newline in string)"));
                }
                Some((_, ch)) => {
                    self.advance();
                    value.push(ch);
                }
            }
        }

        Ok(TokenKind::Str(value))
    }

    /// Scan an identifier or keyword. Returns None for a `REM` comment.
    fn scan_identifier(&mut self) -> Option<TokenKind> {
        let start = self.offset();

        while let Some((_, ch)) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        // String-returning builtins keep their `$` suffix: LEFT$, MID$
        self.match_char('$');

        let end = self.offset();
        let ident = &self.source[start..end];

        let kind = match ident.to_ascii_uppercase().as_str() {
            "REM" => {
                self.skip_to_end_of_line();
                return None;
            }
            "VAR" => TokenKind::Var,
            "LET" => TokenKind::Let,
            "DIM" => TokenKind::Dim,
            "AS" => TokenKind::As,
            "IF" => TokenKind::If,
            "THEN" => TokenKind::Then,
            "ELSE" => TokenKind::Else,
            "ELSEIF" => TokenKind::ElseIf,
            "ENDIF" => TokenKind::EndIf,
            "FOR" => TokenKind::For,
            "TO" => TokenKind::To,
            "STEP" => TokenKind::Step,
            "NEXT" => TokenKind::Next,
            "WHILE" => TokenKind::While,
            "WEND" => TokenKind::Wend,
            "REPEAT" => TokenKind::Repeat,
            "UNTIL" => TokenKind::Until,
            "SELECT" => TokenKind::Select,
            "CASE" => TokenKind::Case,
            "FUNCTION" => TokenKind::Function,
            "SUB" => TokenKind::Sub,
            "END" => TokenKind::End,
            "RETURN" => TokenKind::Return,
            "MODULE" => TokenKind::Module,
            "TYPE" => TokenKind::Type,
            "ENTITY" => TokenKind::Entity,
            "CONST" => TokenKind::Const,
            "ENUM" => TokenKind::Enum,
            "ON" => TokenKind::On,
            "STARTCOROUTINE" => TokenKind::StartCoroutine,
            "YIELD" => TokenKind::Yield,
            "WAITSECONDS" => TokenKind::WaitSeconds,
            "EXIT" => TokenKind::Exit,
            "CONTINUE" => TokenKind::Continue,
            "ASSERT" => TokenKind::Assert,
            "PRINT" => TokenKind::Print,
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "XOR" => TokenKind::Xor,
            "NOT" => TokenKind::Not,
            "MOD" => TokenKind::Mod,
            "TRUE" => TokenKind::True,
            "FALSE" => TokenKind::False,
            "NIL" | "NULL" => TokenKind::Nil,
            _ => TokenKind::Ident(ident.to_string()),
        };
        Some(kind)
    }

    fn error(&self, message: &str) -> String {
        format!(
            "error: {}\n  --> {}:{}:{}",
            message, self.filename, self.line, self.column
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new("test.bas", source);
        lexer
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_tokens() {
        assert_eq!(
            kinds("VAR x = 42"),
            vec![
                TokenKind::Var,
                TokenKind::Ident("x".to_string()),
                TokenKind::Eq,
                TokenKind::Number("42".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            kinds("while Wend EndIf"),
            vec![
                TokenKind::While,
                TokenKind::Wend,
                TokenKind::EndIf,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        let expected = vec![
            TokenKind::Plus,
            TokenKind::Minus,
            TokenKind::Star,
            TokenKind::Slash,
            TokenKind::Backslash,
            TokenKind::Caret,
            TokenKind::Percent,
            TokenKind::EqEq,
            TokenKind::NotEq,
            TokenKind::NotEq,
            TokenKind::Lt,
            TokenKind::Le,
            TokenKind::Gt,
            TokenKind::Ge,
            TokenKind::PlusEq,
            TokenKind::MinusEq,
            TokenKind::StarEq,
            TokenKind::SlashEq,
            TokenKind::Eof,
        ];
        assert_eq!(kinds("+ - * / \\ ^ % == <> != < <= > >= += -= *= /="), expected);
    }

    #[test]
    fn test_number_text_kept_verbatim() {
        assert_eq!(
            kinds("1.50 .5 007"),
            vec![
                TokenKind::Number("1.50".to_string()),
                TokenKind::Number(".5".to_string()),
                TokenKind::Number("007".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_newlines() {
        let tokens = kinds("x = 1 ' trailing\n\n\nREM whole line\nrem\ny");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("x".to_string()),
                TokenKind::Eq,
                TokenKind::Number("1".to_string()),
                TokenKind::Newline,
                TokenKind::Ident("y".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_rem_prefix_is_identifier() {
        assert_eq!(
            kinds("remaining"),
            vec![TokenKind::Ident("remaining".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_dollar_suffix() {
        assert_eq!(
            kinds("Left$(s, 2)")[0],
            TokenKind::Ident("Left$".to_string())
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n""#)[0],
            TokenKind::Str("a\"b\n".to_string())
        );
    }

    #[test]
    fn test_line_continuation() {
        assert_eq!(
            kinds("x = 1 + _\n 2"),
            vec![
                TokenKind::Ident("x".to_string()),
                TokenKind::Eq,
                TokenKind::Number("1".to_string()),
                TokenKind::Plus,
                TokenKind::Number("2".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_spans() {
        let mut lexer = Lexer::new("test.bas", "a\n  b");
        let tokens = lexer.scan_tokens().unwrap();
        assert_eq!(tokens[0].span, Span::new(1, 1));
        assert_eq!(tokens[2].span, Span::new(2, 3));
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("test.bas", "\"abc");
        let err = lexer.scan_tokens().unwrap_err();
        assert!(err.contains("unterminated string"));
        assert!(err.contains("test.bas:1:5"));
    }
}
