//! Tokenizer for the manifest language.
//!
//! [`Lexer`] is a lazy iterator of tokens. Double-quoted strings with
//! interpolation are handled with a mode stack: the string body is scanned in
//! string mode, and `${ … }` switches back to code mode until the matching
//! brace. Open delimiters are tracked so a mismatched closer is reported at the
//! point it occurs.

use super::error::{Error, Result};
use super::types::Location;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, LazyLock};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:::)?[a-z_](?:[-\w]*\w)?(?:::[a-z_](?:[-\w]*\w)?)*").expect("name pattern")
});
static CLASSREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:::)?[A-Z](?:[-\w]*\w)?(?:::[A-Z](?:[-\w]*\w)?)*").expect("classref pattern")
});
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:0[xX][0-9A-Fa-f]+|\d+(?:\.\d+)?(?:[eE]-?\d+)?)").expect("number pattern")
});
static VARNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:::)?(?:\w+::)*\w+").expect("variable pattern"));
static REGEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/((?:\\.|[^/\\\n])*)/").expect("regex literal pattern"));

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBrack,
    RBrack,
    Comma,
    Colon,
    Semic,
    Equals,
    AppendEquals,
    IsEqual,
    NotEqual,
    Match,
    NoMatch,
    Not,
    LessThan,
    GreaterThan,
    LessEqual,
    GreaterEqual,
    InEdge,
    InEdgeSub,
    OutEdge,
    OutEdgeSub,
    FatArrow,
    PlusArrow,
    Plus,
    Minus,
    Times,
    Div,
    QMark,
    LCollect,
    RCollect,
    LLCollect,
    RRCollect,
    At,
    AtAt,
    Dot,
    And,
    Or,
    In,
    Case,
    Class,
    Default,
    Define,
    Else,
    Elsif,
    False,
    If,
    Import,
    Inherits,
    Node,
    True,
    Undef,
    Unless,
    Name(String),
    ClassRef(String),
    Variable(String),
    Number(i64),
    Float(f64),
    Str(String),
    DqPre(String),
    DqMid(String),
    DqPost(String),
    Regex(String),
}

const OPERATORS: &[(&str, TokenKind)] = &[
    ("<<|", TokenKind::LLCollect),
    ("|>>", TokenKind::RRCollect),
    ("<|", TokenKind::LCollect),
    ("|>", TokenKind::RCollect),
    ("+=", TokenKind::AppendEquals),
    ("==", TokenKind::IsEqual),
    ("!=", TokenKind::NotEqual),
    ("=~", TokenKind::Match),
    ("!~", TokenKind::NoMatch),
    ("<=", TokenKind::LessEqual),
    (">=", TokenKind::GreaterEqual),
    ("->", TokenKind::InEdge),
    ("~>", TokenKind::InEdgeSub),
    ("<-", TokenKind::OutEdge),
    ("<~", TokenKind::OutEdgeSub),
    ("=>", TokenKind::FatArrow),
    ("+>", TokenKind::PlusArrow),
    ("@@", TokenKind::AtAt),
    ("{", TokenKind::LBrace),
    ("}", TokenKind::RBrace),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("[", TokenKind::LBrack),
    ("]", TokenKind::RBrack),
    (",", TokenKind::Comma),
    (":", TokenKind::Colon),
    (";", TokenKind::Semic),
    ("=", TokenKind::Equals),
    ("!", TokenKind::Not),
    ("<", TokenKind::LessThan),
    (">", TokenKind::GreaterThan),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Times),
    ("/", TokenKind::Div),
    ("?", TokenKind::QMark),
    ("@", TokenKind::At),
    (".", TokenKind::Dot),
];

fn keyword(name: &str) -> Option<TokenKind> {
    Some(match name {
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "in" => TokenKind::In,
        "case" => TokenKind::Case,
        "class" => TokenKind::Class,
        "default" => TokenKind::Default,
        "define" => TokenKind::Define,
        "else" => TokenKind::Else,
        "elsif" => TokenKind::Elsif,
        "false" => TokenKind::False,
        "if" => TokenKind::If,
        "import" => TokenKind::Import,
        "inherits" => TokenKind::Inherits,
        "node" => TokenKind::Node,
        "true" => TokenKind::True,
        "undef" => TokenKind::Undef,
        "unless" => TokenKind::Unless,
        _ => return None,
    })
}

impl TokenKind {
    /// Source text of keywords, used where a keyword may stand in for a name.
    pub fn keyword_text(&self) -> Option<&'static str> {
        Some(match self {
            Self::And => "and",
            Self::Or => "or",
            Self::In => "in",
            Self::Case => "case",
            Self::Class => "class",
            Self::Default => "default",
            Self::Define => "define",
            Self::Else => "else",
            Self::Elsif => "elsif",
            Self::False => "false",
            Self::If => "if",
            Self::Import => "import",
            Self::Inherits => "inherits",
            Self::Node => "node",
            Self::True => "true",
            Self::Undef => "undef",
            Self::Unless => "unless",
            _ => return None,
        })
    }

    fn operator_text(&self) -> Option<&'static str> {
        OPERATORS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(text, _)| *text)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(op) = self.operator_text() {
            return write!(f, "'{}'", op);
        }
        if let Some(kw) = self.keyword_text() {
            return write!(f, "keyword '{}'", kw);
        }
        match self {
            Self::Name(n) => write!(f, "name '{}'", n),
            Self::ClassRef(n) => write!(f, "type reference '{}'", n),
            Self::Variable(n) => write!(f, "variable '${}'", n),
            Self::Number(n) => write!(f, "number {}", n),
            Self::Float(x) => write!(f, "number {}", x),
            Self::Str(_) | Self::DqPre(_) | Self::DqMid(_) | Self::DqPost(_) => write!(f, "string"),
            Self::Regex(r) => write!(f, "regex /{}/", r),
            _ => write!(f, "{:?}", self),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub file: Option<Arc<str>>,
    pub doc: Option<String>,
}

impl Token {
    pub fn location(&self) -> Location {
        Location::new(self.file.clone(), self.line)
    }
}

/// Options controlling tokenization and parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Attach preceding comment blocks to tokens (and from there to definitions).
    pub doc_comments: bool,
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Dq { started: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delim {
    Brace,
    Paren,
    Brack,
    Collect,
    ExportCollect,
    Interp,
}

impl Delim {
    fn closer(self) -> &'static str {
        match self {
            Self::Brace | Self::Interp => "}",
            Self::Paren => ")",
            Self::Brack => "]",
            Self::Collect => "|>",
            Self::ExportCollect => "|>>",
        }
    }
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    file: Option<Arc<str>>,
    options: ParserOptions,
    modes: Vec<Mode>,
    delims: Vec<(Delim, u32)>,
    pending: VecDeque<Token>,
    prev: Option<TokenKind>,
    doc: Vec<String>,
    interp_start: bool,
    done: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, file: Option<Arc<str>>, options: ParserOptions) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            file,
            options,
            modes: vec![Mode::Code],
            delims: Vec::new(),
            pending: VecDeque::new(),
            prev: None,
            doc: Vec::new(),
            interp_start: false,
            done: false,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump_char(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn bump_bytes(&mut self, len: usize) {
        let consumed = &self.src[self.pos..self.pos + len];
        self.line += consumed.matches('\n').count() as u32;
        self.pos += len;
    }

    fn loc_at(&self, line: u32) -> Location {
        Location::new(self.file.clone(), line)
    }

    fn lex_error(&self, message: impl Into<String>, line: u32) -> Error {
        Error::Lex {
            message: message.into(),
            loc: self.loc_at(line),
        }
    }

    fn token(&mut self, kind: TokenKind, line: u32) -> Token {
        let doc = if self.doc.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.doc).join("\n"))
        };
        Token {
            kind,
            line,
            file: self.file.clone(),
            doc,
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump_char();
                }
                Some('#') => {
                    let end = self.rest().find('\n').unwrap_or(self.rest().len());
                    let text = self.rest()[1..end].trim().to_string();
                    self.bump_bytes(end);
                    if self.options.doc_comments {
                        self.doc.push(text);
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let line = self.line;
                    let Some(end) = self.rest()[2..].find("*/") else {
                        return Err(self.lex_error("unterminated block comment", line));
                    };
                    let text = self.rest()[2..end + 2].trim().to_string();
                    self.bump_bytes(end + 4);
                    if self.options.doc_comments {
                        self.doc.push(text);
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn regex_allowed(&self) -> bool {
        matches!(
            self.prev,
            Some(
                TokenKind::Node
                    | TokenKind::LBrace
                    | TokenKind::RBrace
                    | TokenKind::Match
                    | TokenKind::NoMatch
                    | TokenKind::Comma
                    | TokenKind::LParen
            )
        )
    }

    fn close(&mut self, want: Delim, got: &str, line: u32) -> Result<()> {
        match self.delims.last() {
            Some((top, _)) if *top == want => {
                self.delims.pop();
                Ok(())
            }
            Some((top, _)) => Err(Error::Syntax {
                message: format!("unexpected '{}'", got),
                expected: Some(format!("'{}'", top.closer())),
                loc: self.loc_at(line),
            }),
            None => Err(Error::Syntax {
                message: format!("unexpected '{}'", got),
                expected: None,
                loc: self.loc_at(line),
            }),
        }
    }

    fn scan_code(&mut self) -> Result<Option<Token>> {
        self.skip_trivia()?;
        let interp_start = std::mem::take(&mut self.interp_start);
        let line = self.line;
        let Some(c) = self.peek_char() else {
            if let Some((delim, opened)) = self.delims.last() {
                return Err(Error::Syntax {
                    message: format!("unexpected end of input; delimiter opened at line {} is not closed", opened),
                    expected: Some(format!("'{}'", delim.closer())),
                    loc: self.loc_at(line),
                });
            }
            return Ok(None);
        };

        if c == '}' && matches!(self.delims.last(), Some((Delim::Interp, _))) {
            self.bump_char();
            self.delims.pop();
            self.modes.pop();
            return self.scan_string_segment();
        }

        match c {
            '"' => {
                self.bump_char();
                self.modes.push(Mode::Dq { started: false });
                return self.scan_string_segment();
            }
            '\'' => return self.scan_single_quoted().map(Some),
            '$' => {
                let Some(m) = VARNAME_RE.find(&self.rest()[1..]) else {
                    return Err(self.lex_error("'$' must be followed by a variable name", line));
                };
                let name = m.as_str().to_string();
                self.bump_bytes(1 + m.end());
                return Ok(Some(self.token(TokenKind::Variable(name), line)));
            }
            '/' if self.regex_allowed() => {
                if let Some(caps) = REGEX_RE.captures(self.rest()) {
                    let source = caps[1].replace("\\/", "/");
                    let len = caps[0].len();
                    self.bump_bytes(len);
                    return Ok(Some(self.token(TokenKind::Regex(source), line)));
                }
            }
            _ => {}
        }

        if c.is_ascii_digit() {
            return self.scan_number(line).map(Some);
        }

        let name_len = NAME_RE.find(self.rest()).map_or(0, |m| m.end());
        let class_len = CLASSREF_RE.find(self.rest()).map_or(0, |m| m.end());
        if name_len > 0 || class_len > 0 {
            let (len, is_name) = if name_len >= class_len {
                (name_len, true)
            } else {
                (class_len, false)
            };
            let text = self.rest()[..len].to_string();
            self.bump_bytes(len);
            let kind = if interp_start && is_name {
                TokenKind::Variable(text)
            } else if is_name {
                keyword(&text).unwrap_or(TokenKind::Name(text))
            } else {
                TokenKind::ClassRef(text)
            };
            return Ok(Some(self.token(kind, line)));
        }

        for (text, kind) in OPERATORS {
            if self.rest().starts_with(text) {
                self.bump_bytes(text.len());
                match kind {
                    TokenKind::LBrace => self.delims.push((Delim::Brace, line)),
                    TokenKind::LParen => self.delims.push((Delim::Paren, line)),
                    TokenKind::LBrack => self.delims.push((Delim::Brack, line)),
                    TokenKind::LCollect => self.delims.push((Delim::Collect, line)),
                    TokenKind::LLCollect => self.delims.push((Delim::ExportCollect, line)),
                    TokenKind::RBrace => self.close(Delim::Brace, text, line)?,
                    TokenKind::RParen => self.close(Delim::Paren, text, line)?,
                    TokenKind::RBrack => self.close(Delim::Brack, text, line)?,
                    TokenKind::RCollect => self.close(Delim::Collect, text, line)?,
                    TokenKind::RRCollect => self.close(Delim::ExportCollect, text, line)?,
                    _ => {}
                }
                return Ok(Some(self.token(kind.clone(), line)));
            }
        }

        Err(self.lex_error(format!("illegal character '{}'", c), line))
    }

    fn scan_number(&mut self, line: u32) -> Result<Token> {
        let Some(m) = NUMBER_RE.find(self.rest()) else {
            return Err(self.lex_error("malformed number", line));
        };
        let text = m.as_str().to_string();
        if self.rest()[m.end()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            return Err(self.lex_error(format!("illegal number '{}'", text), line));
        }
        self.bump_bytes(text.len());
        let bad = |lexer: &Self| lexer.lex_error(format!("illegal number '{}'", text), line);
        let kind = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            TokenKind::Number(i64::from_str_radix(hex, 16).map_err(|_| bad(self))?)
        } else if text.contains(['.', 'e', 'E']) {
            TokenKind::Float(text.parse().map_err(|_| bad(self))?)
        } else if text.len() > 1 && text.starts_with('0') {
            TokenKind::Number(i64::from_str_radix(&text[1..], 8).map_err(|_| bad(self))?)
        } else {
            TokenKind::Number(text.parse().map_err(|_| bad(self))?)
        };
        Ok(self.token(kind, line))
    }

    fn scan_single_quoted(&mut self) -> Result<Token> {
        let line = self.line;
        self.bump_char();
        let mut text = String::new();
        loop {
            match self.bump_char() {
                None => return Err(self.lex_error("unterminated string", line)),
                Some('\'') => break,
                Some('\\') => match self.peek_char() {
                    Some(c @ ('\'' | '\\')) => {
                        self.bump_char();
                        text.push(c);
                    }
                    _ => text.push('\\'),
                },
                Some(c) => text.push(c),
            }
        }
        Ok(self.token(TokenKind::Str(text), line))
    }

    /// Emit the segment before an interpolation and mark the string started.
    fn segment_kind(&mut self, text: String) -> TokenKind {
        match self.modes.last_mut() {
            Some(Mode::Dq { started }) if *started => TokenKind::DqMid(text),
            Some(Mode::Dq { started }) => {
                *started = true;
                TokenKind::DqPre(text)
            }
            _ => TokenKind::DqPre(text),
        }
    }

    fn scan_string_segment(&mut self) -> Result<Option<Token>> {
        let line = self.line;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                return Err(self.lex_error("unterminated string", line));
            };
            match c {
                '"' => {
                    self.bump_char();
                    let started = matches!(self.modes.pop(), Some(Mode::Dq { started: true }));
                    let kind = if started {
                        TokenKind::DqPost(text)
                    } else {
                        TokenKind::Str(text)
                    };
                    return Ok(Some(self.token(kind, line)));
                }
                '\\' => {
                    self.bump_char();
                    match self.bump_char() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some(e @ ('"' | '\\' | '$')) => text.push(e),
                        Some(other) => {
                            text.push('\\');
                            text.push(other);
                        }
                        None => return Err(self.lex_error("unterminated string", line)),
                    }
                }
                '$' if self.peek_second() == Some('{') => {
                    self.bump_bytes(2);
                    let kind = self.segment_kind(text);
                    let tok = self.token(kind, line);
                    self.delims.push((Delim::Interp, self.line));
                    self.modes.push(Mode::Code);
                    self.interp_start = true;
                    return Ok(Some(tok));
                }
                '$' => match VARNAME_RE.find(&self.rest()[1..]) {
                    Some(m) => {
                        let name = m.as_str().to_string();
                        let kind = self.segment_kind(text);
                        let tok = self.token(kind, line);
                        self.bump_bytes(1 + m.end());
                        let var = self.token(TokenKind::Variable(name), self.line);
                        self.pending.push_back(var);
                        return Ok(Some(tok));
                    }
                    None => {
                        self.bump_char();
                        text.push('$');
                    }
                },
                _ => {
                    self.bump_char();
                    text.push(c);
                }
            }
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(tok) = self.pending.pop_front() {
            self.prev = Some(tok.kind.clone());
            return Some(Ok(tok));
        }
        if self.done {
            return None;
        }
        let scanned = match self.modes.last() {
            Some(Mode::Dq { .. }) => self.scan_string_segment(),
            _ => self.scan_code(),
        };
        match scanned {
            Ok(Some(tok)) => {
                self.prev = Some(tok.kind.clone());
                Some(Ok(tok))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Tokenize a whole source string.
pub fn tokenize(src: &str, file: Option<Arc<str>>, options: ParserOptions) -> Result<Vec<Token>> {
    Lexer::new(src, file, options).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src, None, ParserOptions::default())
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_lexer_retokenize_identical() {
        let src = "class a { file { \"/tmp/${x}\": ensure => present } }";
        let first = tokenize(src, Some(Arc::from("a.pp")), ParserOptions::default()).unwrap();
        let second = tokenize(src, Some(Arc::from("a.pp")), ParserOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_lexer_keywords_and_names() {
        assert_eq!(
            kinds("class foo::bar inherits base"),
            vec![
                TokenKind::Class,
                TokenKind::Name("foo::bar".into()),
                TokenKind::Inherits,
                TokenKind::Name("base".into()),
            ]
        );
        assert_eq!(
            kinds("File Apache::Vhost"),
            vec![
                TokenKind::ClassRef("File".into()),
                TokenKind::ClassRef("Apache::Vhost".into())
            ]
        );
    }

    #[test]
    fn test_lexer_operators_longest_match() {
        assert_eq!(
            kinds("File <<| |>> -> <| |> +> => += == =~"),
            vec![
                TokenKind::ClassRef("File".into()),
                TokenKind::LLCollect,
                TokenKind::RRCollect,
                TokenKind::InEdge,
                TokenKind::LCollect,
                TokenKind::RCollect,
                TokenKind::PlusArrow,
                TokenKind::FatArrow,
                TokenKind::AppendEquals,
                TokenKind::IsEqual,
                TokenKind::Match,
            ]
        );
    }

    #[test]
    fn test_lexer_numbers() {
        assert_eq!(
            kinds("42 0x1F 010 1.5"),
            vec![
                TokenKind::Number(42),
                TokenKind::Number(31),
                TokenKind::Number(8),
                TokenKind::Float(1.5),
            ]
        );
        assert!(tokenize("08", None, ParserOptions::default()).is_err());
        assert!(tokenize("12abc", None, ParserOptions::default()).is_err());
    }

    #[test]
    fn test_lexer_variables() {
        assert_eq!(
            kinds("$x $::top $a::b"),
            vec![
                TokenKind::Variable("x".into()),
                TokenKind::Variable("::top".into()),
                TokenKind::Variable("a::b".into()),
            ]
        );
    }

    #[test]
    fn test_lexer_single_quoted() {
        assert_eq!(
            kinds(r"'it\'s $x \n'"),
            vec![TokenKind::Str(r"it's $x \n".into())]
        );
    }

    #[test]
    fn test_lexer_plain_double_quoted() {
        assert_eq!(kinds(r#""a\tb \$x""#), vec![TokenKind::Str("a\tb $x".into())]);
    }

    #[test]
    fn test_lexer_interpolation() {
        assert_eq!(
            kinds(r#""a ${b} c $d""#),
            vec![
                TokenKind::DqPre("a ".into()),
                TokenKind::Variable("b".into()),
                TokenKind::DqMid(" c ".into()),
                TokenKind::Variable("d".into()),
                TokenKind::DqPost("".into()),
            ]
        );
    }

    #[test]
    fn test_lexer_interpolation_expression() {
        assert_eq!(
            kinds(r#""${x + 1}!""#),
            vec![
                TokenKind::DqPre("".into()),
                TokenKind::Variable("x".into()),
                TokenKind::Plus,
                TokenKind::Number(1),
                TokenKind::DqPost("!".into()),
            ]
        );
    }

    #[test]
    fn test_lexer_interpolated_keyword_is_variable() {
        assert_eq!(
            kinds(r#""${class}""#),
            vec![
                TokenKind::DqPre("".into()),
                TokenKind::Variable("class".into()),
                TokenKind::DqPost("".into()),
            ]
        );
    }

    #[test]
    fn test_lexer_regex_context() {
        assert_eq!(
            kinds("$a =~ /^web\\/\\d+$/"),
            vec![
                TokenKind::Variable("a".into()),
                TokenKind::Match,
                TokenKind::Regex("^web/\\d+$".into()),
            ]
        );
        assert_eq!(
            kinds("$a / 2 / 3"),
            vec![
                TokenKind::Variable("a".into()),
                TokenKind::Div,
                TokenKind::Number(2),
                TokenKind::Div,
                TokenKind::Number(3),
            ]
        );
    }

    #[test]
    fn test_lexer_comments_skipped() {
        assert_eq!(
            kinds("# leading\n$a /* block\n */ = 1"),
            vec![
                TokenKind::Variable("a".into()),
                TokenKind::Equals,
                TokenKind::Number(1),
            ]
        );
    }

    #[test]
    fn test_lexer_doc_comments() {
        let opts = ParserOptions { doc_comments: true };
        let toks = tokenize("# Manages web\n# servers\nclass web {}", None, opts).unwrap();
        assert_eq!(toks[0].doc.as_deref(), Some("Manages web\nservers"));
        assert_eq!(toks[1].doc, None);
    }

    #[test]
    fn test_lexer_line_numbers() {
        let toks = tokenize("$a = 1\n\n$b = \"x\ny\"\n$c", None, ParserOptions::default()).unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[3].line, 3);
        assert_eq!(toks[6].line, 5);
    }

    #[test]
    fn test_lexer_mismatched_closer() {
        let err = tokenize("file { 'a': ensure => [1, 2) }", None, ParserOptions::default())
            .unwrap_err();
        match err {
            Error::Syntax { expected, .. } => assert_eq!(expected.as_deref(), Some("']'")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_lexer_unclosed_delimiter() {
        assert!(tokenize("class a {", None, ParserOptions::default()).is_err());
        assert!(tokenize("$a = 'open", None, ParserOptions::default()).is_err());
        assert!(tokenize("$a = \"open ${x", None, ParserOptions::default()).is_err());
        assert!(tokenize("/* never closed", None, ParserOptions::default()).is_err());
    }
}
