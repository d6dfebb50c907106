//! Tokens and the Symbol Map
//!
//! The lexer is longest-match over a symbol map. Each symbol carries an
//! "interrupter" bit: punctuation interrupts an identifier mid-scan, while
//! word operators (`and`, `or`, `not`, `new`) and keywords only match at
//! identifier boundaries.

/// Punctuation and operator separators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Assignment,
    Addition,
    AdditionAssignment,
    Subtraction,
    SubtractionAssignment,
    Multiplication,
    MultiplicationAssignment,
    Division,
    DivisionAssignment,
    Modulus,
    ModulusAssignment,
    Exponent,
    ExponentAssignment,
    Increment,
    Decrement,
    GroupOpen,
    GroupClose,
    SelectorOpen,
    SelectorClose,
    ScopeOpen,
    ScopeClose,
    Equality,
    InverseEquality,
    Greater,
    Lesser,
    GreaterEquality,
    LesserEquality,
    LogicalOr,
    LogicalAnd,
    LogicalNot,
    BitwiseOr,
    BitwiseOrAssignment,
    BitwiseXor,
    BitwiseXorAssignment,
    BitwiseAnd,
    BitwiseAndAssignment,
    BitwiseNot,
    ShiftRight,
    ShiftRightAssignment,
    ShiftLeft,
    ShiftLeftAssignment,
    Seek,
    Ternary,
    Dot,
    List,
    Direct,
    Length,
    Ellipsis,
    EndStatement,
    NewObject,
    NamespaceIndex,
}

/// Reserved words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Local,
    For,
    Function,
    If,
    Else,
    TypeOf,
    While,
    Do,
    Const,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Class,
    Return,
    LiteralTrue,
    LiteralFalse,
    LiteralNull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Separator(Separator),
    Keyword(Keyword),
    Identifier(String),
    StringLiteral(String),
    Integer(i64),
    Number(f64),
}

/// A token plus its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte index into the source.
    pub index: usize,
    /// 1-indexed row.
    pub row: usize,
    /// 1-indexed column.
    pub column: usize,
}

impl Token {
    pub fn is_separator(&self, separator: Separator) -> bool {
        self.kind == TokenKind::Separator(separator)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }
}

/// Punctuation symbols, longest first so a plain scan is longest-match.
/// These all carry the interrupter bit: they end an identifier.
pub const PUNCTUATION: &[(&str, Separator)] = &[
    (">>=", Separator::ShiftRightAssignment),
    ("<<=", Separator::ShiftLeftAssignment),
    (">|=", Separator::BitwiseXorAssignment),
    ("...", Separator::Ellipsis),
    ("==", Separator::Equality),
    ("!=", Separator::InverseEquality),
    (">=", Separator::GreaterEquality),
    ("<=", Separator::LesserEquality),
    ("||", Separator::LogicalOr),
    ("&&", Separator::LogicalAnd),
    ("|=", Separator::BitwiseOrAssignment),
    ("&=", Separator::BitwiseAndAssignment),
    (">|", Separator::BitwiseXor),
    (">>", Separator::ShiftRight),
    ("<<", Separator::ShiftLeft),
    ("^=", Separator::ExponentAssignment),
    ("%=", Separator::ModulusAssignment),
    ("*=", Separator::MultiplicationAssignment),
    ("/=", Separator::DivisionAssignment),
    ("+=", Separator::AdditionAssignment),
    ("-=", Separator::SubtractionAssignment),
    ("++", Separator::Increment),
    ("--", Separator::Decrement),
    ("->", Separator::Direct),
    ("::", Separator::NamespaceIndex),
    ("=", Separator::Assignment),
    ("*", Separator::Multiplication),
    ("/", Separator::Division),
    ("+", Separator::Addition),
    ("-", Separator::Subtraction),
    ("(", Separator::GroupOpen),
    (")", Separator::GroupClose),
    ("[", Separator::SelectorOpen),
    ("]", Separator::SelectorClose),
    ("{", Separator::ScopeOpen),
    ("}", Separator::ScopeClose),
    (">", Separator::Greater),
    ("<", Separator::Lesser),
    ("!", Separator::LogicalNot),
    ("|", Separator::BitwiseOr),
    ("&", Separator::BitwiseAnd),
    ("~", Separator::BitwiseNot),
    ("^", Separator::Exponent),
    ("%", Separator::Modulus),
    (":", Separator::Seek),
    ("?", Separator::Ternary),
    (".", Separator::Dot),
    (",", Separator::List),
    ("#", Separator::Length),
    (";", Separator::EndStatement),
];

/// Word symbols: operators spelled as identifiers. No interrupter bit, so
/// `android` stays an identifier.
pub fn word_symbol(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "or" => TokenKind::Separator(Separator::LogicalOr),
        "and" => TokenKind::Separator(Separator::LogicalAnd),
        "not" => TokenKind::Separator(Separator::LogicalNot),
        "new" => TokenKind::Separator(Separator::NewObject),

        "local" => TokenKind::Keyword(Keyword::Local),
        "for" => TokenKind::Keyword(Keyword::For),
        "function" => TokenKind::Keyword(Keyword::Function),
        "if" => TokenKind::Keyword(Keyword::If),
        "else" => TokenKind::Keyword(Keyword::Else),
        "typeof" => TokenKind::Keyword(Keyword::TypeOf),
        "while" => TokenKind::Keyword(Keyword::While),
        "do" => TokenKind::Keyword(Keyword::Do),
        "const" => TokenKind::Keyword(Keyword::Const),
        "switch" => TokenKind::Keyword(Keyword::Switch),
        "case" => TokenKind::Keyword(Keyword::Case),
        "default" => TokenKind::Keyword(Keyword::Default),
        "break" => TokenKind::Keyword(Keyword::Break),
        "continue" => TokenKind::Keyword(Keyword::Continue),
        "class" => TokenKind::Keyword(Keyword::Class),
        "return" => TokenKind::Keyword(Keyword::Return),
        "true" => TokenKind::Keyword(Keyword::LiteralTrue),
        "false" => TokenKind::Keyword(Keyword::LiteralFalse),
        "null" => TokenKind::Keyword(Keyword::LiteralNull),
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punctuation_is_longest_first() {
        // The scan relies on longer symbols sorting before their prefixes.
        for window in PUNCTUATION.windows(2) {
            assert!(
                window[0].0.len() >= window[1].0.len(),
                "{:?} listed after shorter {:?}",
                window[0].0,
                window[1].0
            );
        }
    }

    #[test]
    fn test_word_symbols() {
        assert_eq!(
            word_symbol("or"),
            Some(TokenKind::Separator(Separator::LogicalOr))
        );
        assert_eq!(
            word_symbol("return"),
            Some(TokenKind::Keyword(Keyword::Return))
        );
        assert_eq!(word_symbol("android"), None);
    }
}
