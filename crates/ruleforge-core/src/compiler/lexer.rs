//! Rule-definition tokenizer (logos).

use crate::types::KnowledgeError;
use logos::Logos;
use std::fmt;

#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[token("package")]
    Package,
    #[token("version")]
    Version,
    #[token("import")]
    Import,
    #[token("declare")]
    Declare,
    #[token("rule")]
    Rule,
    #[token("salience")]
    Salience,
    #[token("when")]
    When,
    #[token("then")]
    Then,
    #[token("end")]
    End,
    #[token("not")]
    Not,
    #[token("exists")]
    Exists,
    #[token("eval")]
    Eval,
    #[token("and")]
    #[token("&&")]
    And,
    #[token("or")]
    #[token("||")]
    Or,
    #[token("insert")]
    Insert,
    #[token("log")]
    Log,
    #[token("true")]
    True,
    #[token("false")]
    False,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,

    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\\n]|\\.)*""#, unescape)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "integer {}", v),
            Self::Str(s) => write!(f, "string {:?}", s),
            Self::Ident(s) => write!(f, "identifier `{}`", s),
            other => write!(f, "`{}`", keyword_text(other)),
        }
    }
}

fn keyword_text(token: &Token) -> &'static str {
    match token {
        Token::Package => "package",
        Token::Version => "version",
        Token::Import => "import",
        Token::Declare => "declare",
        Token::Rule => "rule",
        Token::Salience => "salience",
        Token::When => "when",
        Token::Then => "then",
        Token::End => "end",
        Token::Not => "not",
        Token::Exists => "exists",
        Token::Eval => "eval",
        Token::And => "and",
        Token::Or => "or",
        Token::Insert => "insert",
        Token::Log => "log",
        Token::True => "true",
        Token::False => "false",
        Token::LParen => "(",
        Token::RParen => ")",
        Token::Comma => ",",
        Token::Semi => ";",
        Token::Colon => ":",
        Token::Dot => ".",
        Token::EqEq => "==",
        Token::NotEq => "!=",
        Token::LtEq => "<=",
        Token::GtEq => ">=",
        Token::Lt => "<",
        Token::Gt => ">",
        Token::Assign => "=",
        Token::Int(_) | Token::Str(_) | Token::Ident(_) => "literal",
    }
}

fn unescape(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let raw = lex.slice();
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            _ => return None,
        }
    }
    Some(out)
}

/// A token with the 1-based line it starts on.
#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

/// Tokenize a rule-definition source.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, KnowledgeError> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);
    let mut line = 1;
    let mut counted = 0;

    while let Some(result) = lexer.next() {
        let start = lexer.span().start;
        line += source[counted..start].matches('\n').count();
        counted = start;
        match result {
            Ok(token) => tokens.push(Spanned { token, line }),
            Err(()) => {
                return Err(KnowledgeError::compile(
                    line,
                    format!("unexpected input `{}`", lexer.slice()),
                ));
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("rule when then end packaged"),
            vec![
                Token::Rule,
                Token::When,
                Token::Then,
                Token::End,
                Token::Ident("packaged".into())
            ]
        );
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(
            kinds("== != <= >= < > ="),
            vec![
                Token::EqEq,
                Token::NotEq,
                Token::LtEq,
                Token::GtEq,
                Token::Lt,
                Token::Gt,
                Token::Assign
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(kinds(r#""a\"b\n""#), vec![Token::Str("a\"b\n".into())]);
    }

    #[test]
    fn negative_integers() {
        assert_eq!(kinds("salience -5"), vec![Token::Salience, Token::Int(-5)]);
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let tokens = tokenize("// header\npackage a;\n# note\nrule").expect("tokenize");
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens.last().map(|t| t.line), Some(4));
    }

    #[test]
    fn unexpected_character_reports_line() {
        let result = tokenize("package a;\n@");
        assert!(matches!(result, Err(KnowledgeError::Compile { line: 2, .. })));
    }
}
