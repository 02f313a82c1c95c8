//! Recursive descent parser for rule-definition sources.
//!
//! Produces an unresolved syntax tree; type resolution and checking happen
//! in the lowering pass.

use super::lexer::{Spanned, Token, tokenize};
use crate::package::CompareOp;
use crate::primitives::MAX_CONDITION_DEPTH;
use crate::types::{FieldValue, KnowledgeError};

// =============================================================================
// SYNTAX TREE
// =============================================================================

#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub package: String,
    pub version: Option<(i64, usize)>,
    pub imports: Vec<(String, usize)>,
    pub declares: Vec<DeclareAst>,
    pub rules: Vec<RuleAst>,
}

#[derive(Debug, Clone)]
pub struct DeclareAst {
    pub name: String,
    pub fields: Vec<FieldAst>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct FieldAst {
    pub name: String,
    pub type_keyword: String,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct RuleAst {
    pub name: String,
    pub salience: i64,
    pub conditions: Vec<CondAst>,
    pub actions: Vec<ActionAst>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum CondAst {
    Pattern {
        type_name: String,
        constraints: Vec<ConstraintAst>,
        line: usize,
    },
    And(Vec<CondAst>),
    Or(Vec<CondAst>),
    Not(Box<CondAst>),
    Exists(Box<CondAst>),
    Eval(bool),
}

#[derive(Debug, Clone)]
pub struct ConstraintAst {
    pub field: String,
    pub op: CompareOp,
    pub value: FieldValue,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum ActionAst {
    Insert {
        type_name: String,
        assigns: Vec<(String, FieldValue, usize)>,
        line: usize,
    },
    Log(String),
}

// =============================================================================
// PARSER
// =============================================================================

/// Parse a complete source into a [`SourceUnit`].
pub fn parse(source: &str) -> Result<SourceUnit, KnowledgeError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_unit()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Open `not`/`exists`/`(` levels of the condition being parsed.
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |s| s.line)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, expected: &str) -> KnowledgeError {
        let found = self
            .peek()
            .map_or_else(|| "end of input".to_string(), |t| t.to_string());
        KnowledgeError::compile(self.line(), format!("expected {}, found {}", expected, found))
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), KnowledgeError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(what))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, KnowledgeError> {
        match self.peek() {
            Some(Token::Ident(_)) => match self.advance() {
                Some(Token::Ident(name)) => Ok(name),
                _ => Err(self.error(what)),
            },
            _ => Err(self.error(what)),
        }
    }

    fn qualified_name(&mut self, what: &str) -> Result<String, KnowledgeError> {
        let mut name = self.ident(what)?;
        while self.eat(&Token::Dot) {
            name.push('.');
            name.push_str(&self.ident("name segment after `.`")?);
        }
        Ok(name)
    }

    fn string(&mut self, what: &str) -> Result<String, KnowledgeError> {
        match self.peek() {
            Some(Token::Str(_)) => match self.advance() {
                Some(Token::Str(s)) => Ok(s),
                _ => Err(self.error(what)),
            },
            _ => Err(self.error(what)),
        }
    }

    fn int(&mut self, what: &str) -> Result<i64, KnowledgeError> {
        match self.peek() {
            Some(Token::Int(v)) => {
                let v = *v;
                self.pos += 1;
                Ok(v)
            }
            _ => Err(self.error(what)),
        }
    }

    fn literal(&mut self) -> Result<FieldValue, KnowledgeError> {
        let value = match self.peek() {
            Some(Token::Int(v)) => FieldValue::Int(*v),
            Some(Token::Str(s)) => FieldValue::Str(s.clone()),
            Some(Token::True) => FieldValue::Bool(true),
            Some(Token::False) => FieldValue::Bool(false),
            _ => return Err(self.error("literal")),
        };
        self.pos += 1;
        Ok(value)
    }

    // =========================================================================
    // UNIT
    // =========================================================================

    fn parse_unit(&mut self) -> Result<SourceUnit, KnowledgeError> {
        self.expect(&Token::Package, "`package` statement")?;
        let package = self.qualified_name("package name")?;
        self.eat(&Token::Semi);

        let mut unit = SourceUnit {
            package,
            version: None,
            imports: Vec::new(),
            declares: Vec::new(),
            rules: Vec::new(),
        };

        while let Some(token) = self.peek().cloned() {
            let line = self.line();
            match token {
                Token::Version => {
                    self.pos += 1;
                    if unit.version.is_some() {
                        return Err(KnowledgeError::compile(line, "duplicate `version` statement"));
                    }
                    unit.version = Some((self.int("version number")?, line));
                    self.eat(&Token::Semi);
                }
                Token::Import => {
                    self.pos += 1;
                    let name = self.qualified_name("imported type name")?;
                    unit.imports.push((name, line));
                    self.eat(&Token::Semi);
                }
                Token::Declare => unit.declares.push(self.parse_declare()?),
                Token::Rule => unit.rules.push(self.parse_rule()?),
                _ => return Err(self.error("`import`, `declare` or `rule`")),
            }
        }
        Ok(unit)
    }

    fn parse_declare(&mut self) -> Result<DeclareAst, KnowledgeError> {
        let line = self.line();
        self.expect(&Token::Declare, "`declare`")?;
        let name = self.qualified_name("type name")?;
        let mut fields = Vec::new();
        while !self.eat(&Token::End) {
            let field_line = self.line();
            let field = self.ident("field name or `end`")?;
            self.expect(&Token::Colon, "`:` after field name")?;
            let type_keyword = self.ident("field type")?;
            self.eat(&Token::Semi);
            fields.push(FieldAst {
                name: field,
                type_keyword,
                line: field_line,
            });
        }
        Ok(DeclareAst { name, fields, line })
    }

    fn parse_rule(&mut self) -> Result<RuleAst, KnowledgeError> {
        let line = self.line();
        self.expect(&Token::Rule, "`rule`")?;
        let name = self.string("quoted rule name")?;

        let mut salience = 0;
        if self.eat(&Token::Salience) {
            salience = self.int("salience value")?;
        }

        self.expect(&Token::When, "`when`")?;
        let mut conditions = Vec::new();
        while self.peek() != Some(&Token::Then) {
            if self.peek().is_none() {
                return Err(self.error("`then`"));
            }
            conditions.push(self.parse_or()?);
        }
        self.expect(&Token::Then, "`then`")?;

        let mut actions = Vec::new();
        while !self.eat(&Token::End) {
            actions.push(self.parse_action()?);
        }

        Ok(RuleAst {
            name,
            salience,
            conditions,
            actions,
            line,
        })
    }

    // =========================================================================
    // CONDITIONS
    // =========================================================================

    fn parse_or(&mut self) -> Result<CondAst, KnowledgeError> {
        let mut alternatives = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            alternatives.push(self.parse_and()?);
        }
        Ok(if alternatives.len() == 1 {
            alternatives.remove(0)
        } else {
            CondAst::Or(alternatives)
        })
    }

    fn parse_and(&mut self) -> Result<CondAst, KnowledgeError> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            CondAst::And(parts)
        })
    }

    /// Run `f` one nesting level deeper.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, KnowledgeError>,
    ) -> Result<T, KnowledgeError> {
        if self.depth >= MAX_CONDITION_DEPTH {
            return Err(KnowledgeError::compile(
                self.line(),
                format!("condition nested deeper than {} levels", MAX_CONDITION_DEPTH),
            ));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn parse_unary(&mut self) -> Result<CondAst, KnowledgeError> {
        if self.eat(&Token::Not) {
            return self.nested(|p| Ok(CondAst::Not(Box::new(p.parse_unary()?))));
        }
        if self.eat(&Token::Exists) {
            return self.nested(|p| Ok(CondAst::Exists(Box::new(p.parse_unary()?))));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<CondAst, KnowledgeError> {
        match self.peek() {
            Some(Token::Eval) => {
                self.pos += 1;
                self.expect(&Token::LParen, "`(` after `eval`")?;
                let value = match self.peek() {
                    Some(Token::True) => true,
                    Some(Token::False) => false,
                    _ => return Err(self.error("`true` or `false`")),
                };
                self.pos += 1;
                self.expect(&Token::RParen, "`)`")?;
                Ok(CondAst::Eval(value))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.nested(Self::parse_or)?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Ident(_)) => self.parse_pattern(),
            _ => Err(self.error("pattern, `eval`, `not`, `exists` or `(`")),
        }
    }

    fn parse_pattern(&mut self) -> Result<CondAst, KnowledgeError> {
        let line = self.line();
        let type_name = self.qualified_name("fact type")?;
        self.expect(&Token::LParen, "`(` after fact type")?;
        let mut constraints = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let c_line = self.line();
                let field = self.ident("field name")?;
                let op = self.compare_op()?;
                let value = self.literal()?;
                constraints.push(ConstraintAst {
                    field,
                    op,
                    value,
                    line: c_line,
                });
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma, "`,` or `)`")?;
            }
        }
        Ok(CondAst::Pattern {
            type_name,
            constraints,
            line,
        })
    }

    fn compare_op(&mut self) -> Result<CompareOp, KnowledgeError> {
        let op = match self.peek() {
            Some(Token::EqEq) => CompareOp::Eq,
            Some(Token::NotEq) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::LtEq) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::GtEq) => CompareOp::Ge,
            _ => return Err(self.error("comparison operator")),
        };
        self.pos += 1;
        Ok(op)
    }

    // =========================================================================
    // ACTIONS
    // =========================================================================

    fn parse_action(&mut self) -> Result<ActionAst, KnowledgeError> {
        let line = self.line();
        let action = match self.peek() {
            Some(Token::Insert) => {
                self.pos += 1;
                let type_name = self.qualified_name("fact type")?;
                self.expect(&Token::LParen, "`(` after fact type")?;
                let mut assigns = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        let a_line = self.line();
                        let field = self.ident("field name")?;
                        self.expect(&Token::Assign, "`=`")?;
                        assigns.push((field, self.literal()?, a_line));
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(&Token::Comma, "`,` or `)`")?;
                    }
                }
                ActionAst::Insert {
                    type_name,
                    assigns,
                    line,
                }
            }
            Some(Token::Log) => {
                self.pos += 1;
                ActionAst::Log(self.string("quoted log message")?)
            }
            _ => return Err(self.error("`insert`, `log` or `end`")),
        };
        self.expect(&Token::Semi, "`;` after action")?;
        Ok(action)
    }
}
