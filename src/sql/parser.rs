//! SQL parser for the column-store dialect
//!
//! Lexing is done by the sqlparser tokenizer with the ClickHouse dialect. The
//! statement grammar on top covers the ClickHouse DDL that sqlparser lacks
//! (CODEC, column TTL, `AFTER` on Nested columns, `ALTER ... UPDATE/DELETE`).
//! Evaluated expressions go through the sqlparser expression parser; those that
//! are only stored (defaults, TTLs, engine arguments) are kept as normalized
//! source text.

use sqlparser::dialect::ClickHouseDialect;
use sqlparser::parser::Parser as SqlParser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::sql::ast::*;
use crate::sql::error::{SqlError, SqlResult};
use crate::sql::expr::lower_expr;

/// Engine used when CREATE TABLE has no ENGINE clause
pub const DEFAULT_TABLE_ENGINE: &str = "MergeTree";

/// Keywords that end a column type or a stored expression
const COLUMN_CLAUSES: &[&str] = &[
    "DEFAULT",
    "MATERIALIZED",
    "ALIAS",
    "COMMENT",
    "CODEC",
    "TTL",
    "AFTER",
    "FIRST",
];

fn is_keyword(token: &Token, kw: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(kw))
}

fn is_column_clause(word: &str) -> bool {
    COLUMN_CLAUSES.iter().any(|kw| word.eq_ignore_ascii_case(kw))
}

/// SQL parser
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Parse a single SQL statement
    pub fn parse_one(sql: &str) -> SqlResult<Statement> {
        let dialect = ClickHouseDialect {};
        let tokens = Tokenizer::new(&dialect, sql).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };

        let stmt = parser.parse_statement()?;
        while parser.consume(&Token::SemiColon) {}
        if parser.peek().is_some() {
            return Err(parser.expected("end of statement"));
        }
        Ok(stmt)
    }

    /// Parse a statement that must be a schema change
    pub fn parse_ddl(sql: &str) -> SqlResult<DdlStatement> {
        match Self::parse_one(sql)? {
            Statement::Ddl(ddl) => Ok(ddl),
            _ => Err(SqlError::Unsupported(
                "statement is not a schema change".to_string(),
            )),
        }
    }

    fn parse_statement(&mut self) -> SqlResult<Statement> {
        if self.parse_keyword("CREATE") {
            if self.parse_keyword("TABLE") {
                return Ok(Statement::Ddl(DdlStatement::CreateTable(
                    self.parse_create_table()?,
                )));
            }
            if self.parse_keyword("DATABASE") {
                return self.parse_create_database();
            }
            return Err(self.unsupported("CREATE"));
        }

        if self.parse_keyword("DROP") {
            if self.parse_keyword("TABLE") {
                let if_exists = self.parse_keywords(&["IF", "EXISTS"]);
                let table = self.parse_qualified_name()?;
                return Ok(Statement::Ddl(DdlStatement::DropTable { table, if_exists }));
            }
            if self.parse_keyword("DATABASE") {
                let if_exists = self.parse_keywords(&["IF", "EXISTS"]);
                let name = self.parse_identifier()?;
                return Ok(Statement::DropDatabase { name, if_exists });
            }
            return Err(self.unsupported("DROP"));
        }

        if self.parse_keyword("ALTER") {
            self.expect_keyword("TABLE")?;
            return self.parse_alter();
        }

        if self.parse_keyword("DESC") || self.parse_keyword("DESCRIBE") {
            self.parse_keyword("TABLE");
            return Ok(Statement::Describe(self.parse_qualified_name()?));
        }

        if self.parse_keyword("INSERT") {
            self.expect_keyword("INTO")?;
            return self.parse_insert();
        }

        if self.parse_keyword("OPTIMIZE") {
            self.expect_keyword("TABLE")?;
            let table = self.parse_qualified_name()?;
            self.parse_keyword("FINAL");
            return Ok(Statement::Optimize(table));
        }

        if self.parse_keyword("SELECT") {
            return self.parse_select();
        }

        Err(self.expected("statement"))
    }

    fn parse_create_table(&mut self) -> SqlResult<CreateTableStatement> {
        let if_not_exists = self.parse_keywords(&["IF", "NOT", "EXISTS"]);
        let table = self.parse_qualified_name()?;

        self.expect(&Token::LParen)?;
        let mut columns = Vec::new();
        loop {
            if ["INDEX", "CONSTRAINT", "PROJECTION", "PRIMARY"]
                .iter()
                .any(|kw| self.peek_keyword(kw))
            {
                return Err(self.unsupported("table-level index or constraint"));
            }
            let column = self.parse_column_spec()?;
            if column.data_type.is_none() {
                return Err(SqlError::Parse(format!(
                    "column '{}' has no type",
                    column.name
                )));
            }
            columns.push(column);
            if self.consume(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            break;
        }

        let engine = if self.parse_keyword("ENGINE") {
            self.consume(&Token::Eq);
            self.parse_engine()?
        } else {
            EngineSpec::new(DEFAULT_TABLE_ENGINE)
        };

        Ok(CreateTableStatement {
            table,
            if_not_exists,
            columns,
            engine,
        })
    }

    fn parse_create_database(&mut self) -> SqlResult<Statement> {
        let if_not_exists = self.parse_keywords(&["IF", "NOT", "EXISTS"]);
        let name = self.parse_identifier()?;
        let engine = if self.parse_keyword("ENGINE") {
            self.consume(&Token::Eq);
            Some(self.parse_engine()?)
        } else {
            None
        };
        Ok(Statement::CreateDatabase {
            name,
            if_not_exists,
            engine,
        })
    }

    /// Engine name, optional argument list, and any trailing clauses
    fn parse_engine(&mut self) -> SqlResult<EngineSpec> {
        self.skip_whitespace();
        let start = self.pos;
        let name = self.parse_identifier()?;
        let args = if self.consume(&Token::LParen) {
            self.parse_raw_list()?
        } else {
            Vec::new()
        };

        // ORDER BY, PARTITION BY, SETTINGS ... are kept verbatim
        let end = self.end_of_statement();
        let full = self.span_text(start, end);
        self.pos = end;

        Ok(EngineSpec { name, args, full })
    }

    fn parse_alter(&mut self) -> SqlResult<Statement> {
        let table = self.parse_qualified_name()?;

        if self.parse_keyword("UPDATE") {
            let mut assignments = Vec::new();
            loop {
                let column = self.parse_column_name()?;
                self.expect(&Token::Eq)?;
                assignments.push((column, self.parse_expr(&["WHERE"])?));
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
            let filter = if self.parse_keyword("WHERE") {
                Some(self.parse_expr(&[])?)
            } else {
                None
            };
            return Ok(Statement::Mutation {
                table,
                command: MutationCommand::Update {
                    assignments,
                    filter,
                },
            });
        }

        if self.parse_keyword("DELETE") {
            self.expect_keyword("WHERE")?;
            let filter = self.parse_expr(&[])?;
            return Ok(Statement::Mutation {
                table,
                command: MutationCommand::Delete { filter },
            });
        }

        let mut commands = Vec::new();
        loop {
            commands.push(self.parse_alter_command()?);
            if !self.consume(&Token::Comma) {
                break;
            }
        }
        Ok(Statement::Ddl(DdlStatement::AlterTable { table, commands }))
    }

    fn parse_alter_command(&mut self) -> SqlResult<AlterCommand> {
        if self.parse_keyword("ADD") {
            self.expect_keyword("COLUMN")?;
            let if_not_exists = self.parse_keywords(&["IF", "NOT", "EXISTS"]);
            let column = self.parse_column_spec()?;
            if column.data_type.is_none() {
                return Err(SqlError::Parse(format!(
                    "column '{}' has no type",
                    column.name
                )));
            }
            let position = if self.parse_keyword("AFTER") {
                ColumnPosition::After(self.parse_column_name()?)
            } else if self.parse_keyword("FIRST") {
                ColumnPosition::First
            } else {
                ColumnPosition::Last
            };
            return Ok(AlterCommand::AddColumn {
                column,
                if_not_exists,
                position,
            });
        }

        if self.parse_keyword("DROP") {
            self.expect_keyword("COLUMN")?;
            let if_exists = self.parse_keywords(&["IF", "EXISTS"]);
            let name = self.parse_column_name()?;
            return Ok(AlterCommand::DropColumn { name, if_exists });
        }

        if self.parse_keyword("RENAME") {
            self.expect_keyword("COLUMN")?;
            let if_exists = self.parse_keywords(&["IF", "EXISTS"]);
            let from = self.parse_column_name()?;
            self.expect_keyword("TO")?;
            let to = self.parse_column_name()?;
            return Ok(AlterCommand::RenameColumn {
                from,
                to,
                if_exists,
            });
        }

        if self.parse_keyword("MODIFY") {
            self.expect_keyword("COLUMN")?;
            let if_exists = self.parse_keywords(&["IF", "EXISTS"]);
            let column = self.parse_column_spec()?;
            return Ok(AlterCommand::ModifyColumn { column, if_exists });
        }

        if self.parse_keyword("COMMENT") {
            self.expect_keyword("COLUMN")?;
            let if_exists = self.parse_keywords(&["IF", "EXISTS"]);
            let name = self.parse_column_name()?;
            let comment = self.parse_string_literal()?;
            return Ok(AlterCommand::CommentColumn {
                name,
                comment,
                if_exists,
            });
        }

        Err(self.expected("ALTER command"))
    }

    fn parse_insert(&mut self) -> SqlResult<Statement> {
        let table = self.parse_qualified_name()?;

        let columns = if self.consume(&Token::LParen) {
            let mut cols = Vec::new();
            loop {
                cols.push(self.parse_column_name()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect_keyword("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let mut row = Vec::new();
            if !self.consume(&Token::RParen) {
                loop {
                    row.push(self.parse_expr(&[])?);
                    if self.consume(&Token::Comma) {
                        continue;
                    }
                    self.expect(&Token::RParen)?;
                    break;
                }
            }
            rows.push(row);
            if !self.consume(&Token::Comma) {
                break;
            }
        }

        Ok(Statement::Insert {
            table,
            columns,
            rows,
        })
    }

    fn parse_select(&mut self) -> SqlResult<Statement> {
        let projection = if self.consume(&Token::Mul) {
            Projection::Wildcard
        } else {
            let mut cols = Vec::new();
            loop {
                cols.push(self.parse_column_name()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
            Projection::Columns(cols)
        };

        self.expect_keyword("FROM")?;
        let from = self.parse_qualified_name()?;
        let filter = if self.parse_keyword("WHERE") {
            Some(self.parse_expr(&[])?)
        } else {
            None
        };

        Ok(Statement::Select {
            projection,
            from,
            filter,
        })
    }

    fn parse_column_spec(&mut self) -> SqlResult<ColumnSpec> {
        let name = self.parse_column_name()?;

        let has_type = matches!(
            self.peek(),
            Some(Token::Word(w)) if w.quote_style.is_some() || !is_column_clause(&w.value)
        );
        let data_type = if has_type {
            Some(self.parse_type()?)
        } else {
            None
        };

        let mut spec = ColumnSpec {
            name,
            data_type,
            default: None,
            comment: None,
            codec: None,
            ttl: None,
        };

        loop {
            if let Some(kind) = self.parse_default_kind() {
                if spec.default.is_some() {
                    return Err(SqlError::Parse(format!(
                        "duplicate default for column '{}'",
                        spec.name
                    )));
                }
                let expression = self.capture_expr(COLUMN_CLAUSES)?;
                spec.default = Some(ColumnDefault { kind, expression });
            } else if self.parse_keyword("COMMENT") {
                spec.comment = Some(self.parse_string_literal()?);
            } else if self.parse_keyword("CODEC") {
                self.expect(&Token::LParen)?;
                spec.codec = Some(self.parse_raw_list()?.join(", "));
            } else if self.parse_keyword("TTL") {
                spec.ttl = Some(self.capture_expr(COLUMN_CLAUSES)?);
            } else {
                break;
            }
        }

        Ok(spec)
    }

    fn parse_default_kind(&mut self) -> Option<DefaultKind> {
        if self.parse_keyword("DEFAULT") {
            Some(DefaultKind::Default)
        } else if self.parse_keyword("MATERIALIZED") {
            Some(DefaultKind::Materialized)
        } else if self.parse_keyword("ALIAS") {
            Some(DefaultKind::Alias)
        } else {
            None
        }
    }

    fn parse_type(&mut self) -> SqlResult<TypeName> {
        let name = self.parse_identifier()?;
        let mut args = Vec::new();
        if self.consume(&Token::LParen) && !self.consume(&Token::RParen) {
            loop {
                args.push(self.parse_type_arg()?);
                if self.consume(&Token::Comma) {
                    continue;
                }
                self.expect(&Token::RParen)?;
                break;
            }
        }
        Ok(TypeName { name, args })
    }

    fn parse_type_arg(&mut self) -> SqlResult<TypeArg> {
        let is_field = matches!(
            (self.peek_nth(0), self.peek_nth(1)),
            (Some(Token::Word(_)), Some(Token::Word(_)))
        );
        let is_type = matches!(self.peek(), Some(Token::Word(_)));

        if is_field {
            let name = self.parse_identifier()?;
            let ty = self.parse_type()?;
            Ok(TypeArg::Field { name, ty })
        } else if is_type {
            Ok(TypeArg::Type(self.parse_type()?))
        } else {
            Ok(TypeArg::Literal(self.capture_expr(&[])?))
        }
    }

    // ============ Expressions ============

    /// Parse one scalar expression with the sqlparser grammar
    ///
    /// The expression ends at a depth-0 comma, closing parenthesis or one of
    /// `stop`, and must consume everything before that point.
    fn parse_expr(&mut self, stop: &[&str]) -> SqlResult<Expr> {
        self.skip_whitespace();
        let start = self.pos;
        let end = self.expr_end(stop);
        if start == end {
            return Err(self.expected("expression"));
        }

        let dialect = ClickHouseDialect {};
        let mut parser = SqlParser::new(&dialect).with_tokens(self.tokens[start..end].to_vec());
        let expr = parser.parse_expr()?;
        let rest = parser.peek_token().token;
        if rest != Token::EOF {
            return Err(SqlError::Parse(format!(
                "unexpected '{}' in expression",
                rest
            )));
        }
        self.pos = end;
        lower_expr(&expr)
    }

    // ============ Names and literals ============

    fn parse_identifier(&mut self) -> SqlResult<String> {
        let value = match self.peek() {
            Some(Token::Word(w)) => w.value.clone(),
            _ => return Err(self.expected("identifier")),
        };
        self.next_token();
        Ok(value)
    }

    /// Column name, possibly a flattened Nested element like `NestedColumn.A`
    fn parse_column_name(&mut self) -> SqlResult<String> {
        let mut name = self.parse_identifier()?;
        while matches!(
            (self.peek_nth(0), self.peek_nth(1)),
            (Some(Token::Period), Some(Token::Word(_)))
        ) {
            self.next_token();
            name.push('.');
            name.push_str(&self.parse_identifier()?);
        }
        Ok(name)
    }

    fn parse_qualified_name(&mut self) -> SqlResult<QualifiedName> {
        let first = self.parse_identifier()?;
        if self.consume(&Token::Period) {
            let name = self.parse_identifier()?;
            Ok(QualifiedName::new(Some(first), name))
        } else {
            Ok(QualifiedName::new(None, first))
        }
    }

    fn parse_string_literal(&mut self) -> SqlResult<String> {
        let value = match self.peek() {
            Some(Token::SingleQuotedString(s)) => s.clone(),
            _ => return Err(self.expected("string literal")),
        };
        self.next_token();
        Ok(value)
    }

    /// Comma-separated raw items up to the closing parenthesis (already past `(`)
    fn parse_raw_list(&mut self) -> SqlResult<Vec<String>> {
        let mut items = Vec::new();
        if self.consume(&Token::RParen) {
            return Ok(items);
        }
        loop {
            items.push(self.capture_expr(&[])?);
            if self.consume(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            return Ok(items);
        }
    }

    /// Position of the first depth-0 comma, closing parenthesis or stop keyword
    fn expr_end(&self, stop: &[&str]) -> usize {
        let mut depth = 0usize;
        let mut pos = self.pos;
        while let Some(token) = self.tokens.get(pos) {
            match token {
                Token::EOF | Token::SemiColon => break,
                Token::LParen | Token::LBracket => depth += 1,
                Token::RParen | Token::RBracket => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                Token::Comma if depth == 0 => break,
                Token::Word(_) if depth == 0 && stop.iter().any(|kw| is_keyword(token, kw)) => {
                    break
                }
                _ => {}
            }
            pos += 1;
        }
        pos
    }

    /// Raw text of an expression that is stored rather than evaluated
    fn capture_expr(&mut self, stop: &[&str]) -> SqlResult<String> {
        self.skip_whitespace();
        let start = self.pos;
        self.pos = self.expr_end(stop);

        let text = self.span_text(start, self.pos);
        if text.is_empty() {
            return Err(self.expected("expression"));
        }
        Ok(text)
    }

    /// Render tokens back to text with whitespace collapsed
    fn span_text(&self, start: usize, end: usize) -> String {
        let mut out = String::new();
        let mut pending_space = false;
        for token in &self.tokens[start..end] {
            if let Token::Whitespace(_) = token {
                pending_space = true;
                continue;
            }
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push_str(&token.to_string());
        }
        out
    }

    fn end_of_statement(&self) -> usize {
        self.tokens[self.pos..]
            .iter()
            .position(|t| matches!(t, Token::SemiColon | Token::EOF))
            .map(|offset| self.pos + offset)
            .unwrap_or(self.tokens.len())
    }

    // ============ Token helpers ============

    fn skip_whitespace(&mut self) {
        while matches!(self.tokens.get(self.pos), Some(Token::Whitespace(_))) {
            self.pos += 1;
        }
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens[self.pos..]
            .iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .take_while(|t| !matches!(t, Token::EOF))
            .nth(n)
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_nth(0)
    }

    fn next_token(&mut self) -> Option<Token> {
        self.skip_whitespace();
        match self.tokens.get(self.pos) {
            None | Some(Token::EOF) => None,
            Some(token) => {
                let token = token.clone();
                self.pos += 1;
                Some(token)
            }
        }
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| is_keyword(t, kw))
    }

    fn parse_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.next_token();
            true
        } else {
            false
        }
    }

    /// Consume a keyword sequence only if all of it is present
    fn parse_keywords(&mut self, kws: &[&str]) -> bool {
        let all = kws
            .iter()
            .enumerate()
            .all(|(i, kw)| self.peek_nth(i).is_some_and(|t| is_keyword(t, kw)));
        if all {
            for _ in kws {
                self.next_token();
            }
        }
        all
    }

    fn expect_keyword(&mut self, kw: &str) -> SqlResult<()> {
        if self.parse_keyword(kw) {
            Ok(())
        } else {
            Err(self.expected(kw))
        }
    }

    fn consume(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.next_token();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> SqlResult<()> {
        if self.consume(expected) {
            Ok(())
        } else {
            Err(self.expected(&format!("'{}'", expected)))
        }
    }

    fn expected(&self, what: &str) -> SqlError {
        let found = self
            .peek()
            .map(|t| format!("'{}'", t))
            .unwrap_or_else(|| "end of input".to_string());
        SqlError::Parse(format!("expected {}, found {}", what, found))
    }

    fn unsupported(&self, what: &str) -> SqlError {
        let next = self
            .peek()
            .map(|t| t.to_string())
            .unwrap_or_default();
        SqlError::Unsupported(format!("{} {}", what, next).trim().to_string())
    }
}
