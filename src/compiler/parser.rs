use crate::compiler::ast::*;
use crate::compiler::lexer::{Span, Token, TokenKind};

/// A recursive descent parser for CyberBasic.
///
/// Statements end at a newline or `:`. Block statements close with either a
/// single keyword (`WEND`, `NEXT`, `ENDIF`) or `END <keyword>`.
pub struct Parser<'a> {
    filename: &'a str,
    tokens: Vec<Token>,
    current: usize,
}

impl<'a> Parser<'a> {
    pub fn new(filename: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            filename,
            tokens,
            current: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Program, String> {
        let mut statements = Vec::new();

        loop {
            self.skip_separators();
            if self.is_at_end() {
                break;
            }
            statements.push(self.statement()?);
            self.end_of_statement()?;
        }

        Ok(Program { statements })
    }

    /// Parse statements until `stop` holds at the start of a line.
    fn block(&mut self, stop: impl Fn(&Self) -> bool) -> Result<Block, String> {
        let mut statements = Vec::new();

        loop {
            self.skip_separators();
            if stop(self) {
                break;
            }
            if self.is_at_end() {
                return Err(self.error("unexpected end of file"));
            }
            statements.push(self.statement()?);
            if !stop(self) {
                self.end_of_statement()?;
            }
        }

        Ok(statements)
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        let line = self.current_span().line;
        let kind = match self.peek_kind().cloned().unwrap_or(TokenKind::Eof) {
            TokenKind::Var | TokenKind::Let => self.var_statement()?,
            TokenKind::Dim => self.dim_statement()?,
            TokenKind::If => self.if_statement()?,
            TokenKind::For => self.for_statement()?,
            TokenKind::While => self.while_statement()?,
            TokenKind::Repeat => self.repeat_statement()?,
            TokenKind::Select => self.select_statement()?,
            TokenKind::Function => StmtKind::Function(self.function_decl(TokenKind::Function)?),
            TokenKind::Sub => StmtKind::Sub(self.function_decl(TokenKind::Sub)?),
            TokenKind::Module => self.module_statement()?,
            TokenKind::Type => self.type_decl()?,
            TokenKind::Entity => self.entity_decl()?,
            TokenKind::Const => self.const_statement()?,
            TokenKind::Enum => self.enum_statement()?,
            TokenKind::On => self.on_statement()?,
            TokenKind::StartCoroutine => {
                self.advance();
                let sub_name = self.expect_ident()?;
                if self.match_token(&TokenKind::LParen) {
                    self.expect(&TokenKind::RParen)?;
                }
                StmtKind::StartCoroutine { sub_name }
            }
            TokenKind::Yield => {
                self.advance();
                StmtKind::Yield
            }
            TokenKind::WaitSeconds => {
                self.advance();
                StmtKind::WaitSeconds {
                    seconds: self.expression()?,
                }
            }
            TokenKind::Exit => {
                self.advance();
                StmtKind::ExitLoop {
                    kind: self.loop_kind("EXIT")?,
                }
            }
            TokenKind::Continue => {
                self.advance();
                StmtKind::ContinueLoop {
                    kind: self.loop_kind("CONTINUE")?,
                }
            }
            TokenKind::Assert => {
                self.advance();
                let condition = self.expression()?;
                let message = if self.match_token(&TokenKind::Comma) {
                    Some(self.expression()?)
                } else {
                    None
                };
                StmtKind::Assert { condition, message }
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.expression()?)
                };
                StmtKind::Return { value }
            }
            TokenKind::Print => {
                self.advance();
                let args = if self.at_statement_end() {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                StmtKind::Expr {
                    expr: Expr::call("print", args),
                }
            }
            // A bare END stops the program
            TokenKind::End if self.at_line_end_ahead(1) => {
                self.advance();
                StmtKind::Expr {
                    expr: Expr::call("Quit", Vec::new()),
                }
            }
            TokenKind::End => return Err(self.error("unexpected END")),
            _ => self.simple_statement()?,
        };

        Ok(Stmt::new(kind, line))
    }

    fn var_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // VAR / LET
        let name = self.expect_ident()?;
        let var_type = self.type_annotation()?;

        if self.match_token(&TokenKind::Eq) {
            let value = self.expression()?;
            return Ok(StmtKind::Assign {
                target: name,
                indices: Vec::new(),
                value,
            });
        }

        Ok(StmtKind::Dim {
            vars: vec![DimVar {
                name,
                var_type,
                dimensions: Vec::new(),
            }],
        })
    }

    fn dim_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // DIM
        let mut vars = Vec::new();

        loop {
            let name = self.expect_ident()?;
            let dimensions = if self.match_token(&TokenKind::LParen) {
                let dims = self.expression_list()?;
                self.expect(&TokenKind::RParen)?;
                dims
            } else {
                Vec::new()
            };
            let var_type = self.type_annotation()?;
            vars.push(DimVar {
                name,
                var_type,
                dimensions,
            });

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        Ok(StmtKind::Dim { vars })
    }

    fn if_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // IF
        let condition = self.expression()?;
        self.expect(&TokenKind::Then)?;

        // Single-line form: IF c THEN stmt [ELSE stmt]
        if !self.check(&TokenKind::Newline) && !self.is_at_end() {
            let then_block = vec![self.statement()?];
            let else_block = if self.match_token(&TokenKind::Else) {
                Some(vec![self.statement()?])
            } else {
                None
            };
            return Ok(StmtKind::If {
                condition,
                then_block,
                else_ifs: Vec::new(),
                else_block,
            });
        }

        let then_block = self.block(Self::at_if_branch_end)?;
        let mut else_ifs = Vec::new();

        loop {
            if self.match_token(&TokenKind::ElseIf) {
                // ELSEIF
            } else if self.check(&TokenKind::Else) && self.check_ahead(&TokenKind::If, 1) {
                self.advance();
                self.advance();
            } else {
                break;
            }
            let condition = self.expression()?;
            self.expect(&TokenKind::Then)?;
            let body = self.block(Self::at_if_branch_end)?;
            else_ifs.push(ElseIf { condition, body });
        }

        let else_block = if self.match_token(&TokenKind::Else) {
            Some(self.block(|p| p.check(&TokenKind::EndIf) || p.check_end(&TokenKind::If))?)
        } else {
            None
        };

        if !self.match_token(&TokenKind::EndIf) {
            self.expect_end(&TokenKind::If, "IF")?;
        }

        Ok(StmtKind::If {
            condition,
            then_block,
            else_ifs,
            else_block,
        })
    }

    fn at_if_branch_end(&self) -> bool {
        self.check(&TokenKind::ElseIf)
            || self.check(&TokenKind::Else)
            || self.check(&TokenKind::EndIf)
            || self.check_end(&TokenKind::If)
    }

    fn for_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // FOR
        let variable = self.expect_ident()?;
        self.expect(&TokenKind::Eq)?;
        let start = self.expression()?;
        self.expect(&TokenKind::To)?;
        let end = self.expression()?;
        let step = if self.match_token(&TokenKind::Step) {
            Some(self.expression()?)
        } else {
            None
        };

        let body = self.block(|p| p.check(&TokenKind::Next) || p.check_end(&TokenKind::For))?;
        if self.match_token(&TokenKind::Next) {
            // NEXT i
            if self.check_ident() {
                self.advance();
            }
        } else {
            self.expect_end(&TokenKind::For, "FOR")?;
        }

        Ok(StmtKind::For {
            variable,
            start,
            end,
            step,
            body,
        })
    }

    fn while_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // WHILE
        let condition = self.expression()?;
        let body = self.block(|p| p.check(&TokenKind::Wend) || p.check_end(&TokenKind::While))?;
        if !self.match_token(&TokenKind::Wend) {
            self.expect_end(&TokenKind::While, "WHILE")?;
        }
        Ok(StmtKind::While { condition, body })
    }

    fn repeat_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // REPEAT
        let body = self.block(|p| p.check(&TokenKind::Until))?;
        self.expect(&TokenKind::Until)?;
        let condition = self.expression()?;
        Ok(StmtKind::Repeat { body, condition })
    }

    fn select_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // SELECT
        self.expect(&TokenKind::Case)?;
        let subject = self.expression()?;

        let at_arm_end = |p: &Self| p.check(&TokenKind::Case) || p.check_end(&TokenKind::Select);
        let mut cases = Vec::new();
        let mut else_block = None;

        loop {
            self.skip_separators();
            if self.check_end(&TokenKind::Select) {
                break;
            }
            self.expect(&TokenKind::Case)?;
            if self.match_token(&TokenKind::Else) {
                else_block = Some(self.block(at_arm_end)?);
            } else {
                let values = self.expression_list()?;
                let body = self.block(at_arm_end)?;
                cases.push(CaseClause { values, body });
            }
        }
        self.expect_end(&TokenKind::Select, "SELECT")?;

        Ok(StmtKind::SelectCase {
            subject,
            cases,
            else_block,
        })
    }

    fn function_decl(&mut self, keyword: TokenKind) -> Result<FunctionDecl, String> {
        self.advance(); // FUNCTION / SUB
        let name = self.expect_ident()?;

        let mut params = Vec::new();
        if self.match_token(&TokenKind::LParen) {
            if !self.check(&TokenKind::RParen) {
                loop {
                    params.push(self.expect_ident()?);
                    self.type_annotation()?;
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(&TokenKind::RParen)?;
        }
        // Return type is accepted and ignored
        self.type_annotation()?;

        let body = self.block(|p| p.check_end(&keyword))?;
        let label = if keyword == TokenKind::Sub {
            "SUB"
        } else {
            "FUNCTION"
        };
        self.expect_end(&keyword, label)?;

        Ok(FunctionDecl {
            name,
            module: None,
            params,
            body,
        })
    }

    fn module_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // MODULE
        let name = self.expect_ident()?;
        let mut body = self.block(|p| p.check_end(&TokenKind::Module))?;

        for stmt in &mut body {
            match &mut stmt.kind {
                StmtKind::Function(decl) | StmtKind::Sub(decl) => {
                    decl.module = Some(name.clone());
                }
                _ => {
                    return Err(self.error_at_line(
                        "only FUNCTION and SUB are allowed inside MODULE",
                        stmt.line,
                    ));
                }
            }
        }
        self.expect_end(&TokenKind::Module, "MODULE")?;

        Ok(StmtKind::Module { name, body })
    }

    fn type_decl(&mut self) -> Result<StmtKind, String> {
        self.advance(); // TYPE
        let name = self.expect_ident()?;
        let mut fields = Vec::new();

        loop {
            self.skip_separators();
            if self.check_end(&TokenKind::Type) || self.is_at_end() {
                break;
            }
            let field = self.expect_ident()?;
            let field_type = self.type_annotation()?;
            let const_value = if self.match_token(&TokenKind::Eq) {
                Some(self.expression()?)
            } else {
                None
            };
            fields.push(TypeField {
                name: field,
                field_type,
                const_value,
            });
            self.end_of_statement()?;
        }
        self.expect_end(&TokenKind::Type, "TYPE")?;

        Ok(StmtKind::Type(TypeDecl { name, fields }))
    }

    fn entity_decl(&mut self) -> Result<StmtKind, String> {
        self.advance(); // ENTITY
        let name = self.expect_ident()?;
        let mut properties = Vec::new();

        loop {
            self.skip_separators();
            if self.check_end(&TokenKind::Entity) || self.is_at_end() {
                break;
            }
            let property = self.expect_ident()?;
            self.expect(&TokenKind::Eq)?;
            let value = self.expression()?;
            properties.push(EntityProperty {
                name: property,
                value,
            });
            self.end_of_statement()?;
        }
        self.expect_end(&TokenKind::Entity, "ENTITY")?;

        Ok(StmtKind::Entity(EntityDecl { name, properties }))
    }

    fn const_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // CONST
        let mut decls = Vec::new();

        loop {
            let name = self.expect_ident()?;
            self.type_annotation()?;
            self.expect(&TokenKind::Eq)?;
            let value = self.expression()?;
            decls.push(ConstDecl { name, value });
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        Ok(StmtKind::Const { decls })
    }

    /// `ENUM Name : a, b = 5, c` or a block closed by `END ENUM`.
    fn enum_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // ENUM
        let name = self.expect_ident()?;
        let mut members = Vec::new();

        if self.match_token(&TokenKind::Colon) {
            loop {
                members.push(self.enum_member()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
            return Ok(StmtKind::Enum { name, members });
        }

        loop {
            self.skip_separators();
            if self.check_end(&TokenKind::Enum) || self.is_at_end() {
                break;
            }
            members.push(self.enum_member()?);
            self.match_token(&TokenKind::Comma);
        }
        self.expect_end(&TokenKind::Enum, "ENUM")?;

        Ok(StmtKind::Enum { name, members })
    }

    fn enum_member(&mut self) -> Result<EnumMember, String> {
        let name = self.expect_ident()?;
        let value = if self.match_token(&TokenKind::Eq) {
            Some(self.expression()?)
        } else {
            None
        };
        Ok(EnumMember { name, value })
    }

    /// `ON KeyDown("ESCAPE") .. END ON`
    fn on_statement(&mut self) -> Result<StmtKind, String> {
        self.advance(); // ON
        let event = self.expect_ident()?;
        self.expect(&TokenKind::LParen)?;
        let key = match self.peek_kind() {
            Some(TokenKind::Str(s) | TokenKind::Ident(s)) => s.clone(),
            _ => return Err(self.error("expected key name")),
        };
        self.advance();
        self.expect(&TokenKind::RParen)?;

        let body = self.block(|p| p.check_end(&TokenKind::On))?;
        self.expect_end(&TokenKind::On, "ON")?;

        Ok(StmtKind::OnEvent { event, key, body })
    }

    fn loop_kind(&mut self, keyword: &str) -> Result<String, String> {
        let kind = match self.peek_kind() {
            Some(TokenKind::For) => "FOR",
            Some(TokenKind::While) => "WHILE",
            Some(TokenKind::Repeat) => "REPEAT",
            _ => return Err(self.error(&format!("expected FOR or WHILE after {}", keyword))),
        };
        self.advance();
        Ok(kind.to_string())
    }

    /// Assignment, compound assignment or call statement.
    fn simple_statement(&mut self) -> Result<StmtKind, String> {
        let target = self.postfix_expr()?;

        if self.match_token(&TokenKind::Eq) {
            let value = self.expression()?;
            return match target {
                Expr::Identifier { name } => Ok(StmtKind::Assign {
                    target: name,
                    indices: Vec::new(),
                    value,
                }),
                Expr::Call { name, args } if !name.contains('.') => Ok(StmtKind::Assign {
                    target: name,
                    indices: args,
                    value,
                }),
                Expr::MemberAccess { object, member } => match *object {
                    Expr::Identifier { name } => Ok(StmtKind::MemberAssign {
                        object: name,
                        member,
                        value,
                    }),
                    _ => Err(self.error("invalid assignment target")),
                },
                _ => Err(self.error("invalid assignment target")),
            };
        }

        if let Some(op) = self.compound_operator() {
            let Expr::Identifier { name } = target else {
                return Err(self.error("invalid compound assignment target"));
            };
            let value = self.expression()?;
            return Ok(StmtKind::CompoundAssign {
                target: name,
                op: op.to_string(),
                value,
            });
        }

        let expr = match target {
            // Command form: DrawText "hi", 10, 20
            Expr::Identifier { .. } | Expr::MemberAccess { .. } => {
                let name = target
                    .dotted_path()
                    .ok_or_else(|| self.error("expected statement"))?;
                let args = if self.at_statement_end() {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                Expr::call(name, args)
            }
            other => other,
        };

        Ok(StmtKind::Expr { expr })
    }

    fn compound_operator(&mut self) -> Option<&'static str> {
        let op = match self.peek_kind()? {
            TokenKind::PlusEq => "+",
            TokenKind::MinusEq => "-",
            TokenKind::StarEq => "*",
            TokenKind::SlashEq => "/",
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn type_annotation(&mut self) -> Result<Option<String>, String> {
        if self.match_token(&TokenKind::As) {
            Ok(Some(self.expect_ident()?))
        } else {
            Ok(None)
        }
    }

    // Expressions

    pub fn expression(&mut self) -> Result<Expr, String> {
        self.or_expr()
    }

    fn expression_list(&mut self) -> Result<Vec<Expr>, String> {
        let mut exprs = vec![self.expression()?];
        while self.match_token(&TokenKind::Comma) {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;

        loop {
            let op = if self.match_token(&TokenKind::Or) {
                "or"
            } else if self.match_token(&TokenKind::Xor) {
                "xor"
            } else {
                break;
            };
            let right = self.and_expr()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.not_expr()?;

        while self.match_token(&TokenKind::And) {
            let right = self.not_expr()?;
            left = Expr::binary("and", left, right);
        }

        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.match_token(&TokenKind::Not) {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: "not".to_string(),
                operand: Box::new(operand),
            });
        }
        self.cmp_expr()
    }

    fn cmp_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.add_expr()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Eq) => "=",
                Some(TokenKind::EqEq) => "==",
                Some(TokenKind::NotEq) => "<>",
                Some(TokenKind::Lt) => "<",
                Some(TokenKind::Le) => "<=",
                Some(TokenKind::Gt) => ">",
                Some(TokenKind::Ge) => ">=",
                _ => break,
            };
            self.advance();
            let right = self.add_expr()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    fn add_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.mul_expr()?;

        loop {
            let op = if self.match_token(&TokenKind::Plus) {
                "+"
            } else if self.match_token(&TokenKind::Minus) {
                "-"
            } else {
                break;
            };
            let right = self.mul_expr()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    fn mul_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.unary_expr()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => "*",
                Some(TokenKind::Slash) => "/",
                Some(TokenKind::Backslash) => "\\",
                Some(TokenKind::Percent | TokenKind::Mod) => "%",
                _ => break,
            };
            self.advance();
            let right = self.unary_expr()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Expr, String> {
        if self.match_token(&TokenKind::Minus) {
            let operand = self.unary_expr()?;
            return Ok(Expr::Unary {
                op: "-".to_string(),
                operand: Box::new(operand),
            });
        }
        if self.match_token(&TokenKind::Plus) {
            return self.unary_expr();
        }
        self.power_expr()
    }

    /// `^` binds tighter than unary minus and associates to the right.
    fn power_expr(&mut self) -> Result<Expr, String> {
        let base = self.postfix_expr()?;
        if self.match_token(&TokenKind::Caret) {
            let exponent = self.unary_expr()?;
            return Ok(Expr::binary("^", base, exponent));
        }
        Ok(base)
    }

    fn postfix_expr(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;

        loop {
            if self.match_token(&TokenKind::LParen) {
                let name = expr
                    .dotted_path()
                    .ok_or_else(|| self.error("only named functions can be called"))?;
                let args = if self.check(&TokenKind::RParen) {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                self.expect(&TokenKind::RParen)?;
                expr = Expr::Call { name, args };
            } else if self.match_token(&TokenKind::Dot) {
                let member = self.expect_ident()?;
                expr = Expr::MemberAccess {
                    object: Box::new(expr),
                    member,
                };
            } else if self.match_token(&TokenKind::LBracket) {
                let key = match self.peek_kind() {
                    Some(TokenKind::Str(s)) => s.clone(),
                    _ => return Err(self.error("expected string key")),
                };
                self.advance();
                self.expect(&TokenKind::RBracket)?;
                expr = Expr::JsonIndex {
                    object: Box::new(expr),
                    key,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        if let Some(TokenKind::Number(text)) = self.peek_kind() {
            let text = text.clone();
            self.advance();
            return Ok(Expr::Number { text });
        }

        if let Some(TokenKind::Str(value)) = self.peek_kind() {
            let value = value.clone();
            self.advance();
            return Ok(Expr::Str { value });
        }

        if self.match_token(&TokenKind::True) {
            return Ok(Expr::Bool { value: true });
        }

        if self.match_token(&TokenKind::False) {
            return Ok(Expr::Bool { value: false });
        }

        if self.match_token(&TokenKind::Nil) {
            return Ok(Expr::Nil);
        }

        if let Some(TokenKind::Ident(name)) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            return Ok(Expr::Identifier { name });
        }

        if self.match_token(&TokenKind::LParen) {
            let expr = self.expression()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(expr);
        }

        if self.match_token(&TokenKind::LBrace) {
            return self.dict_literal();
        }

        Err(self.error("expected expression"))
    }

    /// `{ "key": value, name: value }`; newlines are allowed between pairs.
    fn dict_literal(&mut self) -> Result<Expr, String> {
        let mut pairs = Vec::new();

        loop {
            self.skip_newlines();
            if self.match_token(&TokenKind::RBrace) {
                break;
            }
            let key = match self.peek_kind() {
                Some(TokenKind::Str(s) | TokenKind::Ident(s)) => s.clone(),
                _ => return Err(self.error("expected dictionary key")),
            };
            self.advance();
            self.expect(&TokenKind::Colon)?;
            let value = self.expression()?;
            pairs.push(DictPair { key, value });

            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                self.skip_newlines();
                self.expect(&TokenKind::RBrace)?;
                break;
            }
        }

        Ok(Expr::Dict { pairs })
    }

    // Helper methods

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn check_ident(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Ident(_)))
    }

    fn check_ahead(&self, kind: &TokenKind, offset: usize) -> bool {
        self.tokens
            .get(self.current + offset)
            .map(|t| &t.kind)
            == Some(kind)
    }

    /// `END <kind>` at the current position.
    fn check_end(&self, kind: &TokenKind) -> bool {
        self.check(&TokenKind::End) && self.check_ahead(kind, 1)
    }

    fn at_line_end_ahead(&self, offset: usize) -> bool {
        matches!(
            self.tokens.get(self.current + offset).map(|t| &t.kind),
            Some(TokenKind::Newline | TokenKind::Colon | TokenKind::Eof) | None
        )
    }

    fn at_statement_end(&self) -> bool {
        self.at_line_end_ahead(0) || self.check(&TokenKind::Else)
    }

    fn advance(&mut self) -> Option<&Token> {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens.get(self.current - 1)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_separators(&mut self) {
        while self.match_token(&TokenKind::Newline) || self.match_token(&TokenKind::Colon) {}
    }

    fn skip_newlines(&mut self) {
        while self.match_token(&TokenKind::Newline) {}
    }

    fn end_of_statement(&self) -> Result<(), String> {
        if self.at_line_end_ahead(0) {
            Ok(())
        } else {
            Err(self.error("expected end of statement"))
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), String> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", kind)))
        }
    }

    fn expect_end(&mut self, kind: &TokenKind, label: &str) -> Result<(), String> {
        if self.check_end(kind) {
            self.advance();
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected END {}", label)))
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        if let Some(TokenKind::Ident(name)) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("expected identifier"))
        }
    }

    fn current_span(&self) -> Span {
        self.peek().map(|t| t.span).unwrap_or(Span::new(1, 1))
    }

    fn error(&self, message: &str) -> String {
        let span = self.current_span();
        format!(
            "error: {}\n  --> {}:{}:{}",
            message, self.filename, span.line, span.column
        )
    }

    fn error_at_line(&self, message: &str, line: Option<usize>) -> String {
        match line {
            Some(line) => format!("error: {}\n  --> {}:{}:1", message, self.filename, line),
            None => self.error(message),
        }
    }
}
