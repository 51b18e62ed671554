//! Recursive-descent parser for NM Script.
//!
//! Parse errors accumulate rather than aborting: after an error the parser
//! resynchronizes at the next statement boundary so a single typo does not
//! hide every later problem in the file.

use crate::ast::*;
use crate::token::{Location, Token, TokenKind};
use nm_bytecode::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("{location}: unexpected token '{found}', expected {expected}")]
    UnexpectedToken {
        expected: String,
        found: String,
        location: Location,
    },
    #[error("{location}: '{found}' cannot start a statement (expected one of {accepted})")]
    ExpectedStatement {
        found: String,
        accepted: &'static str,
        location: Location,
    },
    #[error("{location}: expected an expression, found '{found}'")]
    ExpectedExpression { found: String, location: Location },
    #[error("{location}: block opened here is never closed")]
    UnclosedBlock { location: Location },
}

const STATEMENT_KEYWORDS: &str =
    "show, hide, say, choice, if, goto, wait, play, stop, set, transition, move, label";

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
}

/// Parse a token stream into a program. Returns every collected error if any
/// occurred; the partial AST is not exposed on failure.
pub fn parse(tokens: Vec<Token>) -> Result<Program, Vec<ParseError>> {
    Parser::new(tokens).run()
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Program, Vec<ParseError>> {
        let mut program = Program::default();
        while !self.at_eof() {
            match self.peek().kind {
                TokenKind::Character => {
                    if let Some(decl) = self.character_decl() {
                        program.characters.push(decl);
                    }
                }
                TokenKind::Scene => {
                    if let Some(scene) = self.scene_decl() {
                        program.scenes.push(scene);
                    }
                }
                _ => match self.statement() {
                    Some(stmt) => program.global_statements.push(stmt),
                    None => self.synchronize(),
                },
            }
        }
        if self.errors.is_empty() {
            Ok(program)
        } else {
            Err(self.errors)
        }
    }

    // --- token plumbing -----------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::EndOfFile
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            let token = self.peek().clone();
            self.errors.push(ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: describe(&token),
                location: token.location,
            });
            None
        }
    }

    /// Skip tokens until something that can plausibly begin a statement (or
    /// close the enclosing block), so one error does not cascade.
    fn synchronize(&mut self) {
        while !self.at_eof() {
            match self.peek().kind {
                TokenKind::Show
                | TokenKind::Hide
                | TokenKind::Say
                | TokenKind::Choice
                | TokenKind::If
                | TokenKind::Goto
                | TokenKind::Wait
                | TokenKind::Play
                | TokenKind::Stop
                | TokenKind::Set
                | TokenKind::Transition
                | TokenKind::Move
                | TokenKind::Label
                | TokenKind::Scene
                | TokenKind::Character
                | TokenKind::RightBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // --- declarations -------------------------------------------------------

    fn character_decl(&mut self) -> Option<CharacterDecl> {
        let keyword = self.advance();
        let id = self.expect(TokenKind::Identifier, "character id")?;
        let name = self.expect(TokenKind::Str, "character display name")?;
        // Optional colour literal (lexes as a string starting with '#').
        let color = if self.check(TokenKind::Str) {
            Some(self.advance().lexeme)
        } else {
            None
        };
        Some(CharacterDecl {
            id: id.lexeme,
            display_name: name.lexeme,
            color,
            location: keyword.location,
        })
    }

    fn scene_decl(&mut self) -> Option<SceneDecl> {
        let keyword = self.advance();
        let name = self.expect(TokenKind::Identifier, "scene name")?;
        let body = self.block()?;
        Some(SceneDecl {
            name: name.lexeme,
            body,
            location: keyword.location,
        })
    }

    fn block(&mut self) -> Option<Vec<Stmt>> {
        let open = self.expect(TokenKind::LeftBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.check(TokenKind::RightBrace) {
            if self.at_eof() {
                self.errors.push(ParseError::UnclosedBlock {
                    location: open.location,
                });
                return None;
            }
            match self.statement() {
                Some(stmt) => body.push(stmt),
                None => self.synchronize(),
            }
        }
        self.advance(); // '}'
        Some(body)
    }

    // --- statements ---------------------------------------------------------

    fn statement(&mut self) -> Option<Stmt> {
        let location = self.peek().location;
        let kind = match self.peek().kind {
            TokenKind::Show => self.show_stmt(),
            TokenKind::Hide => self.hide_stmt(),
            TokenKind::Say => self.say_stmt(),
            TokenKind::Choice => self.choice_stmt(),
            TokenKind::If => self.if_stmt(),
            TokenKind::Goto => {
                self.advance();
                let target = self.expect(TokenKind::Identifier, "scene or label name")?;
                Some(StmtKind::Goto(GotoStmt {
                    target: target.lexeme,
                }))
            }
            TokenKind::Wait => {
                self.advance();
                let duration = self.number("wait duration")?;
                Some(StmtKind::Wait(WaitStmt { duration }))
            }
            TokenKind::Play => self.play_stmt(),
            TokenKind::Stop => self.stop_stmt(),
            TokenKind::Set => self.set_stmt(),
            TokenKind::Transition => {
                self.advance();
                let kind = self.expect(TokenKind::Identifier, "transition type")?;
                let duration = self.number("transition duration")?;
                Some(StmtKind::Transition(TransitionStmt {
                    kind: kind.lexeme,
                    duration,
                }))
            }
            TokenKind::Move => self.move_stmt(),
            TokenKind::Label => {
                self.advance();
                let name = self.expect(TokenKind::Identifier, "label name")?;
                Some(StmtKind::Label(LabelStmt { name: name.lexeme }))
            }
            TokenKind::LeftBrace => Some(StmtKind::Block(self.block()?)),
            TokenKind::Identifier
            | TokenKind::Integer
            | TokenKind::Float
            | TokenKind::Str
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Not
            | TokenKind::Minus
            | TokenKind::LeftParen => {
                let expr = self.expression()?;
                Some(StmtKind::Expression(expr))
            }
            _ => {
                let token = self.advance();
                self.errors.push(ParseError::ExpectedStatement {
                    found: describe(&token),
                    accepted: STATEMENT_KEYWORDS,
                    location: token.location,
                });
                None
            }
        }?;
        Some(Stmt { kind, location })
    }

    fn show_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        // `show "res"` is a background; `show id [...]` is a character or,
        // with an explicit resource, a sprite.
        if self.check(TokenKind::Str) {
            let resource = self.advance().lexeme;
            let (transition, duration) = self.with_clause()?;
            return Some(StmtKind::Show(ShowStmt {
                target: ShowTarget::Background,
                identifier: String::new(),
                resource: Some(resource),
                position: None,
                transition,
                duration,
            }));
        }
        let id = self.expect(TokenKind::Identifier, "character id or background string")?;
        let resource = if self.check(TokenKind::Str) {
            Some(self.advance().lexeme)
        } else {
            None
        };
        let position = if self.eat(TokenKind::At) {
            Some(self.position()?)
        } else {
            None
        };
        let (transition, duration) = self.with_clause()?;
        let target = if resource.is_some() {
            ShowTarget::Sprite
        } else {
            ShowTarget::Character
        };
        Some(StmtKind::Show(ShowStmt {
            target,
            identifier: id.lexeme,
            resource,
            position,
            transition,
            duration,
        }))
    }

    fn hide_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let id = self.expect(TokenKind::Identifier, "character id")?;
        let (transition, duration) = self.with_clause()?;
        Some(StmtKind::Hide(HideStmt {
            identifier: id.lexeme,
            transition,
            duration,
        }))
    }

    /// Optional `with <transition> duration <seconds>` tail.
    fn with_clause(&mut self) -> Option<(Option<String>, Option<f32>)> {
        if !self.eat(TokenKind::With) {
            return Some((None, None));
        }
        let transition = self.expect(TokenKind::Identifier, "transition name")?;
        let duration = if self.eat(TokenKind::Duration) {
            Some(self.number("transition duration")?)
        } else {
            None
        };
        Some((Some(transition.lexeme), duration))
    }

    fn position(&mut self) -> Option<Position> {
        if self.eat(TokenKind::Custom) {
            return Some(Position::Custom);
        }
        let token = self.expect(TokenKind::Identifier, "position (left, center, right, custom)")?;
        match token.lexeme.as_str() {
            "left" => Some(Position::Left),
            "center" => Some(Position::Center),
            "right" => Some(Position::Right),
            _ => {
                self.errors.push(ParseError::UnexpectedToken {
                    expected: "position (left, center, right, custom)".to_string(),
                    found: token.lexeme,
                    location: token.location,
                });
                None
            }
        }
    }

    fn say_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let speaker = if self.check(TokenKind::Identifier) {
            Some(self.advance().lexeme)
        } else {
            None
        };
        let text = self.expect(TokenKind::Str, "dialogue string")?;
        Some(StmtKind::Say(SayStmt {
            speaker,
            text: text.lexeme,
        }))
    }

    fn choice_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let open = self.expect(TokenKind::LeftBrace, "'{'")?;
        let mut options = Vec::new();
        while !self.check(TokenKind::RightBrace) {
            if self.at_eof() {
                self.errors.push(ParseError::UnclosedBlock {
                    location: open.location,
                });
                return None;
            }
            let text = self.expect(TokenKind::Str, "choice option text")?;
            let condition = if self.eat(TokenKind::If) {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(TokenKind::Arrow, "'->'")?;
            let (goto_target, body) = if self.check(TokenKind::LeftBrace) {
                (None, self.block()?)
            } else {
                let target = self.expect(TokenKind::Identifier, "scene name or '{'")?;
                (Some(target.lexeme), Vec::new())
            };
            options.push(ChoiceOption {
                text: text.lexeme,
                condition,
                goto_target,
                body,
            });
        }
        let close = self.advance(); // '}'
        if options.is_empty() {
            self.errors.push(ParseError::UnexpectedToken {
                expected: "at least one choice option".to_string(),
                found: describe(&close),
                location: close.location,
            });
            return None;
        }
        Some(StmtKind::Choice(ChoiceStmt { options }))
    }

    fn if_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let condition = self.expression()?;
        let then_branch = self.block()?;
        let else_branch = if self.eat(TokenKind::Else) {
            if self.check(TokenKind::If) {
                let location = self.peek().location;
                let nested = self.if_stmt()?;
                vec![Stmt {
                    kind: nested,
                    location,
                }]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Some(StmtKind::If(IfStmt {
            condition,
            then_branch,
            else_branch,
        }))
    }

    fn play_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let media = if self.eat(TokenKind::Music) {
            MediaKind::Music
        } else if self.eat(TokenKind::Sound) {
            MediaKind::Sound
        } else {
            let token = self.peek().clone();
            self.errors.push(ParseError::UnexpectedToken {
                expected: "'music' or 'sound'".to_string(),
                found: describe(&token),
                location: token.location,
            });
            return None;
        };
        let resource = self.expect(TokenKind::Str, "resource path string")?;
        Some(StmtKind::Play(PlayStmt {
            media,
            resource: resource.lexeme,
        }))
    }

    fn stop_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        self.expect(TokenKind::Music, "'music'")?;
        let fadeout = if self.eat(TokenKind::Fadeout) {
            Some(self.number("fadeout seconds")?)
        } else {
            None
        };
        Some(StmtKind::Stop(StopStmt { fadeout }))
    }

    fn set_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let name = self.expect(TokenKind::Identifier, "variable or flag name")?;
        if self.eat(TokenKind::Assign) {
            let value = self.expression()?;
            Some(StmtKind::Set(SetStmt {
                variable: name.lexeme,
                value,
                is_flag: false,
            }))
        } else {
            // Bare `set name` raises the flag.
            let location = name.location;
            Some(StmtKind::Set(SetStmt {
                variable: name.lexeme,
                value: Expr {
                    kind: ExprKind::Literal(Value::Bool(true)),
                    location,
                },
                is_flag: true,
            }))
        }
    }

    fn move_stmt(&mut self) -> Option<StmtKind> {
        self.advance();
        let id = self.expect(TokenKind::Identifier, "character id")?;
        self.expect(TokenKind::To, "'to'")?;
        let position = self.position()?;
        let (custom_x, custom_y) = if position == Position::Custom {
            let x = self.number("custom x coordinate")?;
            let y = self.number("custom y coordinate")?;
            (Some(x), Some(y))
        } else {
            (None, None)
        };
        self.expect(TokenKind::Duration, "'duration'")?;
        let duration = self.number("move duration")?;
        Some(StmtKind::Move(MoveStmt {
            character_id: id.lexeme,
            position,
            custom_x,
            custom_y,
            duration,
        }))
    }

    /// Accepts an integer or float literal and yields it as f32.
    fn number(&mut self, what: &str) -> Option<f32> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Float => {
                self.advance();
                token.float_value
            }
            TokenKind::Integer => {
                self.advance();
                token.int_value.map(|v| v as f32)
            }
            _ => {
                self.errors.push(ParseError::UnexpectedToken {
                    expected: what.to_string(),
                    found: describe(&token),
                    location: token.location,
                });
                None
            }
        }
    }

    // --- expressions --------------------------------------------------------

    fn expression(&mut self) -> Option<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Option<Expr> {
        let mut left = self.and_expr()?;
        while self.check(TokenKind::Or) {
            let location = self.advance().location;
            let right = self.and_expr()?;
            left = binary(BinaryOp::Or, left, right, location);
        }
        Some(left)
    }

    fn and_expr(&mut self) -> Option<Expr> {
        let mut left = self.equality()?;
        while self.check(TokenKind::And) {
            let location = self.advance().location;
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right, location);
        }
        Some(left)
    }

    fn equality(&mut self) -> Option<Expr> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Equal => BinaryOp::Eq,
                TokenKind::NotEqual => BinaryOp::Ne,
                _ => break,
            };
            let location = self.advance().location;
            let right = self.comparison()?;
            left = binary(op, left, right, location);
        }
        Some(left)
    }

    fn comparison(&mut self) -> Option<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::LessEqual => BinaryOp::Le,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::GreaterEqual => BinaryOp::Ge,
                _ => break,
            };
            let location = self.advance().location;
            let right = self.additive()?;
            left = binary(op, left, right, location);
        }
        Some(left)
    }

    fn additive(&mut self) -> Option<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let location = self.advance().location;
            let right = self.multiplicative()?;
            left = binary(op, left, right, location);
        }
        Some(left)
    }

    fn multiplicative(&mut self) -> Option<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let location = self.advance().location;
            let right = self.unary()?;
            left = binary(op, left, right, location);
        }
        Some(left)
    }

    fn unary(&mut self) -> Option<Expr> {
        let op = match self.peek().kind {
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            let location = self.advance().location;
            let operand = self.unary()?;
            return Some(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                location,
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let location = token.location;
        let kind = match token.kind {
            TokenKind::Integer => {
                self.advance();
                ExprKind::Literal(Value::Int(token.int_value.unwrap_or(0)))
            }
            TokenKind::Float => {
                self.advance();
                ExprKind::Literal(Value::Float(token.float_value.unwrap_or(0.0)))
            }
            TokenKind::Str => {
                self.advance();
                ExprKind::Literal(Value::String(token.lexeme))
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Literal(Value::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Literal(Value::Bool(false))
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RightParen, "')'")?;
                return Some(inner);
            }
            TokenKind::Identifier => {
                self.advance();
                if self.check(TokenKind::LeftParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RightParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RightParen, "')'")?;
                    ExprKind::Call {
                        callee: token.lexeme,
                        args,
                    }
                } else {
                    ExprKind::Identifier(token.lexeme)
                }
            }
            _ => {
                self.advance();
                self.errors.push(ParseError::ExpectedExpression {
                    found: describe(&token),
                    location,
                });
                return None;
            }
        };
        let mut expr = Expr { kind, location };
        // Property access chains: `hero.mood.intensity`.
        while self.eat(TokenKind::Dot) {
            let prop = self.expect(TokenKind::Identifier, "property name")?;
            expr = Expr {
                kind: ExprKind::Property {
                    object: Box::new(expr),
                    property: prop.lexeme,
                },
                location: prop.location,
            };
        }
        Some(expr)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, location: Location) -> Expr {
    Expr {
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        location,
    }
}

fn describe(token: &Token) -> String {
    if token.kind == TokenKind::EndOfFile {
        "end of file".to_string()
    } else {
        token.lexeme.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_ok(src: &str) -> Program {
        parse(tokenize(src).unwrap()).unwrap()
    }

    fn parse_err(src: &str) -> Vec<ParseError> {
        parse(tokenize(src).unwrap()).unwrap_err()
    }

    #[test]
    fn parses_character_and_scene() {
        let program = parse_ok(
            r##"
            character hero "Hero" #4a90d9
            scene main {
                say hero "Hello"
                goto finale
            }
            "##,
        );
        assert_eq!(program.characters.len(), 1);
        assert_eq!(program.characters[0].id, "hero");
        assert_eq!(program.characters[0].color.as_deref(), Some("#4a90d9"));
        assert_eq!(program.scenes.len(), 1);
        assert_eq!(program.scenes[0].body.len(), 2);
    }

    #[test]
    fn parses_choice_with_goto_and_body() {
        let program = parse_ok(
            r#"
            scene node_8 {
                choice {
                    "Option A" -> { say "You chose A" }
                    "Option B" if trust > 2 -> node_9
                }
            }
            "#,
        );
        let StmtKind::Choice(choice) = &program.scenes[0].body[0].kind else {
            panic!("expected choice");
        };
        assert_eq!(choice.options.len(), 2);
        assert!(choice.options[0].goto_target.is_none());
        assert_eq!(choice.options[0].body.len(), 1);
        assert_eq!(choice.options[1].goto_target.as_deref(), Some("node_9"));
        assert!(choice.options[1].condition.is_some());
    }

    #[test]
    fn parses_show_variants() {
        let program = parse_ok(
            r#"
            scene main {
                show "bg/forest.png"
                show hero at left
                show hero "sprites/hero_happy.png" at custom with fade duration 0.5
            }
            "#,
        );
        let stmts = &program.scenes[0].body;
        let StmtKind::Show(bg) = &stmts[0].kind else { panic!() };
        assert_eq!(bg.target, ShowTarget::Background);
        let StmtKind::Show(ch) = &stmts[1].kind else { panic!() };
        assert_eq!(ch.target, ShowTarget::Character);
        assert_eq!(ch.position, Some(Position::Left));
        let StmtKind::Show(sp) = &stmts[2].kind else { panic!() };
        assert_eq!(sp.target, ShowTarget::Sprite);
        assert_eq!(sp.transition.as_deref(), Some("fade"));
        assert_eq!(sp.duration, Some(0.5));
    }

    #[test]
    fn parses_move_with_custom_coordinates() {
        let program = parse_ok("scene s { move hero to custom 0.25 0.75 duration 1.5 }");
        let StmtKind::Move(mv) = &program.scenes[0].body[0].kind else { panic!() };
        assert_eq!(mv.position, Position::Custom);
        assert_eq!(mv.custom_x, Some(0.25));
        assert_eq!(mv.custom_y, Some(0.75));
        assert_eq!(mv.duration, 1.5);
    }

    #[test]
    fn parses_set_variable_and_flag() {
        let program = parse_ok("scene s { set trust = trust + 1 set met_hero }");
        let StmtKind::Set(var) = &program.scenes[0].body[0].kind else { panic!() };
        assert!(!var.is_flag);
        let StmtKind::Set(flag) = &program.scenes[0].body[1].kind else { panic!() };
        assert!(flag.is_flag);
        assert_eq!(flag.variable, "met_hero");
    }

    #[test]
    fn expression_precedence() {
        let program = parse_ok("scene s { set x = 1 + 2 * 3 }");
        let StmtKind::Set(set) = &program.scenes[0].body[0].kind else { panic!() };
        let ExprKind::Binary { op: BinaryOp::Add, right, .. } = &set.value.kind else {
            panic!("expected + at the top");
        };
        assert!(matches!(
            right.kind,
            ExprKind::Binary { op: BinaryOp::Mul, .. }
        ));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let program = parse_ok("scene s { set x = a or b and c }");
        let StmtKind::Set(set) = &program.scenes[0].body[0].kind else { panic!() };
        let ExprKind::Binary { op: BinaryOp::Or, right, .. } = &set.value.kind else {
            panic!("expected or at the top");
        };
        assert!(matches!(
            right.kind,
            ExprKind::Binary { op: BinaryOp::And, .. }
        ));
    }

    #[test]
    fn unknown_statement_start_reports_accepted_set() {
        let errors = parse_err("scene s { -> }");
        assert!(errors.iter().any(|e| matches!(
            e,
            ParseError::ExpectedStatement { accepted, .. } if accepted.contains("choice")
        )));
    }

    #[test]
    fn error_recovery_collects_multiple_errors() {
        let errors = parse_err(
            r#"
            scene a { goto }
            scene b { wait "soon" }
            "#,
        );
        assert!(errors.len() >= 2, "{errors:?}");
    }

    #[test]
    fn unclosed_scene_block_is_reported() {
        let errors = parse_err("scene a { say \"hi\"");
        assert!(errors
            .iter()
            .any(|e| matches!(e, ParseError::UnclosedBlock { .. })));
    }

    #[test]
    fn else_if_chains() {
        let program = parse_ok(
            r#"scene s { if x > 1 { say "a" } else if x > 0 { say "b" } else { say "c" } }"#,
        );
        let StmtKind::If(stmt) = &program.scenes[0].body[0].kind else { panic!() };
        assert_eq!(stmt.then_branch.len(), 1);
        let StmtKind::If(nested) = &stmt.else_branch[0].kind else {
            panic!("expected nested if");
        };
        assert_eq!(nested.else_branch.len(), 1);
    }
}
