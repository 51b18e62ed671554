//! NM Script frontend: lexer, parser, validator, and bytecode compiler.
//!
//! The stages are exposed individually (the debugger reuses the expression
//! parser for breakpoint conditions, the editor wants tokens), plus a
//! [`compile_source`] convenience that runs the whole pipeline the way the
//! pack builder does.

pub mod ast;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod validator;

use nm_bytecode::CompiledScript;
use thiserror::Error;

pub use compiler::{CompileError, Compiler, MAX_CHOICE_OPTIONS};
pub use lexer::{LexError, LexErrorKind};
pub use parser::ParseError;
pub use validator::{Diagnostic, DiagnosticKind, Severity, ValidateOptions};

/// Aggregated failure of the front-end pipeline. Each stage short-circuits:
/// parse errors are not reported for a file that failed to lex, and so on.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("{} lex error(s), first: {}", .0.len(), .0[0])]
    Lex(Vec<LexError>),
    #[error("{} parse error(s), first: {}", .0.len(), .0[0])]
    Parse(Vec<ParseError>),
    #[error("validation failed: {}", .0.iter().map(|d| d.message.clone()).collect::<Vec<_>>().join("; "))]
    Validate(Vec<Diagnostic>),
    #[error("{} compile error(s), first: {}", .0.len(), .0[0])]
    Compile(Vec<CompileError>),
}

/// Lex, parse, validate, and compile a single script.
pub fn compile_source(
    source: &str,
    file: &str,
    options: ValidateOptions,
) -> Result<CompiledScript, FrontendError> {
    let program = check_source(source, options)?;
    Compiler::compile(&program, file).map_err(FrontendError::Compile)
}

/// Lex, parse, and validate without compiling. Used by preflight checks and
/// by multi-file builds that feed units into one [`Compiler`].
pub fn check_source(
    source: &str,
    options: ValidateOptions,
) -> Result<ast::Program, FrontendError> {
    let tokens = lexer::tokenize(source).map_err(FrontendError::Lex)?;
    let program = parser::parse(tokens).map_err(FrontendError::Parse)?;
    let diagnostics = validator::validate(&program, options);
    if validator::has_errors(&diagnostics) {
        return Err(FrontendError::Validate(
            diagnostics
                .into_iter()
                .filter(|d| d.severity == Severity::Error)
                .collect(),
        ));
    }
    Ok(program)
}

/// Parse a standalone expression, for debugger breakpoint conditions.
pub fn parse_expression(source: &str) -> Result<ast::Expr, FrontendError> {
    let tokens = lexer::tokenize(source).map_err(FrontendError::Lex)?;
    // Wrap as a bare expression statement and unwrap the single statement.
    let program = parser::parse(tokens).map_err(FrontendError::Parse)?;
    match program.global_statements.into_iter().next() {
        Some(ast::Stmt {
            kind: ast::StmtKind::Expression(expr),
            ..
        }) => Ok(expr),
        _ => Err(FrontendError::Parse(vec![ParseError::ExpectedExpression {
            found: source.to_string(),
            location: token::Location::new(1, 1),
        }])),
    }
}
