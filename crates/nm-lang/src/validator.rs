//! Static checks over the AST, run between parsing and compilation.
//!
//! Errors here stop the build; warnings are surfaced through the diagnostics
//! list (and logged) but do not. Unused/unreachable analysis can be switched
//! off for generated scripts.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    DuplicateScene,
    DuplicateCharacter,
    UnknownGotoTarget,
    UnusedSymbol,
    UnreachableScene,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub location: Option<crate::token::Location>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    pub warn_unused: bool,
    pub warn_unreachable: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            warn_unused: true,
            warn_unreachable: true,
        }
    }
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Error)
}

/// Single walk over the program collecting declaration and reference sets,
/// then cross-checking them.
pub fn validate(program: &Program, options: ValidateOptions) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let mut scenes: BTreeMap<&str, &SceneDecl> = BTreeMap::new();
    for scene in &program.scenes {
        if scenes.insert(scene.name.as_str(), scene).is_some() {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                kind: DiagnosticKind::DuplicateScene,
                message: format!("scene '{}' is declared more than once", scene.name),
                location: Some(scene.location),
                suggestions: Vec::new(),
            });
        }
    }

    let mut characters: BTreeSet<&str> = BTreeSet::new();
    for decl in &program.characters {
        if !characters.insert(decl.id.as_str()) {
            diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                kind: DiagnosticKind::DuplicateCharacter,
                message: format!("character '{}' is declared more than once", decl.id),
                location: Some(decl.location),
                suggestions: Vec::new(),
            });
        }
    }

    let mut refs = References::default();
    for scene in &program.scenes {
        refs.walk(&scene.body);
    }
    refs.walk(&program.global_statements);

    // Labels are valid goto targets alongside scenes.
    let known_targets: BTreeSet<&str> = scenes
        .keys()
        .copied()
        .chain(refs.labels.iter().map(String::as_str))
        .collect();

    for (target, location) in &refs.goto_targets {
        if !known_targets.contains(target.as_str()) {
            let suggestions = similar_names(target, known_targets.iter().copied());
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                kind: DiagnosticKind::UnknownGotoTarget,
                message: format!("goto target '{target}' does not name a scene or label"),
                location: Some(*location),
                suggestions,
            });
        }
    }

    if options.warn_unused {
        for decl in &program.characters {
            if !refs.character_uses.contains(&decl.id) {
                diagnostics.push(Diagnostic {
                    severity: Severity::Warning,
                    kind: DiagnosticKind::UnusedSymbol,
                    message: format!("character '{}' is never used", decl.id),
                    location: Some(decl.location),
                    suggestions: Vec::new(),
                });
            }
        }
    }

    if options.warn_unreachable {
        let targeted: BTreeSet<&str> = refs
            .goto_targets
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        for scene in &program.scenes {
            if scene.name != "main" && !targeted.contains(scene.name.as_str()) {
                diagnostics.push(Diagnostic {
                    severity: Severity::Warning,
                    kind: DiagnosticKind::UnreachableScene,
                    message: format!(
                        "scene '{}' has no incoming goto and is not the entry scene",
                        scene.name
                    ),
                    location: Some(scene.location),
                    suggestions: Vec::new(),
                });
            }
        }
    }

    for d in &diagnostics {
        if d.severity == Severity::Warning {
            tracing::warn!(target: "lang.validate", message = %d.message, "script warning");
        }
    }

    diagnostics
}

#[derive(Default)]
struct References {
    goto_targets: Vec<(String, crate::token::Location)>,
    character_uses: BTreeSet<String>,
    labels: BTreeSet<String>,
}

impl References {
    fn walk(&mut self, statements: &[Stmt]) {
        for stmt in statements {
            match &stmt.kind {
                StmtKind::Goto(g) => self.goto_targets.push((g.target.clone(), stmt.location)),
                StmtKind::Label(l) => {
                    self.labels.insert(l.name.clone());
                }
                StmtKind::Show(s) => {
                    if !s.identifier.is_empty() {
                        self.character_uses.insert(s.identifier.clone());
                    }
                }
                StmtKind::Hide(h) => {
                    self.character_uses.insert(h.identifier.clone());
                }
                StmtKind::Move(m) => {
                    self.character_uses.insert(m.character_id.clone());
                }
                StmtKind::Say(s) => {
                    if let Some(speaker) = &s.speaker {
                        self.character_uses.insert(speaker.clone());
                    }
                }
                StmtKind::Choice(c) => {
                    for option in &c.options {
                        if let Some(target) = &option.goto_target {
                            self.goto_targets.push((target.clone(), stmt.location));
                        }
                        self.walk(&option.body);
                    }
                }
                StmtKind::If(i) => {
                    self.walk(&i.then_branch);
                    self.walk(&i.else_branch);
                }
                StmtKind::Block(body) => self.walk(body),
                _ => {}
            }
        }
    }
}

/// Up to three candidates within edit distance 2, closest first.
pub(crate) fn similar_names<'a>(
    target: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = candidates
        .into_iter()
        .filter_map(|name| {
            let d = edit_distance(target, name);
            (d > 0 && d <= 2).then_some((d, name))
        })
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, s)| s.to_string()).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn program(src: &str) -> Program {
        parse(tokenize(src).unwrap()).unwrap()
    }

    #[test]
    fn duplicate_scene_is_an_error() {
        let diags = validate(
            &program("scene a { say \"x\" } scene a { say \"y\" }"),
            ValidateOptions::default(),
        );
        assert!(diags
            .iter()
            .any(|d| d.kind == DiagnosticKind::DuplicateScene && d.severity == Severity::Error));
    }

    #[test]
    fn duplicate_character_is_a_warning() {
        let diags = validate(
            &program("character h \"H\" character h \"H2\" scene main { say h \"hi\" }"),
            ValidateOptions::default(),
        );
        assert!(diags
            .iter()
            .any(|d| d.kind == DiagnosticKind::DuplicateCharacter
                && d.severity == Severity::Warning));
    }

    #[test]
    fn unknown_goto_suggests_near_matches() {
        let diags = validate(
            &program("scene prologue { goto prolog } scene main { goto prologue }"),
            ValidateOptions::default(),
        );
        let missing = diags
            .iter()
            .find(|d| d.kind == DiagnosticKind::UnknownGotoTarget)
            .expect("missing-target diagnostic");
        assert_eq!(missing.suggestions, vec!["prologue".to_string()]);
    }

    #[test]
    fn suggestions_cap_at_three() {
        let names = ["node_1", "node_2", "node_3", "node_4"];
        let out = similar_names("node_0", names);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn choice_goto_targets_are_checked() {
        let diags = validate(
            &program("scene main { choice { \"a\" -> nowheer } }"),
            ValidateOptions::default(),
        );
        assert!(has_errors(&diags));
    }

    #[test]
    fn label_is_a_valid_goto_target() {
        let diags = validate(
            &program("scene main { label retry say \"x\" goto retry }"),
            ValidateOptions::default(),
        );
        assert!(!has_errors(&diags));
    }

    #[test]
    fn unused_character_and_unreachable_scene_warn() {
        let diags = validate(
            &program("character ghost \"G\" scene main { say \"x\" } scene island { say \"y\" }"),
            ValidateOptions::default(),
        );
        assert!(diags.iter().any(|d| d.kind == DiagnosticKind::UnusedSymbol));
        assert!(diags
            .iter()
            .any(|d| d.kind == DiagnosticKind::UnreachableScene && d.message.contains("island")));
    }

    #[test]
    fn warnings_can_be_disabled() {
        let diags = validate(
            &program("character ghost \"G\" scene main { say \"x\" } scene island { say \"y\" }"),
            ValidateOptions {
                warn_unused: false,
                warn_unreachable: false,
            },
        );
        assert!(diags.is_empty());
    }
}
