use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source rules checked on every crate source file before compilation.
// A single violation fails the build with the offending lines listed.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenMarker,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenMarker,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ForbiddenMarker => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::AllCapsComment => r"^\s*//",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    // The build script quotes the patterns it searches for, so only the
    // identifier rule is applied to it.
    fn checks_build_script(self) -> bool {
        matches!(self, Rule::UnderscorePrefix)
    }

    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscorePrefix => {
                let in_comment = trimmed.starts_with("//");
                // Odd segments of a split on quotes lie inside string literals.
                let in_string = line
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !in_comment && !in_string
            }
            Rule::StarsInComment => !(trimmed.starts_with("///") || trimmed.starts_with("//!")),
            Rule::AllCapsComment => {
                let text = trimmed.trim_start_matches('/').trim_start_matches('!');
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(|c| c.is_uppercase())
            }
            Rule::ForbiddenMarker | Rule::AllowDeadCode => true,
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::ForbiddenMarker => {
                "Comments must describe the code as it is, not its edit history. Remove the marker."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in doc comments.",
            Rule::AllCapsComment => "Comments written entirely in capitals are not allowed.",
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Use the code or remove it."
            }
        }
    }
}

struct RuleCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl RuleCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: {} source policy violation(s) in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.explanation()));
        Some(message)
    }
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

// Every Rust file of the crate, skipping build output and examples/.
fn source_files() -> impl Iterator<Item = PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.path().starts_with("./target") && !e.path().starts_with("./examples"))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn check(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in source_files() {
        if !rule.checks_build_script() && path.file_name().is_some_and(|name| name == "build.rs") {
            continue;
        }
        let mut collector = RuleCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in ["engine", "morphing", "fisher", "cli", "tests", "benches"] {
        println!("cargo:rerun-if-changed={dir}");
    }

    for rule in Rule::ALL {
        if let Err(e) = check(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
