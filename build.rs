use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Directories holding the crate's own Rust sources.
const SOURCE_DIRS: [&str; 6] = ["fit", "shared", "cv", "cli", "tests", "benches"];

const EDIT_MARKERS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// One source policy: a line regex, a second look at each matching line, and the advice
/// printed when it fires.
struct Rule {
    name: &'static str,
    pattern: String,
    accept: fn(&str) -> bool,
    advice: &'static str,
    covers_build_script: bool,
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed binding",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: is_code_binding,
            advice: "Use the binding without the underscore or delete it.",
            covers_build_script: true,
        },
        Rule {
            name: "edit marker in a comment",
            pattern: format!(r"(//|/\*).*(?:{EDIT_MARKERS})"),
            accept: |_| true,
            advice: "Comments describe the code as it is, not the history of an edit.",
            covers_build_script: false,
        },
        Rule {
            name: "bold marker in a plain comment",
            pattern: r"(//|/\*).*\*\*".to_string(),
            accept: |line| !line.trim_start().starts_with("///"),
            advice: "Bold markers are only allowed in doc comments.",
            covers_build_script: false,
        },
        Rule {
            name: "all-caps comment",
            pattern: r"(//|/\*).*".to_string(),
            accept: is_shouted_comment,
            advice: "Write the comment in sentence case or delete it.",
            covers_build_script: false,
        },
        Rule {
            name: "dead code allowance",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: |_| true,
            advice: "Use the item or delete it.",
            covers_build_script: false,
        },
    ]
}

/// Skips comment lines and matches that sit inside a string literal.
fn is_code_binding(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") || trimmed.starts_with("/*") {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn is_shouted_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let body = if let Some(rest) = trimmed.strip_prefix("//") {
        rest.trim_start_matches(['/', '!'])
    } else if let Some(start) = line.find("/*") {
        let rest = &line[start + 2..];
        rest.split("*/").next().unwrap_or(rest)
    } else {
        return false;
    };
    let mut letters = body.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

struct Violations<'r> {
    rule: &'r Rule,
    lines: Vec<String>,
}

impl Sink for Violations<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let text = String::from_utf8_lossy(mat.bytes());
        let text = text.trim_end();
        if (self.rule.accept)(text) {
            let number = mat.line_number().unwrap_or(0);
            self.lines.push(format!("{number}:{text}"));
        }
        Ok(true)
    }
}

fn crate_sources(include_build_script: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect();
    if include_build_script {
        files.push(PathBuf::from("build.rs"));
    }
    files
}

fn check(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    let mut report = String::new();
    for path in crate_sources(rule.covers_build_script) {
        let mut found = Violations {
            rule,
            lines: Vec::new(),
        };
        searcher.search_path(&matcher, &path, &mut found)?;
        for line in found.lines {
            report.push_str(&format!("   {}:{line}\n", path.display()));
        }
    }
    if report.is_empty() {
        Ok(())
    } else {
        Err(format!("\nsource policy violated ({}):\n{report}{}\n", rule.name, rule.advice).into())
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let failures: Vec<String> = rules()
        .iter()
        .filter_map(|rule| check(rule).err().map(|e| e.to_string()))
        .collect();
    if !failures.is_empty() {
        eprintln!("{}", failures.join(""));
        std::process::exit(1);
    }
}
