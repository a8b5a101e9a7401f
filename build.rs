use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Source directories held to the comment and attribute policy.
const SCANNED_DIRS: [&str; 4] = ["gam", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// The source rules, each with the message printed when it is broken.
#[derive(Clone, Copy)]
enum Rule {
    ForbiddenWords,
    StarsOutsideDocComments,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::ForbiddenWords => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsOutsideDocComments => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCapsComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::ForbiddenWords => {
                "Comments describing edits (FIXED, NEW, CHANGED, UPDATED and similar) are not allowed.\n   Remove them completely rather than commenting them out."
            }
            Rule::StarsOutsideDocComments => {
                "The '**' pattern is only allowed in doc comments (/// or //!)."
            }
            Rule::AllCapsComment => {
                "Comments where all alphabetic characters are uppercase are not allowed."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Either use the code or remove it completely."
            }
        }
    }

    /// Decides whether a line the pattern matched really breaks the rule.
    fn is_violation(self, line: &str) -> bool {
        match self {
            Rule::ForbiddenWords | Rule::AllowDeadCode => true,
            Rule::StarsOutsideDocComments => !is_doc_comment(line),
            Rule::AllCapsComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }
}

/// Collects the offending lines of one file.
struct RuleCollector {
    rule: Rule,
    violations: Vec<String>,
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

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SCANNED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let rules = [
        Rule::ForbiddenWords,
        Rule::StarsOutsideDocComments,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule) {
            // `eprintln!` is what shows the message in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Every `.rs` file under the scanned directories.
fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SCANNED_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = RuleCollector {
            rule,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, &path, &mut collector)?;
        if !collector.violations.is_empty() {
            return Err(report(&path, rule, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(path: &Path, rule: Rule, violations: &[String]) -> String {
    let mut msg = format!(
        "\n❌ ERROR: Found {} violations in {}:\n",
        violations.len(),
        path.display()
    );
    for violation in violations {
        msg.push_str(&format!("   {violation}\n"));
    }
    msg.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
    msg
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

/// The text of a line that is a comment, without its opening marker.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}
