//! Static risk analysis of submitted strategy source (Python, the format
//! the platform accepts from users).
//!
//! The validator is pure and deterministic: it strips comments and string
//! literals with a small lexer, then scores the remaining code against a
//! fixed rule table (forbidden imports and builtins, file I/O, reflection,
//! dangerous dunder attributes, builtin shadowing, lambda-wrapped eval,
//! infinite-loop literals). The accumulated score maps to a risk level;
//! code is valid only with no critical violation and a sub-critical level.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Modules whose import is forbidden outright (process control, filesystem,
/// network, IPC, serialization of arbitrary objects, threading, signals).
static FORBIDDEN_MODULES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "os",
        "sys",
        "subprocess",
        "socket",
        "urllib",
        "urllib2",
        "urllib3",
        "requests",
        "httpx",
        "aiohttp",
        "http",
        "ftplib",
        "smtplib",
        "pickle",
        "shelve",
        "marshal",
        "ctypes",
        "multiprocessing",
        "threading",
        "asyncio",
        "signal",
        "pty",
        "tty",
        "atexit",
    ])
});

/// Modules a strategy may import without a warning (numeric/time/typing
/// utilities available inside the sandbox image).
static ALLOWED_MODULES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "numpy",
        "pandas",
        "ta",
        "talib",
        "datetime",
        "math",
        "random",
        "json",
        "orjson",
        "typing",
        "enum",
        "dataclasses",
        "decimal",
        "fractions",
        "statistics",
        "collections",
        "itertools",
        "functools",
        "operator",
        "time",
        "calendar",
        "warnings",
        "logging",
        "traceback",
        "re",
    ])
});

const FORBIDDEN_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "input",
    "execfile",
    "file",
    "reload",
];

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s+(.+)$").unwrap());
static FROM_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").unwrap());
static BUILTIN_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(eval|exec|compile|__import__|open|input|execfile|file|reload)\s*\(").unwrap()
});
static FILE_IO_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(open|read|write)\s*\(").unwrap());
static REFLECTION_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(getattr|setattr|delattr|hasattr)\s*\(").unwrap());
static DANGEROUS_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\.\s*(__dict__|__class__|__bases__|__subclasses__|__globals__|__code__|__closure__|__builtins__)\b",
    )
    .unwrap()
});
static BUILTIN_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(eval|exec|compile|__import__|open|input|execfile|file|reload)\s*=[^=]")
        .unwrap()
});
static LAMBDA_EXEC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\blambda\b.*\b(eval|exec)\s*\(").unwrap());
static WHILE_TRUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*while\s+True\s*:").unwrap());
static DEF_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bdef\s+\w+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Score below 30: eligible for automatic execution.
    Low,
    /// 30..70: review recommended.
    Medium,
    /// 70..90: blocked from automatic execution.
    High,
    /// 90 and above: rejected outright.
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=29 => RiskLevel::Low,
            30..=69 => RiskLevel::Medium,
            70..=89 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: String,
    pub message: String,
    pub points: u32,
    pub line: Option<usize>,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Stateless validator; each [`CodeValidator::validate`] call is
/// independent.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeValidator;

impl CodeValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, source: &str) -> ValidationResult {
        let mut scan = Scan::default();

        if source.trim().is_empty() {
            scan.violation("empty_code", "Empty code provided", 0, None, false);
            return scan.finish();
        }

        let lines = match strip_source(source) {
            Ok(lines) => lines,
            Err(issue) => {
                scan.violation("syntax_error", &issue.message, 5, issue.line, false);
                return scan.finish();
            }
        };

        for (line_no, text) in &lines {
            scan.check_imports(*line_no, text);
            scan.check_calls(*line_no, text);
            scan.check_attributes(*line_no, text);
            scan.check_assignments(*line_no, text);
            scan.check_patterns(*line_no, text);
        }
        scan.finish()
    }
}

#[derive(Default)]
struct Scan {
    violations: Vec<Violation>,
    warnings: Vec<String>,
    risk_score: u32,
}

impl Scan {
    fn violation(
        &mut self,
        kind: &str,
        message: &str,
        points: u32,
        line: Option<usize>,
        critical: bool,
    ) {
        tracing::debug!(
            target: "strata::validator",
            kind,
            message,
            line,
            points,
            "violation"
        );
        self.violations.push(Violation {
            kind: kind.to_string(),
            message: message.to_string(),
            points,
            line,
            critical,
        });
        self.risk_score += points;
    }

    fn warning(&mut self, message: String, points: u32) {
        self.warnings.push(message);
        self.risk_score += points;
    }

    fn check_module(&mut self, module: &str, line: usize) {
        if FORBIDDEN_MODULES.contains(module) {
            self.violation(
                "blacklist_module",
                &format!("Blacklisted module: {}", module),
                30,
                Some(line),
                true,
            );
        } else if !ALLOWED_MODULES.contains(module) {
            self.warning(
                format!(
                    "Unknown module '{}' on line {}. May not be available in sandbox.",
                    module, line
                ),
                1,
            );
        }
    }

    fn check_imports(&mut self, line: usize, text: &str) {
        if let Some(caps) = FROM_IMPORT_RE.captures(text) {
            let root = caps[1].split('.').next().unwrap_or("");
            if !root.is_empty() {
                self.check_module(root, line);
            }
            return;
        }
        if let Some(caps) = IMPORT_RE.captures(text) {
            for part in caps[1].split(',') {
                let name = part.split_whitespace().next().unwrap_or("");
                let root = name.split('.').next().unwrap_or("");
                if !root.is_empty() {
                    self.check_module(root, line);
                }
            }
        }
    }

    fn check_calls(&mut self, line: usize, text: &str) {
        // A `def open(...)` line defines, it does not call.
        let text = DEF_NAME_RE.replace_all(text, "def");
        for caps in BUILTIN_CALL_RE.captures_iter(&text) {
            self.violation(
                "blacklist_builtin",
                &format!("Dangerous builtin function: {}", &caps[1]),
                30,
                Some(line),
                true,
            );
        }
        for caps in FILE_IO_CALL_RE.captures_iter(&text) {
            self.violation(
                "file_io",
                &format!("File I/O operation: {}", &caps[1]),
                30,
                Some(line),
                true,
            );
        }
        for caps in REFLECTION_CALL_RE.captures_iter(&text) {
            self.violation(
                "reflection",
                &format!("Reflection operation: {}", &caps[1]),
                15,
                Some(line),
                false,
            );
        }
    }

    fn check_attributes(&mut self, line: usize, text: &str) {
        for caps in DANGEROUS_ATTR_RE.captures_iter(text) {
            self.violation(
                "dangerous_attribute",
                &format!("Dangerous attribute access: {}", &caps[1]),
                20,
                Some(line),
                true,
            );
        }
    }

    fn check_assignments(&mut self, line: usize, text: &str) {
        if let Some(caps) = BUILTIN_ASSIGN_RE.captures(text) {
            self.violation(
                "builtin_override",
                &format!("Overriding builtin: {}", &caps[1]),
                10,
                Some(line),
                false,
            );
        }
    }

    fn check_patterns(&mut self, line: usize, text: &str) {
        if LAMBDA_EXEC_RE.is_match(text) {
            self.violation(
                "lambda_exec",
                "Lambda with exec/eval",
                25,
                Some(line),
                true,
            );
        }
        if WHILE_TRUE_RE.is_match(text) {
            self.warning(format!("Potential infinite loop on line {}", line), 5);
        }
    }

    fn finish(mut self) -> ValidationResult {
        let risk_level = RiskLevel::from_score(self.risk_score);
        let has_critical = self.violations.iter().any(|v| v.critical);
        let is_valid = !has_critical && risk_level != RiskLevel::Critical;

        let mut recommendations = Vec::new();
        if !is_valid {
            recommendations.push(
                "Code contains critical security violations. Remove blacklisted modules/functions."
                    .to_string(),
            );
        } else if risk_level == RiskLevel::High {
            recommendations
                .push("High risk score. Consider manual review before execution.".to_string());
        } else if risk_level == RiskLevel::Medium {
            recommendations
                .push("Medium risk score. Review warnings and consider refactoring.".to_string());
        }

        ValidationResult {
            is_valid,
            risk_score: self.risk_score,
            risk_level,
            violations: std::mem::take(&mut self.violations),
            warnings: std::mem::take(&mut self.warnings),
            recommendations,
        }
    }
}

struct SyntaxIssue {
    message: String,
    line: Option<usize>,
}

/// Blank out comments and string literals so the rule regexes only see
/// code, and catch the lexical errors worth refusing early: an unterminated
/// string and unbalanced brackets.
fn strip_source(source: &str) -> Result<Vec<(usize, String)>, SyntaxIssue> {
    #[derive(PartialEq)]
    enum Mode {
        Code,
        Single(char),
        Triple(char),
    }

    let mut mode = Mode::Code;
    let mut depth: i32 = 0;
    let mut lines = Vec::new();
    let mut string_open_line = 0usize;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let mut out = String::with_capacity(raw.len());
        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match mode {
                Mode::Code => match c {
                    '#' => break,
                    '\'' | '"' => {
                        string_open_line = line_no;
                        if i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c {
                            mode = Mode::Triple(c);
                            i += 2;
                        } else {
                            mode = Mode::Single(c);
                        }
                        out.push(' ');
                    }
                    '(' | '[' | '{' => {
                        depth += 1;
                        out.push(c);
                    }
                    ')' | ']' | '}' => {
                        depth -= 1;
                        if depth < 0 {
                            return Err(SyntaxIssue {
                                message: format!("Syntax error: unmatched '{}'", c),
                                line: Some(line_no),
                            });
                        }
                        out.push(c);
                    }
                    _ => out.push(c),
                },
                Mode::Single(quote) => match c {
                    '\\' => i += 1,
                    _ if c == quote => mode = Mode::Code,
                    _ => {}
                },
                Mode::Triple(quote) => {
                    if c == quote
                        && i + 2 < chars.len()
                        && chars[i + 1] == quote
                        && chars[i + 2] == quote
                    {
                        mode = Mode::Code;
                        i += 2;
                    } else if c == '\\' {
                        i += 1;
                    }
                }
            }
            i += 1;
        }

        // A single-quoted string cannot span lines.
        if let Mode::Single(_) = mode {
            return Err(SyntaxIssue {
                message: "Syntax error: unterminated string literal".to_string(),
                line: Some(line_no),
            });
        }
        if !out.trim().is_empty() {
            lines.push((line_no, out));
        }
    }

    if let Mode::Triple(_) = mode {
        return Err(SyntaxIssue {
            message: "Syntax error: unterminated string literal".to_string(),
            line: Some(string_open_line),
        });
    }
    if depth != 0 {
        return Err(SyntaxIssue {
            message: "Syntax error: unbalanced brackets".to_string(),
            line: None,
        });
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(code: &str) -> ValidationResult {
        CodeValidator::new().validate(code)
    }

    #[test]
    fn empty_input_is_valid_with_zero_score() {
        let result = validate("   \n  ");
        assert!(result.is_valid);
        assert_eq!(result.risk_score, 0);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].kind, "empty_code");
        assert!(!result.violations[0].critical);
    }

    #[test]
    fn unterminated_string_short_circuits() {
        let result = validate("x = 'not closed\nimport os\n");
        assert_eq!(result.risk_score, 5);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].kind, "syntax_error");
        assert!(!result.violations[0].critical);
    }

    #[test]
    fn unbalanced_brackets_short_circuit() {
        let result = validate("def f(:\n    return ((1\n");
        assert_eq!(result.violations[0].kind, "syntax_error");
        assert_eq!(result.risk_score, 5);
    }

    #[test]
    fn forbidden_import_is_critical() {
        let result = validate("import os\nprint(1)\n");
        assert!(!result.is_valid);
        assert_eq!(result.violations[0].kind, "blacklist_module");
        assert_eq!(result.violations[0].line, Some(1));
        assert!(result.violations[0].critical);
        assert_eq!(result.risk_score, 30);
    }

    #[test]
    fn from_import_and_dotted_roots_are_checked() {
        let result = validate("from subprocess import run\n");
        assert_eq!(result.violations[0].kind, "blacklist_module");

        let result = validate("import urllib.request\n");
        assert_eq!(result.violations[0].kind, "blacklist_module");
    }

    #[test]
    fn eval_call_is_critical() {
        let result = validate("result = eval('1 + 1')\n");
        assert!(!result.is_valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == "blacklist_builtin" && v.critical));
    }

    #[test]
    fn open_scores_as_builtin_and_file_io() {
        let result = validate("data = open('f.txt')\n");
        let kinds: Vec<&str> = result.violations.iter().map(|v| v.kind.as_str()).collect();
        assert!(kinds.contains(&"blacklist_builtin"));
        assert!(kinds.contains(&"file_io"));
        assert_eq!(result.risk_score, 60);
    }

    #[test]
    fn reflection_is_noncritical_points() {
        let result = validate("v = getattr(obj, 'attr')\n");
        assert_eq!(result.violations[0].kind, "reflection");
        assert!(!result.violations[0].critical);
        assert_eq!(result.risk_score, 15);
        assert!(result.is_valid);
    }

    #[test]
    fn dunder_attribute_access_is_critical() {
        let result = validate("cls = ().__class__\n");
        assert_eq!(result.violations[0].kind, "dangerous_attribute");
        assert!(result.violations[0].critical);
        assert_eq!(result.risk_score, 20);
    }

    #[test]
    fn shadowing_a_builtin_scores_ten() {
        let result = validate("eval = my_func\n");
        assert_eq!(result.violations[0].kind, "builtin_override");
        assert_eq!(result.risk_score, 10);
        assert!(result.is_valid);
    }

    #[test]
    fn lambda_with_eval_is_critical() {
        let result = validate("f = lambda s: eval(s)\n");
        let kinds: Vec<&str> = result.violations.iter().map(|v| v.kind.as_str()).collect();
        assert!(kinds.contains(&"lambda_exec"));
        assert!(!result.is_valid);
    }

    #[test]
    fn while_true_is_a_warning() {
        let result = validate("while True:\n    pass\n");
        assert!(result.is_valid);
        assert_eq!(result.violations.len(), 0);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.risk_score, 5);
    }

    #[test]
    fn unknown_module_warns_one_point() {
        let result = validate("import scipy\n");
        assert!(result.is_valid);
        assert_eq!(result.risk_score, 1);
        assert!(result.warnings[0].contains("scipy"));
    }

    #[test]
    fn clean_strategy_code_passes() {
        let code = r#"
import numpy as np
import pandas as pd

def signal(prices):
    fast = pd.Series(prices).rolling(12).mean()
    slow = pd.Series(prices).rolling(26).mean()
    return np.sign(fast.iloc[-1] - slow.iloc[-1])
"#;
        let result = validate(code);
        assert!(result.is_valid);
        assert_eq!(result.risk_score, 0);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn strings_and_comments_do_not_trigger_rules() {
        let code = "x = 'import os'\n# eval(danger)\ny = \"exec('hi')\"\n";
        let result = validate(code);
        assert!(result.is_valid);
        assert_eq!(result.risk_score, 0);
    }

    #[test]
    fn risk_levels_follow_thresholds() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(29), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(69), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(70), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(89), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(90), RiskLevel::Critical);
    }

    #[test]
    fn many_violations_reach_critical_level() {
        let code = "import os\nimport socket\nexec('x')\n";
        let result = validate(code);
        assert!(!result.is_valid);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert_eq!(result.risk_score, 90);
    }
}
