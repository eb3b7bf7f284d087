//! Static validation rules for generated CAD scripts
//!
//! Generated scripts are never executed here; the sandbox is the final
//! authority. This pass rejects scripts that are structurally broken or
//! reach outside the allow-listed CAD namespace, so the generator can be
//! re-prompted with the violation before any sandbox round-trip.
//!
//! Rules:
//! - lexical structure: balanced delimiters, terminated strings
//! - imports restricted to the allow-list; dynamic import and
//!   process/IO primitives are denied outright
//! - a `# RESULT: <name>` sentinel must declare the produced artifact

use regex::Regex;
use std::sync::OnceLock;

/// Importable module roots permitted in generated scripts
pub const ALLOWED_IMPORTS: &[&str] = &["math", "cad"];

const DENIED_PATTERNS: &[(&str, &str)] = &[
    (r"\bexec\s*\(", "call to exec"),
    (r"\beval\s*\(", "call to eval"),
    (r"__import__", "dynamic import via __import__"),
    (r"\bimportlib\b", "dynamic import via importlib"),
    (r"\bsubprocess\b", "subprocess access"),
    (r"\bos\b", "os module access"),
    (r"\bsys\b", "sys module access"),
    (r"\bshutil\b", "shutil access"),
    (r"\bsocket\b", "socket access"),
    (r"\bopen\s*\(", "file IO via open"),
];

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:import\s+([\w.]+)|from\s+([\w.]+)\s+import\b)").expect("valid regex")
    })
}

fn result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\s*RESULT:\s*([A-Za-z_]\w*)\s*$").expect("valid regex"))
}

fn denied_res() -> &'static Vec<(Regex, &'static str)> {
    static RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RES.get_or_init(|| {
        DENIED_PATTERNS
            .iter()
            .map(|(pat, what)| (Regex::new(pat).expect("valid regex"), *what))
            .collect()
    })
}

/// Validate a script against all static rules
///
/// Returns the list of violations; an empty list means the script passed.
pub fn validate_script(script: &str) -> Vec<String> {
    let mut violations = Vec::new();

    violations.extend(check_structure(script));

    for (lineno, line) in script.lines().enumerate() {
        if let Some(caps) = import_re().captures(line) {
            let module = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let root = module.split('.').next().unwrap_or_default();
            if !ALLOWED_IMPORTS.contains(&root) {
                violations.push(format!(
                    "line {}: import of '{}' is not allow-listed",
                    lineno + 1,
                    module
                ));
            }
        }
        for (re, what) in denied_res() {
            if re.is_match(line) {
                violations.push(format!("line {}: {}", lineno + 1, what));
            }
        }
    }

    if result_re().captures(script).is_none() {
        violations.push("missing '# RESULT: <name>' sentinel".to_string());
    }

    violations
}

/// The artifact name declared by the script's RESULT sentinel
pub fn extract_result_name(script: &str) -> Option<String> {
    result_re()
        .captures(script)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Lexical structure check: delimiter balance and string termination
fn check_structure(script: &str) -> Vec<String> {
    let mut violations = Vec::new();
    let mut stack: Vec<(char, usize)> = Vec::new();
    // Quote char of an open triple-quoted string, if any
    let mut triple: Option<char> = None;

    for (lineno, line) in script.lines().enumerate() {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0usize;

        while i < chars.len() {
            let c = chars[i];

            if let Some(q) = triple {
                if c == q && chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q) {
                    triple = None;
                    i += 3;
                } else {
                    i += 1;
                }
                continue;
            }

            match c {
                '#' => break,
                '\'' | '"' => {
                    if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                        triple = Some(c);
                        i += 3;
                        continue;
                    }
                    // Single-line string: scan for the closing quote
                    let mut j = i + 1;
                    let mut closed = false;
                    while j < chars.len() {
                        if chars[j] == '\\' {
                            j += 2;
                            continue;
                        }
                        if chars[j] == c {
                            closed = true;
                            break;
                        }
                        j += 1;
                    }
                    if !closed {
                        violations.push(format!("line {}: unterminated string", lineno + 1));
                        break;
                    }
                    i = j + 1;
                    continue;
                }
                '(' | '[' | '{' => stack.push((c, lineno + 1)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => violations
                            .push(format!("line {}: unmatched '{}'", lineno + 1, c)),
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    if triple.is_some() {
        violations.push("unterminated triple-quoted string".to_string());
    }
    for (open, lineno) in stack {
        violations.push(format!("line {lineno}: unclosed '{open}'"));
    }
    violations
}
