//! Structural Digest
//!
//! Definition and signature lines pulled from touched files, folded into a
//! condensation marker so the model keeps a map of the code it has seen.

use std::sync::OnceLock;

use regex::Regex;

use cascade_tools::FileRegistry;

fn definition_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Rust
            r"^\s*(?:pub(?:\([\w:]+\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|impl|mod|type)\b",
            // TypeScript / JavaScript
            r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function|class|interface|type|enum)\s",
            // Python
            r"^\s*(?:async\s+)?def\s|^\s*class\s",
            // Go
            r"^\s*func\s|^\s*type\s+\w+\s+(?:struct|interface)",
            // Java / C#
            r"^\s*(?:public|private|protected)\s+(?:static\s+)?(?:final\s+)?(?:class|interface|enum|record|[\w<>\[\]]+\s+\w+\s*\()",
        ]
        .into_iter()
        .filter_map(|raw| Regex::new(raw).ok())
        .collect()
    })
}

fn is_definition(line: &str) -> bool {
    definition_patterns().iter().any(|r| r.is_match(line))
}

/// Numbered definition lines of one file.
pub fn extract_definitions(content: &str) -> Vec<(usize, String)> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| is_definition(line))
        .map(|(i, line)| (i + 1, line.trim_end().trim_end_matches('{').trim_end().to_string()))
        .collect()
}

/// Digest of every touched file, capped at `max_chars` characters.
pub fn structural_digest(registry: &FileRegistry, max_chars: usize) -> String {
    let mut digest = String::from("## Structural digest of touched files");
    let header_len = digest.len();

    'files: for path in registry.touched_paths() {
        let section = match registry.get(path) {
            Some(entry) => {
                let definitions = extract_definitions(&entry.content);
                if definitions.is_empty() {
                    format!("\n### {} ({} lines)", path, entry.line_count)
                } else {
                    let mut section = format!("\n### {}", path);
                    for (line_no, text) in definitions {
                        section.push_str(&format!("\n{:>5}: {}", line_no, text.trim_start()));
                    }
                    section
                }
            }
            None => format!("\n### {} (modified, content not cached)", path),
        };

        if digest.len() + section.len() <= max_chars {
            digest.push_str(&section);
            continue;
        }
        // Partial section: keep whole lines that still fit.
        for line in section.split_inclusive('\n') {
            if digest.len() + line.len() > max_chars {
                break 'files;
            }
            digest.push_str(line);
        }
        break;
    }

    if digest.len() == header_len {
        return String::new();
    }
    digest
}
