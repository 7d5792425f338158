//! Package-spec parsing for install commands.
//!
//! Replaces raw string splitting with a small tokenizer: everything after
//! the `install` verb is read as package specs, option tokens are skipped,
//! and version-specifier operators are split off into a structured field.

const VERSION_OPERATORS: [&str; 7] = ["==", ">=", "<=", "~=", "!=", ">", "<"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<String>,
}

/// Whether a command line is a pip install invocation.
pub fn is_install_command(command: &str) -> bool {
    let lower = command.to_lowercase();
    lower.contains("pip") && lower.split_whitespace().any(|token| token == "install")
}

/// Parse package specs out of an install command line. Malformed input
/// yields an empty list, never an error. Parsing is idempotent: feeding a
/// produced spec back through `pip install <name>` yields the same spec.
pub fn parse_install_command(command: &str) -> Vec<PackageSpec> {
    let mut tokens = command.split_whitespace();
    if !tokens.any(|token| token.eq_ignore_ascii_case("install")) {
        return Vec::new();
    }

    let mut specs = Vec::new();
    for token in tokens {
        if token.starts_with('-') {
            continue;
        }
        let (name, version) = split_spec(token);
        if name.is_empty() {
            continue;
        }
        specs.push(PackageSpec {
            name: name.to_string(),
            version,
        });
    }
    specs
}

fn split_spec(token: &str) -> (&str, Option<String>) {
    for op in VERSION_OPERATORS {
        if let Some((name, version)) = token.split_once(op) {
            let version = version.trim();
            let version = (!version.is_empty()).then(|| version.to_string());
            return (name.trim(), version);
        }
    }
    (token.trim(), None)
}

/// Best-effort version lookup: scan captured output for an
/// "already satisfied" line mentioning the package and take the text after
/// its last `==`.
pub fn version_from_output(output: &str, name: &str) -> Option<String> {
    let needle = name.to_lowercase();
    for line in output.lines() {
        let lower = line.to_lowercase();
        if lower.contains(&needle) && lower.contains("already satisfied") {
            return line.rsplit_once("==").map(|(_, v)| v.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_spec_is_split_into_name_and_version() {
        let specs = parse_install_command("pip install requests==2.31.0");
        assert_eq!(
            specs,
            vec![PackageSpec {
                name: "requests".to_string(),
                version: Some("2.31.0".to_string()),
            }]
        );
    }

    #[test]
    fn parsing_is_idempotent_over_produced_names() {
        let first = parse_install_command("pip install requests==2.31.0");
        let command = format!("pip install {}", first[0].name);
        let second = parse_install_command(&command);
        assert_eq!(second[0].name, first[0].name);
        assert_eq!(second[0].version, None);
        assert_eq!(parse_install_command(&command), second);
    }

    #[test]
    fn multiple_specs_and_operators() {
        let specs = parse_install_command("pip install flask>=3.0 numpy~=1.26 pandas");
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].name, "flask");
        assert_eq!(specs[0].version.as_deref(), Some("3.0"));
        assert_eq!(specs[1].name, "numpy");
        assert_eq!(specs[1].version.as_deref(), Some("1.26"));
        assert_eq!(specs[2].name, "pandas");
        assert_eq!(specs[2].version, None);
    }

    #[test]
    fn option_tokens_are_skipped() {
        let specs = parse_install_command("pip install --upgrade -q requests");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "requests");
    }

    #[test]
    fn malformed_input_yields_empty_list() {
        assert!(parse_install_command("").is_empty());
        assert!(parse_install_command("ls -la").is_empty());
        assert!(parse_install_command("pip install").is_empty());
        assert!(parse_install_command("pip install ==").is_empty());
    }

    #[test]
    fn install_command_detection() {
        assert!(is_install_command("pip install requests"));
        assert!(is_install_command("pip3 install -q flask"));
        assert!(!is_install_command("echo install"));
        assert!(!is_install_command("pip list"));
        assert!(!is_install_command("ls"));
    }

    #[test]
    fn version_lookup_reads_already_satisfied_lines() {
        let output = "Collecting requests\nRequirement already satisfied: requests==2.31.0\nDone";
        assert_eq!(version_from_output(output, "requests").as_deref(), Some("2.31.0"));
        assert_eq!(version_from_output("Installing collected packages", "requests"), None);
    }
}
