//! YAML frontmatter splitting, parsing and rendering.
//!
//! A frontmatter block starts with a line that is exactly `---` and ends at the
//! next line that is exactly `---`. Anything else (no opening delimiter, or no
//! closing delimiter) means the whole content is body.

use serde_yaml::{Mapping, Value};

const DELIMITER: &str = "---";

/// Content split into its frontmatter block and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split<'a> {
    /// The full header, delimiters and trailing newline included.
    pub header: Option<&'a str>,
    /// YAML text between the delimiters.
    pub yaml: Option<&'a str>,
    /// Everything after the closing delimiter line.
    pub body: &'a str,
}

/// Split raw file content into frontmatter and body.
pub fn split(content: &str) -> Split<'_> {
    let no_header = Split {
        header: None,
        yaml: None,
        body: content,
    };

    let mut lines = content.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return no_header;
    };
    if trim_eol(first) != DELIMITER {
        return no_header;
    }

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if trim_eol(line) == DELIMITER {
            let header_end = offset + line.len();
            return Split {
                header: Some(&content[..header_end]),
                yaml: Some(&content[yaml_start..offset]),
                body: &content[header_end..],
            };
        }
        offset += line.len();
    }

    no_header
}

/// Parse the YAML between the delimiters into an ordered mapping.
///
/// Empty or whitespace-only frontmatter is an empty mapping.
pub fn parse(yaml: &str) -> Result<Mapping, String> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(yaml).map_err(|e| e.to_string())? {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        other => Err(format!(
            "frontmatter must be a mapping, found {}",
            value_kind(&other)
        )),
    }
}

/// Render a mapping as a delimited frontmatter block.
///
/// Fails if the serialized YAML would contain a bare `---` line, which would
/// end the block early on the next read.
pub fn render(metadata: &Mapping) -> Result<String, String> {
    if metadata.is_empty() {
        return Ok(format!("{DELIMITER}\n{DELIMITER}\n"));
    }
    let yaml = serde_yaml::to_string(metadata).map_err(|e| e.to_string())?;
    if let Some(index) = yaml.lines().position(|line| line.trim_end() == DELIMITER) {
        return Err(format!(
            "line {} of the rendered frontmatter is a bare '{DELIMITER}'",
            index + 1
        ));
    }
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n"))
}

fn trim_eol(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
