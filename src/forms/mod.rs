//! Inline validation forms embedded in document bodies.
//!
//! A form is a delimited region the user edits in place:
//!
//! ```text
//! <!-- form:entity_resolution:start -->
//!
//! > [!info] Entity Resolution - Review and confirm entity mappings
//!
//! ## Maxime
//! **Link:** <!-- input:entity_0_link -->[[Maxime Dupont]]
//! **Type:** <!-- input:entity_0_type -->people
//!
//! ---
//!
//! - [ ] Finished <!-- input:finished -->
//!
//! <!-- form:entity_resolution:end -->
//! ```
//!
//! Once accepted, the form is swapped for a `summary:<namespace>` region.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

const ERROR_HEADING: &str = "> [!error] Validation errors - please fix and check Finished again";
const FINISHED_LINE: &str = "- [ ] Finished <!-- input:finished -->";
const TEXT_START: &str = "<!-- input:text:start -->";
const TEXT_END: &str = "<!-- input:text:end -->";

static INPUT_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!-- input:([A-Za-z0-9_]+) -->([^\n]*)").unwrap());

static FINISHED_CHECKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[x\]\s+Finished\s+<!-- input:finished -->").unwrap());

static FINISHED_UNCHECK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[x\](\s+)Finished(\s+)(<!-- input:finished -->)").unwrap()
});

pub fn form_start(namespace: &str) -> String {
    format!("<!-- form:{namespace}:start -->")
}

pub fn form_end(namespace: &str) -> String {
    format!("<!-- form:{namespace}:end -->")
}

pub fn summary_start(namespace: &str) -> String {
    format!("<!-- summary:{namespace}:start -->")
}

pub fn summary_end(namespace: &str) -> String {
    format!("<!-- summary:{namespace}:end -->")
}

// ── Rendering ───────────────────────────────────────────────────────

/// One editable line: `**Label:** <!-- input:name -->value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub value: String,
}

impl FormField {
    pub fn new(name: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

/// A group of fields under an optional `##` heading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormSection {
    pub heading: Option<String>,
    pub fields: Vec<FormField>,
}

/// Structured form request, rendered by [`Form::render`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    pub namespace: String,
    /// Text of the `> [!info]` callout at the top of the form.
    pub title: String,
    pub sections: Vec<FormSection>,
    /// Optional editable free-text block.
    pub text: Option<String>,
    pub errors: Vec<String>,
}

impl Form {
    pub fn new(namespace: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn section(mut self, heading: Option<String>, fields: Vec<FormField>) -> Self {
        self.sections.push(FormSection { heading, fields });
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn render(&self) -> String {
        let mut lines = vec![form_start(&self.namespace), String::new()];
        if !self.errors.is_empty() {
            lines.push(error_callout(&self.errors));
        }
        lines.push(format!("> [!info] {}", self.title));
        lines.push(String::new());

        for section in &self.sections {
            if let Some(heading) = &section.heading {
                lines.push(format!("## {heading}"));
            }
            for field in &section.fields {
                lines.push(format!(
                    "**{}:** <!-- input:{} -->{}",
                    field.label, field.name, field.value
                ));
            }
            lines.push(String::new());
            lines.push("---".to_string());
            lines.push(String::new());
        }

        if let Some(text) = &self.text {
            lines.push(TEXT_START.to_string());
            lines.push(text.trim_end().to_string());
            lines.push(TEXT_END.to_string());
            lines.push(String::new());
            lines.push("---".to_string());
            lines.push(String::new());
        }

        lines.push(FINISHED_LINE.to_string());
        lines.push(String::new());
        lines.push(form_end(&self.namespace));
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// `> [!error]` callout listing each message.
pub fn error_callout(errors: &[String]) -> String {
    let mut out = String::from(ERROR_HEADING);
    for error in errors {
        out.push_str("\n> - ");
        out.push_str(error);
    }
    out.push('\n');
    out
}

// ── Readback ────────────────────────────────────────────────────────

/// What a user left in a form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormReadback {
    pub fields: HashMap<String, String>,
    pub text: Option<String>,
    pub finished: bool,
}

impl FormReadback {
    /// Trimmed field value; missing fields read as empty.
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(|v| v.trim()).unwrap_or("")
    }
}

/// Byte range of a `start`..`end` region, through the end of the end marker
/// line.
fn region(body: &str, start: &str, end: &str) -> Option<Range<usize>> {
    let from = body.find(start)?;
    let end_at = from + body[from..].find(end)?;
    let to = match body[end_at..].find('\n') {
        Some(offset) => end_at + offset + 1,
        None => body.len(),
    };
    Some(from..to)
}

pub fn has_form(body: &str, namespace: &str) -> bool {
    region(body, &form_start(namespace), &form_end(namespace)).is_some()
}

pub fn has_summary(body: &str, namespace: &str) -> bool {
    region(body, &summary_start(namespace), &summary_end(namespace)).is_some()
}

/// Read the form for `namespace`, or `None` if it is not in the body.
pub fn read_form(body: &str, namespace: &str) -> Option<FormReadback> {
    let range = region(body, &form_start(namespace), &form_end(namespace))?;
    let section = &body[range];

    let mut readback = FormReadback {
        finished: FINISHED_CHECKED.is_match(section),
        ..FormReadback::default()
    };

    let (fields_part, text) = match (section.find(TEXT_START), section.find(TEXT_END)) {
        (Some(start), Some(end)) if start < end => {
            let inner = &section[start + TEXT_START.len()..end];
            let text = inner.trim_matches('\n').to_string();
            (format!("{}{}", &section[..start], &section[end..]), Some(text))
        }
        _ => (section.to_string(), None),
    };
    readback.text = text;

    for caps in INPUT_FIELD.captures_iter(&fields_part) {
        let name = &caps[1];
        if name == "finished" {
            continue;
        }
        readback.fields.insert(name.to_string(), caps[2].to_string());
    }
    Some(readback)
}

// ── Body edits ──────────────────────────────────────────────────────

/// Put a form at the top of `body`, replacing any existing form for the same
/// namespace.
pub fn insert_form(body: &str, form: &Form) -> String {
    let base = remove_form(body, &form.namespace);
    let rendered = form.render();
    if base.is_empty() {
        rendered
    } else {
        format!("{rendered}\n{}", base.trim_start_matches('\n'))
    }
}

pub fn remove_form(body: &str, namespace: &str) -> String {
    match region(body, &form_start(namespace), &form_end(namespace)) {
        Some(range) => format!("{}{}", &body[..range.start], &body[range.end..]),
        None => body.to_string(),
    }
}

/// Swap the form for a summary region. Without a form the summary goes to
/// the top of the body.
pub fn replace_form_with_summary(body: &str, namespace: &str, summary: &str) -> String {
    let block = format!(
        "{}\n{}\n{}\n",
        summary_start(namespace),
        summary.trim_end(),
        summary_end(namespace)
    );
    match region(body, &form_start(namespace), &form_end(namespace)) {
        Some(range) => format!("{}{block}{}", &body[..range.start], &body[range.end..]),
        None => format!("{block}\n{body}"),
    }
}

/// Write an error callout right after the form start marker, replacing any
/// previous one, and uncheck the Finished box.
pub fn write_errors(body: &str, namespace: &str, errors: &[String]) -> String {
    let Some(range) = region(body, &form_start(namespace), &form_end(namespace)) else {
        return body.to_string();
    };
    let section = &body[range.clone()];
    let marker_line_end = section.find('\n').map(|i| i + 1).unwrap_or(section.len());
    let (marker, rest) = section.split_at(marker_line_end);

    let rest = strip_error_callout(rest);
    let rest = uncheck_finished(&rest);
    let rest = rest.trim_start_matches('\n');

    format!(
        "{}{marker}\n{}\n{rest}{}",
        &body[..range.start],
        error_callout(errors),
        &body[range.end..]
    )
}

/// Reset the Finished box of the form for `namespace`. Text outside the
/// form is left alone.
pub fn uncheck_form(body: &str, namespace: &str) -> String {
    match region(body, &form_start(namespace), &form_end(namespace)) {
        Some(range) => format!(
            "{}{}{}",
            &body[..range.start],
            uncheck_finished(&body[range.clone()]),
            &body[range.end..]
        ),
        None => body.to_string(),
    }
}

fn uncheck_finished(text: &str) -> String {
    FINISHED_UNCHECK
        .replace_all(text, "[ ]${1}Finished${2}${3}")
        .into_owned()
}

fn strip_error_callout(text: &str) -> String {
    let mut out = Vec::new();
    let mut in_callout = false;
    for line in text.split_inclusive('\n') {
        if line.starts_with("> [!error]") {
            in_callout = true;
            continue;
        }
        if in_callout && line.starts_with('>') {
            continue;
        }
        in_callout = false;
        out.push(line);
    }
    out.concat()
}

// ── Field validation ────────────────────────────────────────────────

/// Empty, or `[[...]]`.
pub fn validate_wikilink(value: &str, label: &str, allow_empty: bool) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return (!allow_empty).then(|| format!("{label} is required"));
    }
    if value.starts_with("[[") && value.ends_with("]]") && value.len() > 4 {
        None
    } else {
        Some(format!(
            "{label} must be a wikilink (e.g., [[Person Name]]), got: {value}"
        ))
    }
}

/// One of `choices`, case-insensitively.
pub fn validate_choice(value: &str, choices: &[&str], label: &str, allow_empty: bool) -> Option<String> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return (!allow_empty).then(|| format!("{label} is required"));
    }
    if choices.iter().any(|c| c.to_lowercase() == value) {
        return None;
    }
    let mut sorted = choices.to_vec();
    sorted.sort_unstable();
    Some(format!(
        "{label} must be one of: {}. Got: {value}",
        sorted.join(", ")
    ))
}
