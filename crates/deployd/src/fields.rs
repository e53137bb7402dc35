//! Declarative schema for deployment configuration fields.
//!
//! The schema is data: an ordered list of field descriptors with enum-tagged
//! types and defaults, consumed by persistence defaults, form rendering, and
//! wire-to-value coercion so that all three share one truth.

/// The wire type of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Free-form text.
    Str,
    /// Checkbox; presence of a non-empty value means true.
    Bool,
    /// Comma-separated on the wire.
    List,
    /// Uploaded parts paired positionally with a sibling `<name>_names`
    /// space-separated text field giving the destination filenames.
    File,
    /// CI job identifier.
    Job,
}

/// The default value a missing field expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    None,
    Str(&'static str),
    Bool(bool),
    List(&'static [&'static str]),
}

/// One configuration field: wire name, human-readable label, type, default.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub ty: FieldType,
    pub default: FieldDefault,
}

/// Fields in a deployment and their human-readable labels, in form order.
///
/// `deploy_key` is form-only: on edit it is the "keep the existing deploy
/// key" checkbox rather than a persisted value.
pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "name",
        label: "Deployment name",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "git_path",
        label: "Git clone path",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "git_url",
        label: "Git repository URL",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "git_branch",
        label: "Git branch to check out",
        ty: FieldType::Str,
        default: FieldDefault::Str(DEFAULT_BRANCH),
    },
    FieldSpec {
        name: "jenkins_job",
        label: "Jenkins job",
        ty: FieldType::Job,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "jenkins_git",
        label: "Check build staleness against Git repository",
        ty: FieldType::Bool,
        default: FieldDefault::Bool(true),
    },
    FieldSpec {
        name: "jenkins_states",
        label: "Build results to consider successful",
        ty: FieldType::List,
        default: FieldDefault::List(DEFAULT_STATES),
    },
    FieldSpec {
        name: "artifacts",
        label: "Add job artifacts to deployment",
        ty: FieldType::Bool,
        default: FieldDefault::Bool(false),
    },
    FieldSpec {
        name: "deploy_key",
        label: "Keep deploy key",
        ty: FieldType::Bool,
        default: FieldDefault::Bool(false),
    },
    FieldSpec {
        name: "script",
        label: "Install command",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "services",
        label: "Systemctl service names",
        ty: FieldType::List,
        default: FieldDefault::List(&[]),
    },
    FieldSpec {
        name: "bigboat_url",
        label: "URL to BigBoat instance",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "bigboat_key",
        label: "API key of BigBoat instance",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "bigboat_compose",
        label: "Repository path to compose files",
        ty: FieldType::Str,
        default: FieldDefault::None,
    },
    FieldSpec {
        name: "secret_files",
        label: "Secret files to add to deployment",
        ty: FieldType::File,
        default: FieldDefault::None,
    },
];

pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_STATES: &[&str] = &["SUCCESS"];

/// Look up a field descriptor by wire name.
pub fn field(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|spec| spec.name == name)
}

/// Coerce a comma-separated wire value to a list. The empty string is an
/// empty list; no trimming happens around the separator.
pub fn split_list(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split(',').map(str::to_string).collect()
    }
}

/// Coerce a checkbox wire value: presence of a non-empty value means true.
pub fn coerce_bool(value: Option<&str>) -> bool {
    value.is_some_and(|value| !value.is_empty())
}

/// Extract the plain filename from a browser-supplied upload path.
///
/// Filename parsing compatible with
/// <https://html.spec.whatwg.org/multipage/input.html#fakepath-srsly>.
pub fn extract_filename(path: &str) -> &str {
    if let Some(name) = path.strip_prefix("C:\\fakepath\\") {
        // Modern browser
        return name;
    }

    if let Some(index) = path.rfind('/') {
        // Unix-based path
        return &path[index + 1..];
    }

    if let Some(index) = path.rfind('\\') {
        // Windows-based path
        return &path[index + 1..];
    }

    // Just the file name
    path
}
