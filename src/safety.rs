use crate::types::DangerLevel;
use regex::Regex;
use std::sync::LazyLock;

pub const KUBECTL_READ_ONLY: &[&str] = &[
    "get",
    "describe",
    "logs",
    "top",
    "api-resources",
    "version",
    "explain",
];

pub const HELM_READ_ONLY: &[&str] = &["lint", "template", "version", "show", "get"];

// Global flags allowed before the verb that consume the next token when
// written without `=`. Any flag before the verb outside this list and
// BOOL_FLAGS leaves the verb unknown.
const VALUE_FLAGS: &[&str] = &[
    "-n",
    "--namespace",
    "--context",
    "--kube-context",
    "--kubeconfig",
    "--cluster",
    "--user",
    "-s",
    "--server",
    "--token",
    "--as",
    "--as-group",
    "--as-uid",
    "--request-timeout",
    "--cache-dir",
    "--certificate-authority",
    "--client-certificate",
    "--client-key",
    "--tls-server-name",
    "--log-file",
    "--password",
    "--username",
    "-v",
    "--v",
    "--registry-config",
    "--repository-cache",
    "--repository-config",
    "--kube-apiserver",
    "--kube-token",
    "--kube-ca-file",
    "--kube-as-user",
    "--kube-as-group",
    "--kube-tls-server-name",
    "--burst-limit",
    "--qps",
];

const BOOL_FLAGS: &[&str] = &[
    "--insecure-skip-tls-verify",
    "--kube-insecure-skip-tls-verify",
    "--match-server-version",
    "--warnings-as-errors",
    "--disable-compression",
    "--debug",
];

const SHELL_OPERATORS: &[&str] = &[";", "|", "&", "`", "$(", ">", "<", "\n"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Kubectl,
    Helm,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleScope {
    Kubectl,
    Helm,
    Cluster,
    Other,
}

struct DangerRule {
    scope: RuleScope,
    pattern: Regex,
    level: DangerLevel,
    note: &'static str,
}

const RULE_SPECS: &[(RuleScope, &str, DangerLevel, &str)] = &[
    (
        RuleScope::Kubectl,
        r"\bdelete\b",
        DangerLevel::High,
        "deletes cluster resources",
    ),
    (
        RuleScope::Kubectl,
        r"\bdelete\b(?:.*\sall(?:\s|$)|.*\s--all(?:\s|=true|$))",
        DangerLevel::Critical,
        "bulk delete of all resources",
    ),
    (
        RuleScope::Kubectl,
        r#"\bdelete\b.*(?:\s-l|\s--selector|\s--field-selector)(?:\s+|=)['"]?[^\s'"]*\*"#,
        DangerLevel::Critical,
        "delete with a wildcard selector",
    ),
    (
        RuleScope::Kubectl,
        r"\bdelete\b.*(?:\s--force(?:\s|=true|$)|\s--grace-period(?:=|\s+)0(?:\s|$)|\s--now(?:\s|$))",
        DangerLevel::High,
        "force/zero-grace-period delete skips graceful termination",
    ),
    (
        RuleScope::Kubectl,
        r"\bdelete\b.*(?:\s-A(?:\s|$)|\s--all-namespaces(?:\s|=true|$))",
        DangerLevel::Critical,
        "delete across all namespaces",
    ),
    (
        RuleScope::Kubectl,
        r"\bdelete\s+(?:(?:-n|--namespace)\s+\S+\s+|-\S+\s+)*(?:namespaces?|ns|nodes?|no|persistentvolumes?|pv|clusterroles?|clusterrolebindings?|customresourcedefinitions?|crds?|storageclass(?:es)?|sc|priorityclass(?:es)?|mutatingwebhookconfigurations?|validatingwebhookconfigurations?)(?:[\s/.,]|$)",
        DangerLevel::Critical,
        "delete of a cluster-scoped resource kind",
    ),
    (
        RuleScope::Kubectl,
        r#"\bdelete\b.*\s['"]?[\w./-]*\*"#,
        DangerLevel::High,
        "wildcard resource target",
    ),
    (
        RuleScope::Kubectl,
        r"\bscale\b.*--replicas(?:=|\s+)0(?:\s|$)",
        DangerLevel::High,
        "scales a workload to zero replicas",
    ),
    (
        RuleScope::Kubectl,
        r"\s(?:drain|cordon|taint)(?:\s|$)",
        DangerLevel::High,
        "changes node scheduling",
    ),
    (
        RuleScope::Kubectl,
        r"\sapply\b.*\s--prune(?:\s|=true|$)",
        DangerLevel::High,
        "apply --prune deletes resources missing from the manifests",
    ),
    (
        RuleScope::Kubectl,
        r"\sreplace\b.*\s--force(?:\s|=true|$)",
        DangerLevel::High,
        "replace --force deletes and recreates resources",
    ),
    (
        RuleScope::Cluster,
        r"(?i)(?:\s-n|\s--namespace|\s--context|\s--kube-context)(?:\s+|=)\S*(?:prod|live)",
        DangerLevel::High,
        "targets a production-like namespace or context",
    ),
    (
        RuleScope::Helm,
        r"(?i)\b(?:upgrade|install)\s+(?:(?:-n|--namespace|-f|--values|--version|--kube-context)\s+\S+\s+|-\S+\s+)*(?:[^\s-]\S*)?(?:prod|live)",
        DangerLevel::High,
        "release name looks production-like",
    ),
    (
        RuleScope::Helm,
        r"\bhelm\s+(?:uninstall|delete|del|un)(?:\s|$)",
        DangerLevel::High,
        "removes a helm release and its resources",
    ),
    (
        RuleScope::Helm,
        r"\bhelm\s+rollback(?:\s|$)",
        DangerLevel::Medium,
        "rolls a release back to an earlier revision",
    ),
    (
        RuleScope::Other,
        r"(?i)(?:^|[^a-z])(?:delete|drop|truncate|destroy|purge)|(?:^|[\s;&|(])rm\s",
        DangerLevel::High,
        "contains a destructive verb",
    ),
];

static RULES: LazyLock<Vec<DangerRule>> = LazyLock::new(|| {
    RULE_SPECS
        .iter()
        .filter_map(|(scope, pattern, level, note)| match Regex::new(pattern) {
            Ok(pattern) => Some(DangerRule {
                scope: *scope,
                pattern,
                level: *level,
                note: *note,
            }),
            Err(e) => {
                tracing::error!("invalid danger rule {:?}: {}", pattern, e);
                None
            }
        })
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub tool: ToolKind,
    pub verb: Option<String>,
    pub read_only: bool,
    pub level: DangerLevel,
    pub notes: Vec<String>,
}

pub fn has_shell_operators(command: &str) -> bool {
    SHELL_OPERATORS.iter().any(|op| command.contains(op))
}

pub fn detect_tool(command: &str) -> ToolKind {
    if has_shell_operators(command) {
        return ToolKind::Other;
    }
    // only the bare names resolved through PATH count
    match command.split_whitespace().next().unwrap_or("") {
        "kubectl" => ToolKind::Kubectl,
        "helm" => ToolKind::Helm,
        _ => ToolKind::Other,
    }
}

/// First positional word after the tool name, skipping known global flags.
/// `None` when an unknown flag comes first, since its value could be
/// mistaken for the verb.
pub fn verb(command: &str) -> Option<&str> {
    let mut tokens = command.split_whitespace().skip(1);
    while let Some(token) = tokens.next() {
        if !token.starts_with('-') {
            return Some(token);
        }
        match token.split_once('=') {
            Some((name, _)) if VALUE_FLAGS.contains(&name) || BOOL_FLAGS.contains(&name) => {}
            None if VALUE_FLAGS.contains(&token) => {
                tokens.next();
            }
            None if BOOL_FLAGS.contains(&token) => {}
            _ => return None,
        }
    }
    None
}

/// Read-only detection shared by the classifier and the agent whitelist.
pub fn is_read_only(command: &str) -> bool {
    let command = command.trim();
    let verbs = match detect_tool(command) {
        ToolKind::Kubectl => KUBECTL_READ_ONLY,
        ToolKind::Helm => HELM_READ_ONLY,
        ToolKind::Other => return false,
    };
    verb(command).is_some_and(|v| verbs.contains(&v))
}

pub fn is_whitelisted(command: &str) -> bool {
    is_read_only(command)
}

/// Human-readable whitelist, as stated to the model in agent mode.
pub fn whitelist_description() -> String {
    format!(
        "kubectl {} | helm {}",
        KUBECTL_READ_ONLY.join("|"),
        HELM_READ_ONLY.join("|")
    )
}

fn rule_applies(scope: RuleScope, tool: ToolKind, command: &str) -> bool {
    let mentions_kubectl = command.contains("kubectl");
    let mentions_helm = command.contains("helm");
    match scope {
        RuleScope::Kubectl => {
            tool == ToolKind::Kubectl || (tool == ToolKind::Other && mentions_kubectl)
        }
        RuleScope::Helm => tool == ToolKind::Helm || (tool == ToolKind::Other && mentions_helm),
        RuleScope::Cluster => {
            tool != ToolKind::Other || mentions_kubectl || mentions_helm
        }
        RuleScope::Other => tool == ToolKind::Other,
    }
}

pub fn classify(command: &str) -> Assessment {
    let command = command.trim();
    let tool = detect_tool(command);
    let verb_name = match tool {
        ToolKind::Other => None,
        _ => verb(command).map(String::from),
    };

    if is_read_only(command) {
        return Assessment {
            tool,
            verb: verb_name,
            read_only: true,
            level: DangerLevel::Low,
            notes: Vec::new(),
        };
    }

    let base_note = match tool {
        ToolKind::Kubectl => "modifies cluster state",
        ToolKind::Helm => "changes helm releases",
        ToolKind::Other if command.is_empty() => "empty command",
        ToolKind::Other if has_shell_operators(command) => {
            "chains or redirects shell commands; reviewed as a whole"
        }
        ToolKind::Other => "not a recognized kubectl/helm command",
    };

    let mut level = DangerLevel::Medium;
    let mut notes = vec![base_note.to_string()];

    for rule in RULES.iter() {
        if rule_applies(rule.scope, tool, command) && rule.pattern.is_match(command) {
            level = level.max(rule.level);
            notes.push(rule.note.to_string());
        }
    }

    Assessment {
        tool,
        verb: verb_name,
        read_only: false,
        level,
        notes,
    }
}
