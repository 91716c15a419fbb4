use crate::safety::{classify, ToolKind};
use crate::types::{DangerLevel, ExecutionPlan, PreviewCheck};

const KUBECTL_DRY_RUN: &str = "--dry-run=client";

// spellings of "really run it"
const KUBECTL_NO_DRY_RUN: &[&str] = &["--dry-run=none", "--dry-run=false"];
const HELM_DRY_RUN: &str = "--dry-run";

// kubectl verbs that accept --dry-run=client
const KUBECTL_DRY_RUN_VERBS: &[&str] = &[
    "apply", "create", "patch", "delete", "replace", "scale", "label", "annotate", "set",
    "expose", "run", "autoscale", "drain", "cordon", "uncordon", "taint",
];

const HELM_RELEASE_VERBS: &[&str] = &["install", "upgrade"];
const HELM_DRY_RUN_VERBS: &[&str] = &["uninstall", "delete", "del", "un", "rollback"];

const HELM_VALUE_FLAGS: &[&str] = &[
    "-n",
    "--namespace",
    "-f",
    "--values",
    "--set",
    "--set-string",
    "--set-file",
    "--set-json",
    "--version",
    "--kube-context",
    "--kubeconfig",
    "--timeout",
    "--history-max",
    "--repo",
    "--description",
    "-o",
    "--output",
    "--post-renderer",
    "--username",
    "--password",
];

const HELM_VALUES_FLAGS: &[&str] = &[
    "-f",
    "--values",
    "--set",
    "--set-string",
    "--set-file",
    "--set-json",
];

// flags `helm template` rejects
const HELM_UPGRADE_ONLY_FLAGS: &[&str] = &[
    "--install",
    "-i",
    "--cleanup-on-fail",
    "--reuse-values",
    "--reset-values",
    "--reset-then-reuse-values",
    "--force",
    "--history-max",
    "--dry-run",
    "-o",
    "--output",
];

const KUBECTL_DELETE_ONLY_FLAGS: &[&str] = &[
    "--force",
    "--grace-period",
    "--now",
    "--wait",
    "--cascade",
    "--timeout",
    "--all",
    "-i",
    "--interactive",
    "--dry-run",
];

/// Turns a command into the plan the session walks through. Pure: no
/// subprocesses, safe to call on every keystroke.
pub fn build_plan(command: &str) -> ExecutionPlan {
    let original = command.trim().to_string();
    let assessment = classify(&original);

    let mut plan = ExecutionPlan {
        first_run_command: original.clone(),
        original,
        checks: Vec::new(),
        require_second_confirm: false,
        require_typed_confirm: false,
        danger_level: assessment.level,
        notes: Vec::new(),
        safety_checks: assessment.notes,
    };

    if assessment.read_only {
        plan.notes.push("read-only command, runs as-is".to_string());
        return plan;
    }

    match (assessment.tool, assessment.verb.as_deref()) {
        (ToolKind::Kubectl, Some(verb)) if KUBECTL_DRY_RUN_VERBS.contains(&verb) => {
            plan_kubectl_mutation(&mut plan, verb)
        }
        (ToolKind::Helm, Some(verb)) if HELM_RELEASE_VERBS.contains(&verb) => {
            plan_helm_release(&mut plan, verb)
        }
        (ToolKind::Helm, Some(verb)) if HELM_DRY_RUN_VERBS.contains(&verb) => {
            plan.first_run_command = with_flag(&plan.original, HELM_DRY_RUN);
            plan.notes
                .push(format!("first run uses helm {} {}", verb, HELM_DRY_RUN));
        }
        _ => plan
            .notes
            .push("no dry-run variant, the command runs only after confirmation".to_string()),
    }

    plan.require_second_confirm = plan.danger_level > DangerLevel::Low;
    plan.require_typed_confirm = plan.danger_level >= DangerLevel::High;
    if plan.require_typed_confirm {
        plan.notes
            .push(format!("{} risk: typed confirmation required", plan.danger_level));
    }
    plan
}

fn plan_kubectl_mutation(plan: &mut ExecutionPlan, verb: &str) {
    let tokens: Vec<&str> = plan.original.split_whitespace().collect();
    let disabled = tokens.iter().find(|t| KUBECTL_NO_DRY_RUN.contains(*t)).copied();
    let has_dry_run = tokens
        .iter()
        .any(|t| t.starts_with("--dry-run") && !KUBECTL_NO_DRY_RUN.contains(t));

    if has_dry_run {
        plan.notes
            .push("command already carries a dry-run flag".to_string());
    } else if let Some(disabled) = disabled {
        plan.first_run_command = tokens
            .iter()
            .map(|t| if KUBECTL_NO_DRY_RUN.contains(t) { KUBECTL_DRY_RUN } else { *t })
            .collect::<Vec<_>>()
            .join(" ");
        plan.notes
            .push(format!("first run replaces {} with {}", disabled, KUBECTL_DRY_RUN));
    } else {
        plan.first_run_command = with_flag(&plan.original, KUBECTL_DRY_RUN);
        plan.notes
            .push(format!("first run adds {}", KUBECTL_DRY_RUN));
    }

    if verb == "delete" {
        if let Some(get) = read_equivalent_of_delete(&tokens) {
            plan.checks
                .push(PreviewCheck::new("resources that would be deleted", get));
        }
    }
}

fn read_equivalent_of_delete(tokens: &[&str]) -> Option<String> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut replaced = false;
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        if !replaced && *token == "delete" {
            out.push("get");
            replaced = true;
            continue;
        }
        let name = token.split('=').next().unwrap_or("");
        if KUBECTL_DELETE_ONLY_FLAGS.contains(&name) {
            // --grace-period 0, --timeout 30s
            if !token.contains('=')
                && matches!(name, "--grace-period" | "--timeout" | "--cascade")
                && iter.peek().is_some_and(|next| !next.starts_with('-'))
            {
                iter.next();
            }
            continue;
        }
        out.push(*token);
    }

    replaced.then(|| out.join(" "))
}

struct HelmArgs<'a> {
    global: Vec<&'a str>,
    positionals: Vec<&'a str>,
    flags: Vec<Vec<&'a str>>,
}

impl<'a> HelmArgs<'a> {
    fn parse(command: &'a str, verb: &str) -> Self {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        let verb_at = tokens
            .iter()
            .position(|t| *t == verb)
            .unwrap_or(tokens.len());

        let global = tokens.get(1..verb_at).map(<[&str]>::to_vec).unwrap_or_default();
        let mut positionals = Vec::new();
        let mut flags = Vec::new();
        let mut rest = tokens.iter().skip(verb_at + 1);

        while let Some(token) = rest.next() {
            if token.starts_with('-') {
                let mut group = vec![*token];
                if !token.contains('=') && HELM_VALUE_FLAGS.contains(token) {
                    if let Some(value) = rest.next() {
                        group.push(*value);
                    }
                }
                flags.push(group);
            } else {
                positionals.push(*token);
            }
        }

        Self {
            global,
            positionals,
            flags,
        }
    }

    fn flag_name<'b>(group: &'b [&str]) -> &'b str {
        group
            .first()
            .and_then(|f| f.split('=').next())
            .unwrap_or("")
    }

    fn chart(&self, verb: &str) -> Option<&'a str> {
        match self.positionals.as_slice() {
            [_, chart, ..] => Some(*chart),
            [chart] if verb == "install" => Some(*chart),
            _ => None,
        }
    }

    fn namespace(&self) -> Option<&'a str> {
        self.flags.iter().find_map(|group| match group.as_slice() {
            ["-n" | "--namespace", value] => Some(*value),
            [flag] => {
                let flag: &'a str = flag;
                flag.strip_prefix("--namespace=")
                    .or_else(|| flag.strip_prefix("-n="))
            }
            _ => None,
        })
    }

    fn joined_flags(&self, keep: impl Fn(&str) -> bool) -> Vec<&'a str> {
        self.flags
            .iter()
            .filter(|group| keep(Self::flag_name(group)))
            .flat_map(|group| group.iter().copied())
            .collect()
    }

    fn helm(&self, parts: &[&str]) -> String {
        let mut command = vec!["helm"];
        command.extend(self.global.iter().copied());
        command.extend(parts.iter().copied());
        command.join(" ")
    }
}

fn is_local_chart(chart: &str) -> bool {
    chart.starts_with('.') || chart.starts_with('/') || chart.starts_with('~')
}

fn plan_helm_release(plan: &mut ExecutionPlan, verb: &str) {
    let args = HelmArgs::parse(&plan.original, verb);

    match args.chart(verb) {
        Some(chart) if is_local_chart(chart) => {
            plan.checks.push(PreviewCheck::new(
                "helm dependency check",
                args.helm(&["dependency", "list", chart]),
            ));
            let mut lint = vec!["lint", chart];
            lint.extend(args.joined_flags(|f| HELM_VALUES_FLAGS.contains(&f)));
            plan.checks
                .push(PreviewCheck::new("helm lint", args.helm(&lint)));
        }
        Some(chart) => plan.notes.push(format!(
            "dependency check and lint skipped for repository chart {}",
            chart
        )),
        None => plan
            .notes
            .push("could not identify the chart; lint skipped".to_string()),
    }

    let mut template = vec!["template"];
    template.extend(args.positionals.iter().copied());
    template.extend(args.joined_flags(|f| !HELM_UPGRADE_ONLY_FLAGS.contains(&f)));
    let template = args.helm(&template);

    let mut apply = format!("{} | kubectl apply {} -f -", template, KUBECTL_DRY_RUN);
    if let Some(ns) = args.namespace() {
        apply = format!("{} | kubectl apply -n {} {} -f -", template, ns, KUBECTL_DRY_RUN);
    }

    plan.checks
        .push(PreviewCheck::new("helm template --dry-run", template));
    plan.checks
        .push(PreviewCheck::new("rendered manifests apply --dry-run", apply));

    if plan.original.split_whitespace().any(|t| t.starts_with(HELM_DRY_RUN)) {
        plan.notes
            .push("command already carries a dry-run flag".to_string());
    } else {
        plan.first_run_command = with_flag(&plan.original, HELM_DRY_RUN);
        plan.notes.push(format!("first run adds {}", HELM_DRY_RUN));
    }
}

fn with_flag(command: &str, flag: &str) -> String {
    format!("{} {}", command, flag)
}
