use crate::executor::CommandRunner;
use std::time::Duration;
use tracing::debug;

const CURRENT_CONTEXT: &str = "kubectl config current-context";
const CURRENT_NAMESPACE: &str = "kubectl config view --minify -o jsonpath='{..namespace}'";

/// One-line description of where commands will land, e.g.
/// `cluster context: prod-eu (namespace: default)`. `None` when kubectl is
/// missing or has no current context.
pub async fn cluster_banner<R: CommandRunner>(runner: &R, timeout: Duration) -> Option<String> {
    let context = match runner.run(CURRENT_CONTEXT, timeout, None).await {
        Ok(output) => output.stdout.trim().to_string(),
        Err(e) => {
            debug!("no cluster context: {}", e);
            return None;
        }
    };
    if context.is_empty() {
        return None;
    }

    let namespace = runner
        .run(CURRENT_NAMESPACE, timeout, None)
        .await
        .map(|output| output.stdout.trim().to_string())
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string());

    Some(format!(
        "cluster context: {} (namespace: {})",
        context, namespace
    ))
}
