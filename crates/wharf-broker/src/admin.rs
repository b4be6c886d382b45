// Text admin commands: domain removal and queue purge.
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use wharf_common::{AppSelector, NodeId, QueueKey, QueueUri, pretty_bytes};
use wharf_consensus::AuthorityDirectory;
use wharf_storage::PurgeOutcome;

use crate::authority::{AuthorityClient, NodeRegistry};
use crate::{BrokerError, QueuePurge};

const ROUTING_ERROR: &str = "Error occurred routing command to this node";
const NOTHING_PURGED: &str = "No queue purged.";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error("empty command")]
    Empty,
    #[error("unrecognized command: {0}")]
    Unrecognized(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    DomainRemove { domain: String, finalize: bool },
    QueuePurge { queue: QueueKey, selector: AppSelector },
}

impl FromStr for AdminCommand {
    type Err = AdminError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = input.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let keywords: Vec<&str> = upper.iter().map(String::as_str).collect();
        match keywords.as_slice() {
            [] => Err(AdminError::Empty),
            ["DOMAINS", "REMOVE", _] => Ok(AdminCommand::DomainRemove {
                domain: words[2].to_string(),
                finalize: false,
            }),
            ["DOMAINS", "REMOVE", _, "FINALIZE"] => Ok(AdminCommand::DomainRemove {
                domain: words[2].to_string(),
                finalize: true,
            }),
            ["QUEUE", _, "PURGE", _] => Ok(AdminCommand::QueuePurge {
                queue: parse_queue(words[1])?,
                selector: parse_selector(words[3])?,
            }),
            ["DOMAINS", "DOMAIN", _, "QUEUE", _, "PURGE", _] => Ok(AdminCommand::QueuePurge {
                queue: QueueUri::new(words[2], words[4])
                    .map_err(|err| AdminError::InvalidArgument(err.to_string()))?
                    .key()
                    .clone(),
                selector: parse_selector(words[6])?,
            }),
            _ => Err(AdminError::Unrecognized(input.trim().to_string())),
        }
    }
}

// Accepts `domain/queue` or a full queue uri.
fn parse_queue(text: &str) -> Result<QueueKey, AdminError> {
    let uri = if text.contains("://") {
        text.parse::<QueueUri>()
    } else {
        match text.split_once('/') {
            Some((domain, queue)) => QueueUri::new(domain, queue),
            None => return Err(AdminError::InvalidArgument(format!("not a queue: {text}"))),
        }
    };
    uri.map(|uri| uri.key().clone())
        .map_err(|err| AdminError::InvalidArgument(err.to_string()))
}

fn parse_selector(text: &str) -> Result<AppSelector, AdminError> {
    text.parse()
        .map_err(|err: wharf_common::Error| AdminError::InvalidArgument(err.to_string()))
}

/// Runs admin commands against every known node and renders the text reply.
#[derive(Debug, Clone)]
pub struct AdminExecutor {
    nodes: NodeRegistry,
    directory: AuthorityDirectory,
}

impl AdminExecutor {
    pub fn new(nodes: NodeRegistry, directory: AuthorityDirectory) -> Self {
        Self { nodes, directory }
    }

    pub async fn execute_text(&self, input: &str) -> Result<String, AdminError> {
        let command: AdminCommand = input.parse()?;
        Ok(self.execute(&command).await)
    }

    pub async fn execute(&self, command: &AdminCommand) -> String {
        tracing::info!(?command, "admin command");
        match command {
            AdminCommand::DomainRemove { domain, finalize } => {
                self.remove_domain(domain, *finalize).await
            }
            AdminCommand::QueuePurge { queue, selector } => self.purge_queue(queue, selector).await,
        }
    }

    async fn remove_domain(&self, domain: &str, finalize: bool) -> String {
        let nodes = self.nodes.all();

        // Existence and open handles across every node that answers.
        let mut exists = false;
        let mut open_handles = 0;
        for node in &nodes {
            if let Ok(true) = node.domain_exists(domain).await {
                exists = true;
            }
            if let Ok(count) = node.open_handle_count(domain).await {
                open_handles += count;
            }
        }
        if !exists {
            return BrokerError::DomainNotFound(domain.to_string()).to_string();
        }
        if open_handles > 0 {
            return BrokerError::QueuesOpen {
                domain: domain.to_string(),
            }
            .to_string();
        }

        let mut pending: FuturesUnordered<_> = nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                async move {
                    let result = node.remove_domain(domain).await;
                    (node.node_id().clone(), result)
                }
            })
            .collect();
        let mut results: Vec<(NodeId, crate::Result<Vec<QueuePurge>>)> = Vec::new();
        while let Some(result) = pending.next().await {
            results.push(result);
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let all_ok = results.iter().all(|(_, result)| result.is_ok());
        let mut out = String::new();
        for (node, result) in &results {
            let _ = writeln!(out, "Node {node}:");
            match result {
                Ok(purged) => render_purged(&mut out, purged),
                Err(BrokerError::Unreachable(_)) | Err(BrokerError::NotAuthority { .. }) => {
                    let _ = writeln!(out, "{ROUTING_ERROR}");
                }
                Err(err) => {
                    let _ = writeln!(out, "{err}");
                    let _ = writeln!(out, "{NOTHING_PURGED}");
                }
            }
        }
        if finalize {
            if all_ok {
                self.finalize(domain, &nodes, &mut out).await;
            } else {
                let _ = writeln!(out, "Domain '{domain}' not finalized: some nodes failed");
            }
        }
        out
    }

    async fn finalize(&self, domain: &str, nodes: &[Arc<dyn AuthorityClient>], out: &mut String) {
        let mut failed = false;
        for node in nodes {
            if let Err(err) = node.finalize_domain(domain).await {
                tracing::warn!(node = %node.node_id(), domain, error = %err, "finalize failed");
                let _ = writeln!(out, "Node {}: {err}", node.node_id());
                failed = true;
            }
        }
        if !failed {
            let _ = writeln!(out, "Domain '{domain}' finalized");
        }
    }

    async fn purge_queue(&self, queue: &QueueKey, selector: &AppSelector) -> String {
        let Some(node) = self
            .directory
            .current_authority(queue)
            .and_then(|node| self.nodes.get(&node))
        else {
            return format!("{ROUTING_ERROR}\n");
        };
        let mut out = String::new();
        match node.purge_queue(queue, selector).await {
            Ok(outcome) if outcome.is_empty() => {
                let _ = writeln!(out, "{NOTHING_PURGED}");
            }
            Ok(outcome) => render_purged(
                &mut out,
                &[QueuePurge {
                    queue: queue.clone(),
                    outcome,
                }],
            ),
            Err(BrokerError::Unreachable(_)) | Err(BrokerError::NotAuthority { .. }) => {
                let _ = writeln!(out, "{ROUTING_ERROR}");
            }
            Err(err) => {
                let _ = writeln!(out, "{err}");
            }
        }
        out
    }
}

fn render_purged(out: &mut String, purged: &[QueuePurge]) {
    if purged.is_empty() {
        let _ = writeln!(out, "{NOTHING_PURGED}");
        return;
    }
    let mut total = PurgeOutcome::default();
    for queue in purged {
        total.merge(queue.outcome);
    }
    let _ = writeln!(
        out,
        "Purged {} message(s) for a total of {} from {} queue(s):",
        total.messages,
        pretty_bytes(total.bytes),
        purged.len()
    );
    for queue in purged {
        let _ = writeln!(
            out,
            "   {}: {} message(s) ({})",
            queue.queue,
            queue.outcome.messages,
            pretty_bytes(queue.outcome.bytes)
        );
    }
}
