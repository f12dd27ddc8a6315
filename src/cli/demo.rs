//! `demo` command: run the invoice scenarios against the in-memory store
//!
//! Every scenario writes its delivered records to the same JSON-lines log.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit::AuditCoordinator;
use crate::config::AuditSettings;
use crate::error::AuditResult;
use crate::models::FieldValue;
use crate::persistence::UnitOfWork;
use crate::rules::{RuleConfiguration, RuleRegistry};
use crate::sink::{AuditSink, JsonLinesSink};
use crate::storage::{EntitySchema, MemorySession, MemoryStore};

const INVOICE: &str = "billing::Invoice";
const PERMISSION: &str = "finance.read";

/// Records written by each scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSummary {
    pub scenarios: Vec<(String, usize)>,
}

impl DemoSummary {
    pub fn total(&self) -> usize {
        self.scenarios.iter().map(|(_, written)| written).sum()
    }
}

fn invoice_store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new().with_schema(
            EntitySchema::with_generated_key(INVOICE, "Id")
                .property("Total")
                .property("Note")
                .shadow("RowVersion"),
        ),
    )
}

fn audited_session(
    configuration: RuleConfiguration<String>,
    sink: Arc<JsonLinesSink<String>>,
    settings: &AuditSettings,
) -> AuditResult<MemorySession> {
    let registry = RuleRegistry::new().with(configuration)?;
    let coordinator = Arc::new(AuditCoordinator::new(
        Arc::new(registry),
        sink as Arc<dyn AuditSink<String>>,
        settings.clone(),
    ));

    let session = MemorySession::new(invoice_store());
    session.intercept(coordinator);
    Ok(session)
}

/// Create an invoice whose note is ignored
async fn create_with_ignored_note(
    sink: Arc<JsonLinesSink<String>>,
    settings: &AuditSettings,
    cancel: &CancellationToken,
) -> AuditResult<()> {
    let rules = RuleConfiguration::builder(INVOICE, PERMISSION.to_string())
        .ignore("Note")
        .build()?;
    let session = audited_session(rules, sink, settings)?;

    session.add(
        INVOICE,
        [("Total", FieldValue::from(100)), ("Note", FieldValue::Null)],
    )?;
    session.save_changes(cancel).await?;
    Ok(())
}

/// Update an invoice note that is recorded under another name
async fn update_with_renamed_note(
    sink: Arc<JsonLinesSink<String>>,
    settings: &AuditSettings,
    cancel: &CancellationToken,
) -> AuditResult<()> {
    let rules = RuleConfiguration::builder(INVOICE, PERMISSION.to_string())
        .rename("Note", "Comment")
        .build()?;
    let session = audited_session(rules, sink, settings)?;

    let invoice = session.add(
        INVOICE,
        [("Total", FieldValue::from(100)), ("Note", FieldValue::from("a"))],
    )?;
    session.save_changes(cancel).await?;

    session.set(invoice, "Note", "b")?;
    session.save_changes(cancel).await?;
    Ok(())
}

/// Two updates in one host transaction, the first one a no-op
async fn batched_updates_in_transaction(
    sink: Arc<JsonLinesSink<String>>,
    settings: &AuditSettings,
    cancel: &CancellationToken,
) -> AuditResult<()> {
    let rules = RuleConfiguration::builder(INVOICE, PERMISSION.to_string())
        .ignore("Note")
        .build()?;
    let session = audited_session(rules, sink, settings)?;

    let first = session.add(INVOICE, [("Total", FieldValue::from(10))])?;
    let second = session.add(INVOICE, [("Total", FieldValue::from(20))])?;
    session.save_changes(cancel).await?;

    let transaction = session.begin_transaction(cancel).await?;

    session.set(first, "Note", "reviewed")?;
    session.save_changes(cancel).await?;

    session.set(second, "Total", 25)?;
    session.save_changes(cancel).await?;

    transaction.commit(cancel).await?;
    transaction.release();
    Ok(())
}

/// Handle the demo command
pub async fn handle_demo_command(log: &Path, settings: &AuditSettings) -> AuditResult<DemoSummary> {
    let sink = Arc::new(JsonLinesSink::<String>::new(log));
    let cancel = CancellationToken::new();
    let mut scenarios = Vec::new();

    let before = sink.entry_count()?;
    create_with_ignored_note(Arc::clone(&sink), settings, &cancel).await?;
    let after = sink.entry_count()?;
    scenarios.push(("create invoice, note ignored".to_string(), after - before));

    let before = after;
    update_with_renamed_note(Arc::clone(&sink), settings, &cancel).await?;
    let after = sink.entry_count()?;
    scenarios.push(("update invoice, note renamed".to_string(), after - before));

    let before = after;
    batched_updates_in_transaction(Arc::clone(&sink), settings, &cancel).await?;
    let after = sink.entry_count()?;
    scenarios.push(("two updates in one transaction".to_string(), after - before));

    info!(
        path = %log.display(),
        written = after,
        auto_open = settings.auto_open_transaction,
        "Demo finished"
    );

    Ok(DemoSummary { scenarios })
}
