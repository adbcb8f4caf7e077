//! Results export workflow.
//!
//! Generates the results file of an assessment session, then notifies the
//! downstream system that the file is ready:
//!
//! 1. `(INITIATED, INITIATE_SUCCESS)` runs `GENERATE_RESULTS_FILE`
//! 2. `(GENERATE_RESULTS_FILE, RESULTS_FILE_GENERATED)` runs `NOTIFY_DOWNSTREAM`
//! 3. `(NOTIFY_DOWNSTREAM, DOWNSTREAM_NOTIFIED)` ends the saga
//!
//! Both handlers check their collaborator before acting, so a redelivered
//! event does not generate or notify twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{EventOutcome, EventType};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};

use crate::channel::MessageChannel;
use crate::error::{Result, SagaError};
use crate::event::Event;
use crate::graph::{StepContext, StepGraph, StepHandler};
use crate::orchestrator::Orchestrator;
use crate::retry::with_timeout;
use crate::service::SagaService;
use crate::services::{DownstreamNotifier, FileGenerator};

pub const SAGA_NAME: &str = "RESULTS_EXPORT";
pub const TOPIC: &str = "results-export";

/// Correlation key under which the session is recorded on the saga.
pub const SESSION_KEY: &str = "session_id";

pub const GENERATE_RESULTS_FILE: EventType = EventType::from_static("GENERATE_RESULTS_FILE");
pub const RESULTS_FILE_GENERATED: EventOutcome = EventOutcome::from_static("RESULTS_FILE_GENERATED");
pub const NOTIFY_DOWNSTREAM: EventType = EventType::from_static("NOTIFY_DOWNSTREAM");
pub const DOWNSTREAM_NOTIFIED: EventOutcome = EventOutcome::from_static("DOWNSTREAM_NOTIFIED");

/// Default bound on a single collaborator call.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Payload carried by every event of the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsExportPayload {
    pub session_id: String,
    pub assessment_code: String,
    /// Set once the file has been generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ResultsExportPayload {
    pub fn new(session_id: impl Into<String>, assessment_code: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            assessment_code: assessment_code.into(),
            file_name: None,
        }
    }
}

pub type ResultsExportOrchestrator<S, C> = Orchestrator<ResultsExportPayload, S, C>;

/// Runs `GENERATE_RESULTS_FILE`.
pub struct GenerateResultsFile {
    generator: Arc<dyn FileGenerator>,
    timeout: Duration,
}

impl GenerateResultsFile {
    pub fn new(generator: Arc<dyn FileGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }
}

#[async_trait]
impl StepHandler<ResultsExportPayload> for GenerateResultsFile {
    async fn handle(&self, ctx: StepContext<ResultsExportPayload>) -> Result<Event> {
        let saga_id = ctx.event.saga_id();

        let file = match self.generator.find_by_saga(saga_id).await? {
            Some(file) => {
                tracing::info!(%saga_id, file_name = %file.file_name, "results file already generated");
                file
            }
            None => {
                with_timeout(
                    "generate_results_file",
                    self.timeout,
                    self.generator.generate(
                        saga_id,
                        &ctx.payload.session_id,
                        &ctx.payload.assessment_code,
                    ),
                )
                .await?
            }
        };

        let payload = ResultsExportPayload {
            file_name: Some(file.file_name),
            ..ctx.payload.clone()
        };
        ctx.reply_with(RESULTS_FILE_GENERATED, &payload)
    }
}

/// Runs `NOTIFY_DOWNSTREAM`.
pub struct NotifyDownstream {
    notifier: Arc<dyn DownstreamNotifier>,
    timeout: Duration,
}

impl NotifyDownstream {
    pub fn new(notifier: Arc<dyn DownstreamNotifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }
}

#[async_trait]
impl StepHandler<ResultsExportPayload> for NotifyDownstream {
    async fn handle(&self, ctx: StepContext<ResultsExportPayload>) -> Result<Event> {
        let saga_id = ctx.event.saga_id();
        let Some(file_name) = ctx.payload.file_name.as_deref() else {
            return Err(SagaError::StepFailed {
                step: NOTIFY_DOWNSTREAM.to_string(),
                reason: "payload carries no file name".to_string(),
            });
        };

        if self.notifier.was_notified(saga_id).await? {
            tracing::info!(%saga_id, "downstream already notified");
        } else {
            with_timeout(
                "notify_downstream",
                self.timeout,
                self.notifier.notify(saga_id, file_name),
            )
            .await?;
        }

        ctx.reply_with(DOWNSTREAM_NOTIFIED, &ctx.payload)
    }
}

/// Builds the transition table of the workflow.
pub fn build_graph(
    generator: Arc<dyn FileGenerator>,
    notifier: Arc<dyn DownstreamNotifier>,
    step_timeout: Duration,
) -> Result<StepGraph<ResultsExportPayload>> {
    Ok(StepGraph::builder()
        .begin(
            GENERATE_RESULTS_FILE,
            GenerateResultsFile::new(generator, step_timeout),
        )
        .step(
            GENERATE_RESULTS_FILE,
            RESULTS_FILE_GENERATED,
            NOTIFY_DOWNSTREAM,
            NotifyDownstream::new(notifier, step_timeout),
        )
        .end(NOTIFY_DOWNSTREAM, DOWNSTREAM_NOTIFIED)
        .build()?)
}

/// Wires the workflow to a store and a channel.
pub fn orchestrator<S, C>(
    service: SagaService<S>,
    channel: C,
    generator: Arc<dyn FileGenerator>,
    notifier: Arc<dyn DownstreamNotifier>,
    step_timeout: Duration,
) -> Result<ResultsExportOrchestrator<S, C>>
where
    S: SagaStore,
    C: MessageChannel,
{
    let graph = build_graph(generator, notifier, step_timeout)?;
    Ok(Orchestrator::new(SAGA_NAME, TOPIC, graph, service, channel))
}
