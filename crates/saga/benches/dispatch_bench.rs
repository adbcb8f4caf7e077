use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use saga::results_export::{self, DEFAULT_STEP_TIMEOUT, ResultsExportPayload, TOPIC};
use saga::{InMemoryChannel, InMemoryDownstreamNotifier, InMemoryFileGenerator, SagaService};
use saga_store::{CorrelationIds, InMemorySagaStore};

fn orchestrator() -> (
    results_export::ResultsExportOrchestrator<InMemorySagaStore, InMemoryChannel>,
    InMemoryChannel,
) {
    let channel = InMemoryChannel::new();
    let orchestrator = results_export::orchestrator(
        SagaService::new(InMemorySagaStore::new()),
        channel.clone(),
        Arc::new(InMemoryFileGenerator::new()),
        Arc::new(InMemoryDownstreamNotifier::new()),
        DEFAULT_STEP_TIMEOUT,
    )
    .unwrap();
    (orchestrator, channel)
}

fn bench_start_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (orchestrator, _channel) = orchestrator();
    let payload = ResultsExportPayload::new("S1", "MATH");

    c.bench_function("dispatch/create_and_start", |b| {
        b.iter(|| {
            rt.block_on(async {
                orchestrator
                    .create_and_start(&payload, "bench", CorrelationIds::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_full_workflow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("dispatch/results_export_end_to_end", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (orchestrator, channel) = orchestrator();
                orchestrator
                    .create_and_start(
                        &ResultsExportPayload::new("S1", "MATH"),
                        "bench",
                        CorrelationIds::new(),
                    )
                    .await
                    .unwrap();

                // Start, generate, notify and finalize.
                for i in 0..4 {
                    let event = channel.published(TOPIC)[i].clone();
                    orchestrator.handle_event(&event).await.unwrap();
                }
            });
        });
    });
}

criterion_group!(benches, bench_start_saga, bench_full_workflow);
criterion_main!(benches);
