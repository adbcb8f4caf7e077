use criterion::{Criterion, criterion_group, criterion_main};
use saga_store::{
    CorrelationIds, EventOutcome, EventType, InMemorySagaStore, NewEventState, NewSaga, SagaAdvance,
    SagaId, SagaQuery, SagaStatus, SagaStore,
};

const STEP: EventType = EventType::from_static("GENERATE_FILE");

fn new_saga(session: usize) -> NewSaga {
    NewSaga::new("RESULTS_EXPORT", r#"{"session_id":"S1"}"#, "bench")
        .correlation_ids(CorrelationIds::new().with("session_id", session.to_string()))
}

fn first_advance(saga_id: SagaId) -> SagaAdvance {
    SagaAdvance {
        saga_id,
        expected_state: None,
        next_state: STEP,
        status: SagaStatus::InProgress,
        update_user: "bench".to_string(),
        event: NewEventState::new(EventType::INITIATED, EventOutcome::INITIATE_SUCCESS, "{}"),
    }
}

fn bench_insert_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/insert_saga", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                store.insert_saga(new_saga(1)).await.unwrap();
            });
        });
    });
}

fn bench_append_event_and_advance(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/append_event_and_advance", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let saga = store.insert_saga(new_saga(1)).await.unwrap();
                store
                    .append_event_and_advance(first_advance(saga.saga_id))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_query_by_correlation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemorySagaStore::new();

    // Pre-populate with 1000 sagas
    rt.block_on(async {
        for session in 0..1000 {
            store.insert_saga(new_saga(session)).await.unwrap();
        }
    });

    c.bench_function("saga_store/query_by_correlation_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let found = store
                    .query_sagas(SagaQuery::in_progress("RESULTS_EXPORT").correlation("session_id", "500"))
                    .await
                    .unwrap();
                assert_eq!(found.len(), 1);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_insert_saga,
    bench_append_event_and_advance,
    bench_query_by_correlation,
);
criterion_main!(benches);
