//! End-to-end scenarios against the assembled core, with in-memory
//! backends and scripted collaborators.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use answer_pipeline::{AnswerEvent, QaOptions};
use common::error::AppError;
use common::storage::lexical::{InMemoryBm25Index, LexicalIndex};
use common::storage::types::group::{Group, Permission};
use common::storage::types::ingestion_task::{IngestionPayload, TaskStatus};
use common::storage::types::passage::{Passage, Visibility};
use common::storage::types::principal::Principal;
use common::storage::vector::{InMemoryVectorStore, VectorStore};
use common::test_utils::{GatedEmbedder, HashingEmbedder, ScriptedChat};
use common::utils::config::AppConfig;
use common::utils::embedding::EmbeddingProvider;
use common::utils::groups::InMemoryGroupDirectory;
use common::utils::identity::StaticIdentityResolver;
use common::utils::llm::ChatCompleter;
use knowledge_core::{KnowledgeCore, ProviderFactory};

const DIM: usize = 256;

struct Harness {
    core: KnowledgeCore,
    vector: Arc<InMemoryVectorStore>,
    lexical: Arc<InMemoryBm25Index>,
    chat: Arc<ScriptedChat>,
    groups: Arc<InMemoryGroupDirectory>,
    gate: Arc<GatedEmbedder>,
    identity: Arc<StaticIdentityResolver>,
}

fn provider_factory(gate: Arc<GatedEmbedder>) -> ProviderFactory {
    Arc::new(move |provider_id: &str| {
        let gate = Arc::clone(&gate);
        let provider_id = provider_id.to_string();
        Box::pin(async move {
            match provider_id.as_str() {
                "hashed-256" => {
                    Ok(Arc::new(HashingEmbedder::new(256)) as Arc<dyn EmbeddingProvider>)
                }
                "hashed-1024" => {
                    Ok(Arc::new(HashingEmbedder::new(1024)) as Arc<dyn EmbeddingProvider>)
                }
                "hashed-4096" => {
                    Ok(Arc::new(HashingEmbedder::new(4096)) as Arc<dyn EmbeddingProvider>)
                }
                "gated" => Ok(gate as Arc<dyn EmbeddingProvider>),
                other => Err(AppError::Validation(format!("unknown provider {other}"))),
            }
        })
    })
}

async fn harness(
    responses: &[&str],
    store_dimension: usize,
    mutate: impl FnOnce(&mut AppConfig),
) -> Harness {
    let mut config = AppConfig {
        embedding_provider_id: "hashed-256".to_string(),
        query_rewrite_enabled: false,
        ..AppConfig::default()
    };
    mutate(&mut config);

    let identity = Arc::new(StaticIdentityResolver::new());
    identity.register("tok-alice", Principal::user("alice"));
    identity.register("tok-bob", Principal::user("bob"));
    identity.register("tok-admin", Principal::admin("root"));
    let identity_handle = Arc::clone(&identity);

    let groups = Arc::new(InMemoryGroupDirectory::new());
    let vector = Arc::new(InMemoryVectorStore::new(store_dimension));
    let lexical = Arc::new(InMemoryBm25Index::new());
    let chat = Arc::new(ScriptedChat::new(responses.iter().copied()));
    let gate = GatedEmbedder::closed(store_dimension);

    let core = KnowledgeCore::builder(config)
        .with_identity(identity)
        .with_groups(Arc::clone(&groups) as Arc<dyn common::utils::groups::GroupDirectory>)
        .with_vector_store(Arc::clone(&vector) as Arc<dyn VectorStore>)
        .with_lexical_index(Arc::clone(&lexical) as Arc<dyn LexicalIndex>)
        .with_chat(Arc::clone(&chat) as Arc<dyn ChatCompleter>)
        .with_provider_factory(provider_factory(Arc::clone(&gate)))
        .build()
        .await
        .expect("core should assemble");

    Harness {
        core,
        vector,
        lexical,
        chat,
        groups,
        gate,
        identity: identity_handle,
    }
}

async fn seed_passage(
    harness: &Harness,
    dimension: usize,
    id: &str,
    text: &str,
    owner: Option<&str>,
    visibility: Visibility,
    groups: &[&str],
) {
    let mut passage = Passage::new(
        text.to_string(),
        None,
        "notes.md".to_string(),
        format!("entry-{id}"),
        owner.map(ToString::to_string),
        visibility,
        groups.iter().map(ToString::to_string).collect::<BTreeSet<_>>(),
    );
    passage.id = id.to_string();

    let embedder = HashingEmbedder::new(dimension);
    let vectors = embedder
        .encode(&[passage.embedding_text()])
        .await
        .expect("encode");
    harness
        .vector
        .upsert(&passage, vectors.into_iter().next().expect("vector"))
        .await
        .expect("upsert");
    harness.lexical.index(&passage).await.expect("index");
}

async fn wait_for_terminal(core: &KnowledgeCore, task_id: &str, handle: &str) -> TaskStatus {
    for _ in 0..300 {
        let view = core.task_status(task_id, handle).await.expect("status");
        if view.status.is_terminal() {
            return view.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

// Scenario: basic retrieval + answer over a one-passage corpus.
#[tokio::test]
async fn basic_retrieval_and_answer() {
    let harness = harness(&["Qdrant is a vector database[^1]."], DIM, |_| {}).await;
    seed_passage(
        &harness,
        DIM,
        "p1",
        "Qdrant is a vector database.",
        None,
        Visibility::Public,
        &[],
    )
    .await;

    let result = harness
        .core
        .answer("What is Qdrant?", "tok-bob", &QaOptions::default())
        .await
        .expect("answer");

    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].index, 1);
    assert_eq!(result.sources[0].passage_id, "p1");
    assert!(result.answer.contains("vector database"));
    assert!(!result.is_refusal);
    assert!(!result.from_cache);
    harness.core.shutdown().await;
}

// Scenario: a private passage never reaches another principal.
#[tokio::test]
async fn acl_excludes_foreign_private_passages() {
    let harness = harness(&[], DIM, |_| {}).await;
    seed_passage(
        &harness,
        DIM,
        "p_priv",
        "Qdrant credentials for the research cluster.",
        Some("alice"),
        Visibility::Private,
        &[],
    )
    .await;
    seed_passage(
        &harness,
        DIM,
        "p_pub",
        "Qdrant is a vector database.",
        None,
        Visibility::Public,
        &[],
    )
    .await;

    let hits = harness
        .core
        .search("Qdrant cluster", 5, &[], "tok-bob")
        .await
        .expect("search");

    assert!(hits.iter().all(|hit| hit.passage_id != "p_priv"));
    assert!(hits.iter().any(|hit| hit.passage_id == "p_pub"));

    // Alice sees her own private passage.
    let hits = harness
        .core
        .search("Qdrant cluster", 5, &[], "tok-alice")
        .await
        .expect("search");
    assert!(hits.iter().any(|hit| hit.passage_id == "p_priv"));
    harness.core.shutdown().await;
}

// Scenario: the second identical question is served from the cache.
#[tokio::test]
async fn semantic_cache_serves_repeat_question() {
    let harness = harness(&["Qdrant is a vector database[^1]."], DIM, |_| {}).await;
    seed_passage(
        &harness,
        DIM,
        "p1",
        "Qdrant is a vector database.",
        None,
        Visibility::Public,
        &[],
    )
    .await;

    let first = harness
        .core
        .answer("What is Qdrant?", "tok-bob", &QaOptions::default())
        .await
        .expect("answer");
    let second = harness
        .core
        .answer("What is Qdrant?", "tok-bob", &QaOptions::default())
        .await
        .expect("answer");

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.answer, second.answer);
    assert_eq!(harness.chat.requests().len(), 1, "generator ran once");
    harness.core.shutdown().await;
}

// Scenario: provider reload to a different dimension degrades writes,
// evicts stale cache entries and leaves lexical search serving.
#[tokio::test]
async fn dimension_mismatch_on_reload() {
    let harness = harness(
        &["Qdrant is a vector database[^1]."],
        1024,
        |config| config.embedding_provider_id = "hashed-1024".to_string(),
    )
    .await;
    seed_passage(
        &harness,
        1024,
        "p1",
        "Qdrant is a vector database.",
        None,
        Visibility::Public,
        &[],
    )
    .await;

    // Warm the cache at dimension 1024.
    let warm = harness
        .core
        .answer("What is Qdrant?", "tok-bob", &QaOptions::default())
        .await
        .expect("answer");
    assert!(!warm.from_cache);

    harness.core.set_embedding_provider_target("hashed-4096");
    let report = harness
        .core
        .reload_embedding_provider()
        .await
        .expect("reload");
    assert!(report.swapped);
    assert!(report.write_degraded);
    assert_eq!(report.dimension, 4096);

    // Ingestion now refuses with a dimension mismatch.
    let task_id = harness
        .core
        .submit_ingestion(
            IngestionPayload {
                entry_id: None,
                source: "new.md".to_string(),
                text: "Fresh knowledge that cannot be embedded right now.".to_string(),
                context: None,
                visibility: Visibility::Private,
                group_ids: BTreeSet::new(),
            },
            "tok-alice",
        )
        .await
        .expect("submission is accepted, the task itself fails");
    match wait_for_terminal(&harness.core, &task_id, "tok-alice").await {
        TaskStatus::Failed { error } => {
            assert!(error.to_lowercase().contains("dimension mismatch"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Cache entries with the old fingerprint dimension are gone: the same
    // question reaches the generator again.
    let after = harness
        .core
        .answer("What is Qdrant?", "tok-bob", &QaOptions::default())
        .await
        .expect("answer");
    assert!(!after.from_cache);
    assert_eq!(harness.chat.requests().len(), 2);

    // Existing passages remain reachable through the lexical channel.
    let hits = harness
        .core
        .search("Qdrant", 5, &[], "tok-bob")
        .await
        .expect("search");
    assert!(hits.iter().any(|hit| hit.passage_id == "p1"));
    harness.core.shutdown().await;
}

// Scenario: queue backpressure with stalled workers.
#[tokio::test]
async fn queue_backpressure_fails_fast() {
    let harness = harness(&[], DIM, |config| {
        config.embedding_provider_id = "gated".to_string();
        config.max_workers = 1;
        config.queue_capacity = 2;
    })
    .await;

    let payload = |name: &str| IngestionPayload {
        entry_id: None,
        source: format!("{name}.md"),
        text: format!("Document {name} with enough text to chunk and store."),
        context: None,
        visibility: Visibility::Private,
        group_ids: BTreeSet::new(),
    };

    // Occupy the only worker, then fill both queue slots.
    let plug = harness
        .core
        .submit_ingestion(payload("plug"), "tok-alice")
        .await
        .expect("submit");
    for _ in 0..300 {
        let view = harness
            .core
            .task_status(&plug, "tok-alice")
            .await
            .expect("status");
        if view.status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first = harness
        .core
        .submit_ingestion(payload("one"), "tok-alice")
        .await
        .expect("submit");
    let second = harness
        .core
        .submit_ingestion(payload("two"), "tok-alice")
        .await
        .expect("submit");
    let overflow = harness
        .core
        .submit_ingestion(payload("three"), "tok-alice")
        .await;
    assert!(matches!(overflow, Err(AppError::QueueFull)));

    harness.gate.release();
    for task_id in [&plug, &first, &second] {
        let status = wait_for_terminal(&harness.core, task_id, "tok-alice").await;
        assert!(
            matches!(status, TaskStatus::Completed { .. }),
            "accepted task must complete, got {status:?}"
        );
    }
    harness.core.shutdown().await;
}

// Scenario: streaming answer with citations.
#[tokio::test]
async fn streaming_citation_event_order() {
    let harness = harness(&["Qdrant[^1] stores vectors[^1]."], DIM, |_| {}).await;
    seed_passage(
        &harness,
        DIM,
        "p1",
        "Qdrant is a vector database.",
        None,
        Visibility::Public,
        &[],
    )
    .await;

    let stream = harness
        .core
        .answer_stream(
            "What is Qdrant?".to_string(),
            "tok-bob",
            QaOptions::default(),
        )
        .await
        .expect("stream");
    let events: Vec<AnswerEvent> = stream.collect().await;

    let AnswerEvent::Sources(sources) = &events[0] else {
        panic!("first event must be sources, got {:?}", events[0]);
    };
    assert_eq!(sources[0].index, 1);
    assert_eq!(sources[0].passage_id, "p1");

    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            AnswerEvent::Chunk(chunk) => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert!(chunks.len() >= 2);
    assert_eq!(chunks.concat(), "Qdrant[^1] stores vectors[^1].");

    let highlights = events
        .iter()
        .find_map(|event| match event {
            AnswerEvent::Highlights(highlights) => Some(highlights.clone()),
            _ => None,
        })
        .expect("highlights event");
    assert_eq!(highlights, HashMap::from([(1usize, 2usize)]));

    assert!(matches!(events.last(), Some(AnswerEvent::Done)));
    harness.core.shutdown().await;
}

// Law: ingest then delete-by-entry leaves nothing searchable.
#[tokio::test]
async fn delete_by_entry_removes_from_both_indices() {
    let harness = harness(&[], DIM, |_| {}).await;

    // Default provider is the plain hashing embedder; no gate involved.
    let task_id = harness
        .core
        .submit_ingestion(
            IngestionPayload {
                entry_id: Some("entry-doomed".to_string()),
                source: "doomed.md".to_string(),
                text: "Ephemeral knowledge about zeppelin maintenance procedures \
                       and the care of hydrogen valves in cold weather."
                    .to_string(),
                context: None,
                visibility: Visibility::Private,
                group_ids: BTreeSet::new(),
            },
            "tok-alice",
        )
        .await
        .expect("submit");
    let status = wait_for_terminal(&harness.core, &task_id, "tok-alice").await;
    let TaskStatus::Completed { passage_ids } = status else {
        panic!("expected completion, got {status:?}");
    };
    assert!(!passage_ids.is_empty());

    // Ingested passages are present in both indices.
    for id in &passage_ids {
        assert!(harness.vector.contains(id));
        assert!(harness.lexical.contains(id).await.expect("contains"));
    }

    // Bob may not delete Alice's entry.
    let err = harness
        .core
        .delete_passages_by_entry("entry-doomed", "tok-bob")
        .await
        .expect_err("foreign delete must fail");
    assert!(matches!(err, AppError::Forbidden(_)));

    harness
        .core
        .delete_passages_by_entry("entry-doomed", "tok-alice")
        .await
        .expect("delete");

    for id in &passage_ids {
        assert!(!harness.vector.contains(id));
        assert!(!harness.lexical.contains(id).await.expect("contains"));
    }
    let hits = harness
        .core
        .search("zeppelin maintenance", 5, &[], "tok-alice")
        .await
        .expect("search");
    assert!(hits.is_empty());
    harness.core.shutdown().await;
}

// Law: reloading onto the same target is a no-op.
#[tokio::test]
async fn reload_with_same_target_is_idempotent() {
    let harness = harness(&[], DIM, |_| {}).await;

    let report = harness
        .core
        .reload_embedding_provider()
        .await
        .expect("reload");
    assert!(!report.swapped);
    assert!(!report.write_degraded);
    assert_eq!(report.previous_id, report.active_id);
    harness.core.shutdown().await;
}

// Group-scoped retrieval: a shared group passage is visible through the
// filter, everything else drops out.
#[tokio::test]
async fn group_filter_scopes_results() {
    let harness = harness(&[], DIM, |_| {}).await;

    let group = Group::new("research".to_string(), "alice".to_string())
        .with_share("carol", Permission::Read);
    let group_id = group.id.clone();
    harness.groups.insert(group);

    // Carol's resolved identity carries the share grant.
    harness.identity.register(
        "tok-carol",
        Principal::user("carol").with_readable_group(&group_id),
    );

    seed_passage(
        &harness,
        DIM,
        "p_grouped",
        "Research notes on Qdrant sharding.",
        Some("alice"),
        Visibility::Private,
        &[group_id.as_str()],
    )
    .await;
    seed_passage(
        &harness,
        DIM,
        "p_public",
        "Qdrant is a vector database.",
        None,
        Visibility::Public,
        &[],
    )
    .await;

    // The admin sees group-scoped results without enumeration.
    let hits = harness
        .core
        .search("Qdrant", 5, &["research".to_string()], "tok-admin")
        .await
        .expect("search");
    assert!(hits.iter().any(|hit| hit.passage_id == "p_grouped"));
    assert!(hits.iter().all(|hit| hit.passage_id != "p_public"));

    // The share holder sees the grouped passage behind the filter.
    let hits = harness
        .core
        .search("Qdrant", 5, &["research".to_string()], "tok-carol")
        .await
        .expect("search");
    assert!(hits.iter().any(|hit| hit.passage_id == "p_grouped"));

    // A principal without the share loses everything behind the filter.
    let hits = harness
        .core
        .search("Qdrant", 5, &["research".to_string()], "tok-bob")
        .await
        .expect("search");
    assert!(hits.is_empty());
    harness.core.shutdown().await;
}

// Task status is private to its submitter (and admins).
#[tokio::test]
async fn task_status_is_scoped_to_submitter() {
    let harness = harness(&[], DIM, |_| {}).await;

    let task_id = harness
        .core
        .submit_ingestion(
            IngestionPayload {
                entry_id: None,
                source: "private.md".to_string(),
                text: "Some document text that belongs to alice alone.".to_string(),
                context: None,
                visibility: Visibility::Private,
                group_ids: BTreeSet::new(),
            },
            "tok-alice",
        )
        .await
        .expect("submit");

    let err = harness
        .core
        .task_status(&task_id, "tok-bob")
        .await
        .expect_err("foreign status read must fail");
    assert!(matches!(err, AppError::Forbidden(_)));

    assert!(harness.core.task_status(&task_id, "tok-alice").await.is_ok());
    assert!(harness.core.task_status(&task_id, "tok-admin").await.is_ok());

    let err = harness
        .core
        .task_status("no-such-task", "tok-alice")
        .await
        .expect_err("unknown task");
    assert!(matches!(err, AppError::NotFound(_)));
    harness.core.shutdown().await;
}
