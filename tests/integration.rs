// ── Kioku Integration Tests ────────────────────────────────────────────────
// End-to-end flows against a real SQLite store and temp directories. Unit
// tests inside the modules cover the pure helpers; these cover the wiring.

use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::TempDir;

use kioku::{
    CreateParams, EmbedderConfig, HybridRetriever, IndexTopology, ManagerConfig,
    MemoryError, MemoryManager, MemoryType, RetrievalSource, RetrievalStrategy,
    RetrieveParams, RetrieverConfig, SearchParams, TextEmbedder, VectorIndex,
    VectorIndexConfig,
};

async fn manager_in(dir: &TempDir) -> MemoryManager {
    manager_with(dir, ManagerConfig::default()).await
}

async fn manager_with(dir: &TempDir, mut config: ManagerConfig) -> MemoryManager {
    config.db_path = dir
        .path()
        .join("memory.db")
        .to_string_lossy()
        .into_owned();
    let mut manager = MemoryManager::new(config);
    manager.initialize().await.unwrap();
    manager
}

// Retriever wired over the manager's store, with an embedder that points
// at a dead port so every test runs fully degraded (lexical only).
fn retriever_over(dir: &TempDir, manager: &MemoryManager) -> HybridRetriever {
    let vector = Arc::new(RwLock::new(VectorIndex::new(VectorIndexConfig {
        index_path: dir.path().join("vector").join("memory.index"),
        dimension: 4,
        topology: IndexTopology::Flat,
        ef_search: 64,
        top_k: 15,
    })));
    let embedder = Arc::new(TextEmbedder::new(EmbedderConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        ..EmbedderConfig::default()
    }));
    HybridRetriever::new(
        RetrieverConfig::default(),
        manager.lexical_index(),
        vector,
        embedder,
    )
}

// ── Manager: creation + composite search ───────────────────────────────────

#[tokio::test]
async fn search_ranks_by_composite_score_and_applies_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    for importance in [0.3, 0.9, 0.7] {
        manager
            .create_memory(
                format!("主人说苹果很好吃 {importance}"),
                MemoryType::Fact,
                CreateParams {
                    importance: Some(importance),
                    ..CreateParams::default()
                },
            )
            .unwrap();
    }

    // Fresh records: recency ≈ 1, one touch of frequency, so the composite
    // is ≈ 0.6·importance + 0.33. Only 0.9 and 0.7 clear the 0.65 gate.
    let envelope = manager.search("苹果", SearchParams::default()).await.unwrap();
    assert_eq!(envelope.memories.len(), 2);
    assert_eq!(envelope.memories[0].memory.importance, 0.9);
    assert_eq!(envelope.memories[1].memory.importance, 0.7);
    assert!(envelope.memories[0].final_score > envelope.memories[1].final_score);
    assert_eq!(envelope.total_candidates, 3);
    assert_eq!(envelope.strategy_used, "lexical");
    // Bookkeeping stays in the envelope until expand_memory persists it.
    let top_id = &envelope.memories[0].memory.id;
    assert_eq!(envelope.memories[0].memory.access_count, 1);
    let stored = manager.expand_memory(top_id).await.unwrap().unwrap();
    assert_eq!(stored.access_count, 1);
}

#[tokio::test]
async fn unmatched_query_returns_empty_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    manager
        .create_memory("likes tea", MemoryType::Fact, CreateParams::default())
        .unwrap();
    let envelope = manager
        .search("completely unrelated zebra", SearchParams::default())
        .await
        .unwrap();
    assert!(!envelope.has_results());
    assert_eq!(envelope.total_candidates, 0);
}

#[tokio::test]
async fn keyword_importance_applies_when_not_overridden() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let salient = manager
        .create_memory("记住我的生日", MemoryType::Fact, CreateParams::default())
        .unwrap();
    assert_eq!(salient.importance, 0.7);
    let plain = manager
        .create_memory("今天天气不错", MemoryType::Episode, CreateParams::default())
        .unwrap();
    assert_eq!(plain.importance, 0.5);
    let forced = manager
        .create_memory(
            "记住这个",
            MemoryType::Fact,
            CreateParams {
                importance: Some(0.2),
                ..CreateParams::default()
            },
        )
        .unwrap();
    assert_eq!(forced.importance, 0.2);
}

#[tokio::test]
async fn quota_rejects_creation_past_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(
        &dir,
        ManagerConfig {
            max_memories: 2,
            ..ManagerConfig::default()
        },
    )
    .await;
    manager
        .create_memory("one", MemoryType::Fact, CreateParams::default())
        .unwrap();
    manager
        .create_memory("two", MemoryType::Fact, CreateParams::default())
        .unwrap();
    let err = manager
        .create_memory("three", MemoryType::Fact, CreateParams::default())
        .unwrap_err();
    match err {
        MemoryError::QuotaExceeded {
            current,
            max_allowed,
        } => {
            assert_eq!(current, 2);
            assert_eq!(max_allowed, 2);
        }
        other => panic!("expected QuotaExceeded, got {other}"),
    }
}

// ── Manager: facts + episodes ──────────────────────────────────────────────

#[tokio::test]
async fn facts_mirror_into_the_store_and_search_back() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let fact = manager
        .create_fact("主人", "喜欢", "咖啡", 0.9, vec!["m1".to_string()])
        .unwrap();

    let found = manager
        .search_facts(Some("主人"), None, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, fact.id);
    assert_eq!(found[0].to_triple(), ("主人", "喜欢", "咖啡"));
    assert_eq!(found[0].confidence, 0.9);
    assert_eq!(found[0].source_memory_ids, vec!["m1".to_string()]);

    // The mirrored record is a fact-typed memory sharing the fact's id.
    let record = manager.expand_memory(&fact.id).await.unwrap().unwrap();
    assert_eq!(record.memory_type, MemoryType::Fact);
    assert_eq!(record.content, "主人喜欢咖啡");
    assert_eq!(record.importance, 0.7);

    // No fragments at all is a no-op, not an error.
    assert!(manager.search_facts(None, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn episode_importance_follows_affinity_magnitude() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let big = manager
        .create_episode("一起去了游乐园", "开心", 6, vec!["主人".to_string()])
        .unwrap();
    let record = manager.expand_memory(&big.id).await.unwrap().unwrap();
    assert_eq!(record.memory_type, MemoryType::Episode);
    assert_eq!(record.importance, 0.8);
    assert_eq!(
        record.metadata.get("emotion_tag"),
        Some(&serde_json::json!("开心"))
    );
    assert_eq!(
        record.metadata.get("affinity_change"),
        Some(&serde_json::json!(6))
    );

    let small = manager.create_episode("聊了聊天气", "平静", 1, vec![]).unwrap();
    let record = manager.expand_memory(&small.id).await.unwrap().unwrap();
    assert_eq!(record.importance, 0.5);
}

// ── Manager: memory index + expand ─────────────────────────────────────────

#[tokio::test]
async fn memory_index_formats_compact_lines() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let record = manager
        .create_memory(
            "主人最喜欢的饮料是手冲咖啡，每天早上都要喝一杯才有精神",
            MemoryType::Fact,
            CreateParams {
                importance: Some(0.9),
                ..CreateParams::default()
            },
        )
        .unwrap();

    let items = manager.get_memory_index("咖啡", 30).await.unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.short_id, record.id.chars().take(8).collect::<String>());
    assert_eq!(item.summary.chars().count(), 20);
    assert!(item.summary.ends_with('…'));
    assert!(item.high_priority);
    let line = item.format_for_prompt();
    assert!(line.contains("[刚刚]"));
    assert!(line.contains("重要度0.9"));
    assert!(line.ends_with('⭐'));
}

#[tokio::test]
async fn expand_memory_persists_access_bookkeeping() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let record = manager
        .create_memory("expandable", MemoryType::Fact, CreateParams::default())
        .unwrap();
    let first = manager.expand_memory(&record.id).await.unwrap().unwrap();
    assert_eq!(first.access_count, 1);
    let second = manager.expand_memory(&record.id).await.unwrap().unwrap();
    assert_eq!(second.access_count, 2);
    assert!(second.last_accessed.is_some());
    assert!(second.last_accessed >= first.last_accessed);

    assert!(manager.expand_memory("no-such-id").await.unwrap().is_none());
}

// ── Manager: conversation ──────────────────────────────────────────────────

#[tokio::test]
async fn conversation_flows_through_working_memory() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = manager_with(
        &dir,
        ManagerConfig {
            max_conversation_turns: 2,
            ..ManagerConfig::default()
        },
    )
    .await;
    manager
        .add_conversation_turn("user", "你好", Default::default())
        .unwrap();
    manager
        .add_conversation_turn("assistant", "你好呀", Default::default())
        .unwrap();
    manager
        .add_conversation_turn("user", "记得我吗", Default::default())
        .unwrap();

    let history = manager.get_conversation_history(None);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "你好呀");
    assert_eq!(history[1].content, "记得我吗");

    let err = manager
        .add_conversation_turn("narrator", "nope", Default::default())
        .unwrap_err();
    assert!(matches!(err, MemoryError::Storage { .. }));

    let stats = manager.get_stats().unwrap();
    assert_eq!(stats.conversation_turns, 2);
    assert!(stats.initialized);

    manager.clear_conversation();
    assert!(manager.get_conversation_history(None).is_empty());
}

// ── Retriever: degraded hybrid + maintenance ───────────────────────────────

#[tokio::test]
async fn hybrid_degrades_to_lexical_without_an_embedder() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let retriever = retriever_over(&dir, &manager);
    retriever.initialize().await.unwrap();

    let record = manager
        .create_memory(
            "主人喜欢在雨天听爵士乐",
            MemoryType::Fact,
            CreateParams {
                importance: Some(0.9),
                ..CreateParams::default()
            },
        )
        .unwrap();

    let envelope = retriever
        .retrieve("爵士乐", RetrieveParams::default())
        .await
        .unwrap();
    assert_eq!(envelope.strategy_used, "hybrid");
    assert_eq!(envelope.memories.len(), 1);
    assert_eq!(envelope.memories[0].memory.id, record.id);
    assert_eq!(envelope.memories[0].source, RetrievalSource::Lexical);
    // No vector contribution, so semantic similarity reports 0.
    assert_eq!(envelope.memories[0].similarity_score, 0.0);

    let stats = retriever.stats().unwrap();
    assert_eq!(stats.lexical_records, 1);
    assert_eq!(stats.indexed_vectors, 0);
    assert_eq!(stats.vector_dimension, 4);
    assert!(!stats.embedder_ready);
}

#[tokio::test]
async fn adaptive_strategy_reports_its_delegate() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let retriever = retriever_over(&dir, &manager);
    retriever.initialize().await.unwrap();
    manager
        .create_memory("苹果好吃", MemoryType::Fact, CreateParams::default())
        .unwrap();

    let envelope = retriever
        .retrieve(
            "苹果",
            RetrieveParams {
                strategy: RetrievalStrategy::Adaptive,
                ..RetrieveParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(envelope.strategy_used, "lexical_only");
    assert_eq!(envelope.memories.len(), 1);
}

#[tokio::test]
async fn vector_only_without_embedder_is_a_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let retriever = retriever_over(&dir, &manager);
    retriever.initialize().await.unwrap();

    let err = retriever
        .retrieve(
            "anything at all",
            RetrieveParams {
                strategy: RetrievalStrategy::VectorOnly,
                ..RetrieveParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Retrieval { .. }));
}

#[tokio::test]
async fn add_memory_without_embedder_keeps_the_lexical_write() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let retriever = retriever_over(&dir, &manager);
    retriever.initialize().await.unwrap();

    let record = kioku::MemoryRecord::new("eventually consistent note", MemoryType::Fact);
    let err = retriever.add_memory(&record).await.unwrap_err();
    assert!(matches!(err, MemoryError::Vectorize { .. }));

    // The record is still lexically retrievable and flagged unvectorized.
    let envelope = retriever
        .retrieve("eventually consistent", RetrieveParams::default())
        .await
        .unwrap();
    assert_eq!(envelope.memories.len(), 1);
    assert!(!envelope.memories[0].memory.is_vectorized);
}

#[tokio::test]
async fn remove_memory_clears_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let retriever = retriever_over(&dir, &manager);
    retriever.initialize().await.unwrap();
    let record = manager
        .create_memory("to be forgotten", MemoryType::Fact, CreateParams::default())
        .unwrap();

    assert!(retriever.remove_memory(&record.id).await.unwrap());
    assert!(!retriever.remove_memory(&record.id).await.unwrap());
    let envelope = retriever
        .retrieve("forgotten", RetrieveParams::default())
        .await
        .unwrap();
    assert!(!envelope.has_results());
}

#[tokio::test]
async fn remove_memory_counts_a_vector_only_hit_as_success() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let vector = Arc::new(RwLock::new(VectorIndex::new(VectorIndexConfig {
        index_path: dir.path().join("vector").join("memory.index"),
        dimension: 4,
        topology: IndexTopology::Flat,
        ef_search: 64,
        top_k: 15,
    })));
    let embedder = Arc::new(TextEmbedder::new(EmbedderConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        ..EmbedderConfig::default()
    }));
    let retriever = HybridRetriever::new(
        RetrieverConfig::default(),
        manager.lexical_index(),
        Arc::clone(&vector),
        embedder,
    );
    retriever.initialize().await.unwrap();

    // A vector with no lexical row, as after a partial earlier removal.
    vector
        .write()
        .add_vectors(&["orphan".to_string()], &[vec![1.0, 0.0, 0.0, 0.0]])
        .unwrap();
    assert!(retriever.remove_memory("orphan").await.unwrap());
    assert!(!retriever.remove_memory("orphan").await.unwrap());
    assert!(!vector.read().has_vector("orphan"));
}

#[tokio::test]
async fn retriever_save_persists_the_vector_files() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(&dir).await;
    let retriever = retriever_over(&dir, &manager);
    retriever.initialize().await.unwrap();
    retriever.save().await.unwrap();
    assert!(dir.path().join("vector").join("memory.index").exists());
    assert!(dir.path().join("vector").join("memory.json").exists());
}

// ── Store reopening ────────────────────────────────────────────────────────

#[tokio::test]
async fn records_survive_a_manager_restart() {
    let dir = tempfile::tempdir().unwrap();
    let record_id;
    {
        let mut manager = manager_in(&dir).await;
        let record = manager
            .create_memory(
                "durable note about 茶道",
                MemoryType::Fact,
                CreateParams {
                    importance: Some(0.9),
                    ..CreateParams::default()
                },
            )
            .unwrap();
        record_id = record.id;
        manager.close().await;
    }
    let manager = manager_in(&dir).await;
    let record = manager.expand_memory(&record_id).await.unwrap().unwrap();
    assert_eq!(record.content, "durable note about 茶道");
    let envelope = manager.search("茶道", SearchParams::default()).await.unwrap();
    assert_eq!(envelope.memories.len(), 1);
}
