use anyhow::Result;
use async_trait::async_trait;
use ocr_question_bank::bank::{QuestionBank, QuestionFilter, StoredSyllabus, WorkspaceStore};
use ocr_question_bank::clients::{EmbeddingProvider, ReasoningOracle};
use ocr_question_bank::error::EmbeddingError;
use ocr_question_bank::models::{
    Document, DocumentSource, Independence, LabelEmbedding, QuestionType, RecordStatus, Taxonomy,
};
use ocr_question_bank::services::SyllabusService;
use ocr_question_bank::workflow::{DocumentCtx, DocumentFlow, FlowStats};
use ocr_question_bank::{App, Config};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ========== 测试桩 ==========

/// 按用户消息内容路由响应的桩 Oracle
///
/// 每个条目是 (needle 列表, 响应)，消息包含全部 needle 才命中；
/// 按条目顺序取首个命中。无状态，重试拿到同一响应。
struct StubOracle {
    replies: Vec<(Vec<&'static str>, &'static str)>,
}

#[async_trait]
impl ReasoningOracle for StubOracle {
    async fn complete(&self, user_message: &str, _system: Option<&str>) -> Result<String> {
        self.replies
            .iter()
            .find(|(needles, _)| needles.iter().all(|n| user_message.contains(n)))
            .map(|(_, reply)| reply.to_string())
            .ok_or_else(|| anyhow::anyhow!("无匹配的脚本响应"))
    }

    fn model_name(&self) -> &str {
        "stub-oracle"
    }
}

/// 按文本内容路由向量的桩 Embedding
///
/// 首个 needle 命中的路由生效，无命中时返回 fallback 向量。
struct RoutedEmbedder {
    model: &'static str,
    routes: Vec<(&'static str, Vec<f32>)>,
    fallback: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for RoutedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self
            .routes
            .iter()
            .find(|(needle, _)| text.contains(needle))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn dimensions(&self) -> usize {
        self.fallback.len()
    }

    fn model_id(&self) -> &str {
        self.model
    }
}

// ========== 共享样本 ==========

const SYLLABUS_TEXT: &str = "Linear Algebra, Fall 2024.\n\
    Topics covered:\n\
    - Matrices: Determinants, Eigenvalues\n\
    Grading: 60% final exam.\n";

const SAMPLE_EXAM: &str = "1. Is the determinant of A zero? 2. Explain eigenvalues in 2 sentences.\n\
    \n\
    3. Consider the system below.\n\
    (a) Find the equilibrium point.\n\
    (b) Using your answer from (a), classify its stability.\n";

fn exam_oracle() -> Arc<StubOracle> {
    Arc::new(StubOracle {
        replies: vec![
            (
                vec!["<Syllabus>"],
                r#"{"course_name": "Linear Algebra", "topics": [{"name": "Matrices", "subtopics": ["Determinants", "Eigenvalues"]}]}"#,
            ),
            // 深度互赖裁决在分类提示之前匹配，两个 needle 同时命中才生效
            (
                vec!["Decide whether the sub-questions", "Define entropy"],
                r#"{"sub_questions_independent": true, "question_starts": ["(a) Define entropy.", "(b) Define informati"]}"#,
            ),
            (
                vec!["Is the determinant of A"],
                "question_start: 1. Is the determinan\nquestion_type: True/False\nsub_questions_independent: None",
            ),
            (
                vec!["Explain eigenvalues"],
                "question_start: 2. Explain eigenvalu\nquestion_type: Short Answer\nsub_questions_independent: None",
            ),
            (
                vec!["Consider the system"],
                "question_start: 3. Consider the syst\nquestion_type: Theory\nsub_questions_independent: false",
            ),
            (
                vec!["Answer both parts"],
                "question_start: 4. Answer both parts\nquestion_type: Theory\nsub_questions_independent: true",
            ),
            (
                vec!["Compute the rank"],
                "question_start: 1. Compute the rank\nquestion_type: Numerical\nsub_questions_independent: None",
            ),
            (
                vec!["Mystery question"],
                "I refuse to answer in the requested format.",
            ),
        ],
    })
}

/// 轴向量桩：行列式与特征值各占一轴，其余文本落到第三轴
///
/// `swapped` 模拟换了一个把同样文本放到不同轴上的新向量模型。
fn axis_embedder(model: &'static str, swapped: bool) -> Arc<RoutedEmbedder> {
    let (det, eigen) = if swapped {
        (vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0])
    } else {
        (vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0])
    };
    Arc::new(RoutedEmbedder {
        model,
        routes: vec![
            ("Matrices: Determinants", det.clone()),
            ("Matrices: Eigenvalues", eigen.clone()),
            ("determinant", det),
            ("eigenvalu", eigen),
        ],
        fallback: vec![0.0, 0.0, 1.0],
    })
}

fn test_config() -> Config {
    Config {
        retry_base_delay_ms: 0,
        ..Config::default()
    }
}

fn build_flow(oracle: Arc<StubOracle>, embedder: Arc<RoutedEmbedder>) -> DocumentFlow {
    DocumentFlow::new(&test_config(), oracle, embedder).expect("流程创建失败")
}

fn source(id: &str, raw_text: &str) -> DocumentSource {
    DocumentSource {
        id: id.to_string(),
        name: format!("{}.mmd", id),
        file_path: format!("ocr_results/{}.mmd", id),
        raw_text: raw_text.to_string(),
    }
}

fn temp_workspace(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("时钟异常")
        .subsec_nanos();
    std::env::temp_dir().join(format!("qbank_it_{}_{}_{}", tag, std::process::id(), nanos))
}

/// 大纲 → 标签向量 → 全流程处理样本试卷
async fn ingest_sample(
    flow: &DocumentFlow,
    oracle: Arc<StubOracle>,
) -> (Taxonomy, Vec<LabelEmbedding>, Document, FlowStats) {
    let syllabus_service = SyllabusService::new(oracle, 2, 0).expect("大纲服务创建失败");
    let taxonomy = syllabus_service
        .build_taxonomy(SYLLABUS_TEXT)
        .await
        .expect("大纲解析应当成功");
    let labels = flow.embed_labels(&taxonomy).await.expect("标签向量应当成功");

    let (document, stats) = flow
        .run(
            &source("midterm_a", SAMPLE_EXAM),
            &labels,
            &DocumentCtx::new("midterm_a".to_string(), 1),
        )
        .await;
    (taxonomy, labels, document, stats)
}

// ========== 端到端场景 ==========

#[tokio::test]
async fn full_pipeline_builds_tagged_records() {
    let oracle = exam_oracle();
    let flow = build_flow(Arc::clone(&oracle), axis_embedder("stub-embed-v1", false));
    let (_taxonomy, labels, document, stats) = ingest_sample(&flow, oracle).await;

    assert_eq!(labels.len(), 2);
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.complete, 3);
    assert_eq!(stats.tagged, 2);

    // 同一行里的两道短题被拆开，无子问时互赖性三态为"不存在"
    let det = &document.records[0];
    assert_eq!(det.id.to_string(), "midterm_a#1");
    assert_eq!(det.question_type, Some(QuestionType::TrueFalse));
    assert_eq!(det.sub_questions_independent, Independence::NoSubQuestions);
    assert!(det.raw_text.starts_with(&det.snippet));
    assert_eq!(det.topics[0].topic, "Matrices");
    assert_eq!(det.topics[0].subtopic, "Determinants");

    let eigen = &document.records[1];
    assert_eq!(eigen.id.to_string(), "midterm_a#2");
    assert_eq!(eigen.question_type, Some(QuestionType::ShortAnswer));
    assert_eq!(eigen.sub_questions_independent, Independence::NoSubQuestions);
    assert_eq!(eigen.topics[0].subtopic, "Eigenvalues");

    // "(b) Using your answer from (a)" 由本地回指扫描判 dependent
    let system = &document.records[2];
    assert_eq!(system.sub_questions_independent, Independence::Dependent);
    assert_eq!(system.local_scan_dependent, Some(true));
    assert!(system.sub_question_snippets.is_empty());
    // 相似度低于阈值：不打标签，但仍可检索
    assert!(system.topics.is_empty());
    assert!(system.is_searchable());
}

#[tokio::test]
async fn published_documents_are_filterable_and_searchable() {
    let oracle = exam_oracle();
    let embedder = axis_embedder("stub-embed-v1", false);
    let flow = build_flow(Arc::clone(&oracle), Arc::clone(&embedder));
    let (taxonomy, _labels, document, _stats) = ingest_sample(&flow, oracle).await;

    let bank = QuestionBank::new();
    assert!(bank.publish_document(document).await.is_none());
    assert_eq!(bank.document_count().await, 1);
    assert_eq!(bank.record_count().await, 3);

    let in_topic = bank
        .filter_records(&QuestionFilter {
            topic: Some("Matrices".to_string()),
            ..QuestionFilter::default()
        })
        .await;
    assert_eq!(in_topic.len(), 2);

    // topic 与 subtopic 必须出自同一个标签
    let dets = bank
        .filter_records(&QuestionFilter {
            topic: Some("Matrices".to_string()),
            subtopic: Some("Determinants".to_string()),
            ..QuestionFilter::default()
        })
        .await;
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].id.ordinal, 1);

    let hits = bank
        .semantic_search(
            embedder.as_ref(),
            "What is the determinant of a 3x3 matrix?",
            2,
            &QuestionFilter::default(),
        )
        .await
        .expect("检索应当成功");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].record.id.ordinal, 1);
    assert!(hits[0].score > 0.99);
    assert!(hits[0].score >= hits[1].score);

    let view = bank.by_topic(&taxonomy).await;
    assert_eq!(view.course_name, "Linear Algebra");
    assert_eq!(view.topics.len(), 1);
    assert_eq!(view.topics[0].subtopics.len(), 2);
    // 未标注的记录不进入主题视图
    let in_view: usize = view.topics[0].subtopics.iter().map(|s| s.records.len()).sum();
    assert_eq!(in_view, 2);
}

#[tokio::test]
async fn workspace_round_trip_restores_bank() {
    let root = temp_workspace("restore");
    let store = WorkspaceStore::new(&root);

    let oracle = exam_oracle();
    let flow = build_flow(Arc::clone(&oracle), axis_embedder("stub-embed-v1", false));
    let (taxonomy, labels, document, _stats) = ingest_sample(&flow, oracle).await;

    store.save_document(&document).expect("文档落盘失败");
    store
        .save_syllabus(&StoredSyllabus {
            taxonomy: taxonomy.clone(),
            embedding_model: flow.embedding_model().to_string(),
            labels,
        })
        .expect("大纲落盘失败");
    assert!(store.is_ingested("midterm_a"));

    // 模拟进程重启后的恢复
    let restored = store.load_all_documents().expect("恢复失败");
    assert_eq!(restored.len(), 1);

    let stored = store.load_syllabus().expect("大纲加载失败").expect("应有大纲");
    assert_eq!(stored.embedding_model, "stub-embed-v1");
    assert_eq!(stored.taxonomy, taxonomy);
    assert_eq!(stored.labels.len(), 2);

    let bank = QuestionBank::new();
    for d in restored {
        bank.publish_document(d).await;
    }
    assert_eq!(bank.record_count().await, 3);
    let ids: Vec<String> = bank
        .filter_records(&QuestionFilter::default())
        .await
        .iter()
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(ids, vec!["midterm_a#1", "midterm_a#2", "midterm_a#3"]);

    fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn independent_sub_parts_get_snippets_end_to_end() {
    let oracle = exam_oracle();
    let flow = build_flow(Arc::clone(&oracle), axis_embedder("stub-embed-v1", false));
    let text = "4. Answer both parts.\n(a) Define entropy.\n(b) Define information.\n";
    let (document, stats) = flow
        .run(&source("quiz_b", text), &[], &DocumentCtx::new("quiz_b".to_string(), 1))
        .await;

    assert_eq!(stats.total_records, 1);
    let record = &document.records[0];
    assert_eq!(record.sub_questions_independent, Independence::Independent);
    assert_eq!(
        record.sub_question_snippets,
        vec!["(a) Define entropy.".to_string(), "(b) Define informati".to_string()]
    );
    assert_eq!(record.local_scan_dependent, Some(false));
    assert_eq!(record.oracle_verdict, Some(true));
}

#[tokio::test]
async fn failed_classification_stays_visible_but_unsearchable() {
    let oracle = exam_oracle();
    let embedder = axis_embedder("stub-embed-v1", false);
    let flow = build_flow(Arc::clone(&oracle), Arc::clone(&embedder));
    let text = "1. Compute the rank of M.\n\n2. Mystery question nobody can classify.\n";
    let (document, stats) = flow
        .run(&source("quiz_c", text), &[], &DocumentCtx::new("quiz_c".to_string(), 1))
        .await;

    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.complete, 1);
    assert_eq!(stats.extraction_failed, 1);
    assert_eq!(stats.tagged, 0);

    let failed = &document.records[1];
    assert_eq!(failed.status, RecordStatus::ExtractionFailed);
    assert_eq!(failed.question_type, None);
    // 失败记录的片段本地计算，保留行首 20 个字符
    assert_eq!(failed.snippet, "2. Mystery question ");
    assert!(failed.embedding.is_none());

    let bank = QuestionBank::new();
    bank.publish_document(document).await;

    // 降级记录在列表查询里可见
    let all = bank.filter_records(&QuestionFilter::default()).await;
    assert_eq!(all.len(), 2);
    let complete_only = bank
        .filter_records(&QuestionFilter {
            status: Some(RecordStatus::Complete),
            ..QuestionFilter::default()
        })
        .await;
    assert_eq!(complete_only.len(), 1);

    // 但不参与语义检索
    let hits = bank
        .semantic_search(embedder.as_ref(), "rank of a matrix", 5, &QuestionFilter::default())
        .await
        .expect("检索应当成功");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.id.ordinal, 1);
}

#[tokio::test]
async fn reingesting_replaces_document_atomically() {
    let oracle = exam_oracle();
    let flow = build_flow(Arc::clone(&oracle), axis_embedder("stub-embed-v1", false));
    let (_t1, _l1, first, _s1) = ingest_sample(&flow, Arc::clone(&oracle)).await;
    let (_t2, _l2, second, _s2) = ingest_sample(&flow, oracle).await;

    // 重新分段产出完全一致的记录 ID
    let first_ids: Vec<String> = first.records.iter().map(|r| r.id.to_string()).collect();
    let second_ids: Vec<String> = second.records.iter().map(|r| r.id.to_string()).collect();
    assert_eq!(first_ids, second_ids);

    let bank = QuestionBank::new();
    assert!(bank.publish_document(first).await.is_none());
    let replaced = bank.publish_document(second).await;
    assert!(replaced.is_some());
    assert_eq!(bank.document_count().await, 1);
    assert_eq!(bank.record_count().await, 3);
}

#[tokio::test]
async fn embedding_model_change_refreshes_vectors_and_tags() {
    let root = temp_workspace("model_change");
    let store = WorkspaceStore::new(&root);

    // 用 v1 模型入库
    let oracle = exam_oracle();
    let flow_v1 = build_flow(Arc::clone(&oracle), axis_embedder("stub-embed-v1", false));
    let (taxonomy, labels_v1, document, _stats) = ingest_sample(&flow_v1, Arc::clone(&oracle)).await;
    assert_eq!(document.records[0].embedding, Some(vec![1.0, 0.0, 0.0]));
    store.save_document(&document).expect("文档落盘失败");
    store
        .save_syllabus(&StoredSyllabus {
            taxonomy,
            embedding_model: flow_v1.embedding_model().to_string(),
            labels: labels_v1,
        })
        .expect("大纲落盘失败");

    // 换成 v2 模型：落盘向量全部失效，需要重算
    let flow_v2 = build_flow(Arc::clone(&oracle), axis_embedder("stub-embed-v2", true));
    let stored = store.load_syllabus().expect("大纲加载失败").expect("应有大纲");
    assert_ne!(stored.embedding_model, flow_v2.embedding_model());

    let labels_v2 = flow_v2
        .embed_labels(&stored.taxonomy)
        .await
        .expect("标签向量应当成功");
    let mut restored = store.load_document("midterm_a").expect("文档加载失败");
    let unavailable = flow_v2
        .refresh_embeddings(&mut restored, &labels_v2, &DocumentCtx::new("midterm_a".to_string(), 1))
        .await;
    assert_eq!(unavailable, 0);

    // 向量换轴，标注语义不变
    let det = &restored.records[0];
    assert_eq!(det.embedding, Some(vec![0.0, 1.0, 0.0]));
    assert_eq!(det.topics[0].subtopic, "Determinants");
    assert!(restored.records[2].topics.is_empty());

    store.save_document(&restored).expect("文档落盘失败");
    let reloaded = store.load_document("midterm_a").expect("文档加载失败");
    assert_eq!(reloaded.records[0].embedding, Some(vec![0.0, 1.0, 0.0]));

    fs::remove_dir_all(&root).ok();
}

// ========== 真实 API 冒烟测试 ==========

/// 全链路冒烟测试
///
/// 需要真实的 LLM / Embedding API 与输入目录，手动运行：
/// ```bash
/// cargo test live_pipeline_smoke -- --ignored --nocapture
/// ```
#[tokio::test]
#[ignore]
async fn live_pipeline_smoke() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = Config::from_env();
    let app = App::initialize(config).expect("应用初始化失败");
    app.run().await.expect("应用运行失败");

    println!("题库文档数: {}", app.bank().document_count().await);
}
