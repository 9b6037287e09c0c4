use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tidewire::executor::{CursorStep, MockEngine, ProtocolResult, QueryExecutor};
use tidewire::ir::QueryContext;
use tidewire::query::{CompareOp, Conflict, Direction, Expr, ExprError, QueryBuilder, RowCapture};
use tidewire::TidewireError;

struct CountingExecutor {
    runs: AtomicUsize,
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    async fn run_query(&self, _ctx: &QueryContext) -> ProtocolResult<Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(json!([]))
    }

    async fn read_cursor(&self, _request_id: u64, _ctx: &QueryContext) -> ProtocolResult<CursorStep> {
        Ok(CursorStep::finished())
    }

    async fn close_cursor(&self, _request_id: u64) -> ProtocolResult<()> {
        Ok(())
    }
}

async fn seeded_engine() -> Arc<MockEngine> {
    let engine = Arc::new(MockEngine::new());
    QueryBuilder::table_create("app", "articles", "id")
        .run(engine.as_ref())
        .await
        .unwrap();
    QueryBuilder::table("app", "articles")
        .insert(
            vec![
                json!({"id": "a1", "title": "first", "views": 3}),
                json!({"id": "a2", "title": "second", "views": 9}),
                json!({"id": "a3", "title": "third", "views": 6}),
            ],
            Conflict::Error,
        )
        .run(engine.as_ref())
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn test_building_a_chain_touches_no_executor() {
    let executor = CountingExecutor {
        runs: AtomicUsize::new(0),
    };

    let chain = QueryBuilder::table("app", "articles")
        .filter(|row| row.str_field("status").eq("published"))
        .order_by("title", Direction::Asc)
        .limit(5);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 0);

    chain.run(&executor).await.unwrap();
    assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_contexts_round_trip_through_json() {
    let joined = QueryBuilder::table("app", "authors");
    let ctx = QueryBuilder::table("app", "articles")
        .get_all_by("author", vec![json!("u1"), json!("u2")])
        .filter(|row| {
            row.clone()
                .num_field("views")
                .ge(10)
                .and(row.str_field("title").starts_with("How"))
        })
        .eq_join("author", joined)
        .order_by("title", Direction::Desc)
        .skip(2)
        .limit(4)
        .pluck(&["title", "views"])
        .into_context();

    let text = serde_json::to_string(&ctx).unwrap();
    let back: QueryContext = serde_json::from_str(&text).unwrap();
    assert_eq!(ctx, back);

    // Wire shape is a bare array of {id, args, opts?} steps.
    let wire: Value = serde_json::from_str(&text).unwrap();
    let steps = wire.as_array().unwrap();
    assert_eq!(steps[0]["id"], json!("db"));
    assert_eq!(steps[1]["id"], json!("table"));
    assert!(steps
        .iter()
        .any(|step| step["args"][0]["type"] == json!("func")));
    assert!(steps
        .iter()
        .any(|step| step["args"][1]["type"] == json!("query")));
}

#[test]
fn test_illegal_operations_fail_while_building() {
    // Ordering a boolean is refused at capture time.
    let err = Expr::lit(true).compare(CompareOp::Gt, json!(1)).unwrap_err();
    assert!(matches!(err, ExprError::UnsupportedOperator { .. }));

    // A match operator needs a string pattern.
    let capture = RowCapture::begin();
    let err = capture
        .row()
        .index("name")
        .compare(CompareOp::Match, json!(7))
        .unwrap_err();
    assert!(matches!(err, ExprError::TypeMismatch { .. }));

    // Casting a literal to the wrong category is refused too.
    assert!(Expr::lit(5).try_str().is_err());
}

#[tokio::test]
async fn test_cursors_read_sequentially_and_close_idempotently() {
    let engine = seeded_engine().await;
    let executor: Arc<dyn QueryExecutor> = engine.clone();

    let cursor = QueryBuilder::table("app", "articles").cursor(executor);
    let mut ids = Vec::new();
    while let Some(row) = cursor.next().await.unwrap() {
        ids.push(row["id"].as_str().unwrap().to_string());
    }
    assert_eq!(ids, vec!["a1", "a2", "a3"]);

    // Draining twice and closing twice are both no-ops.
    assert_eq!(cursor.next().await.unwrap(), None);
    cursor.close().await.unwrap();
    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_finite_cursors_adapt_to_streams() {
    let engine = seeded_engine().await;
    let executor: Arc<dyn QueryExecutor> = engine.clone();

    let stream = QueryBuilder::table("app", "articles")
        .order_by("views", Direction::Desc)
        .cursor(executor)
        .into_stream();
    futures::pin_mut!(stream);

    let mut views = Vec::new();
    while let Some(row) = stream.next().await {
        views.push(row.unwrap()["views"].as_u64().unwrap());
    }
    assert_eq!(views, vec![9, 6, 3]);
}

#[tokio::test]
async fn test_change_feeds_yield_writes_until_closed() {
    let engine = seeded_engine().await;
    let executor: Arc<dyn QueryExecutor> = engine.clone();

    let feed = QueryBuilder::table("app", "articles")
        .changes()
        .cursor(executor);
    assert!(feed.is_change_feed());

    // The first read subscribes and parks until a write lands.
    let reader = tokio::spawn(async move {
        let event = feed.next().await.unwrap().unwrap();
        feed.close().await.unwrap();
        let after_close = feed.next().await.unwrap();
        (event, after_close)
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    QueryBuilder::table("app", "articles")
        .insert(vec![json!({"id": "a4", "title": "breaking"})], Conflict::Error)
        .run(engine.as_ref())
        .await
        .unwrap();

    let (event, after_close) = reader.await.unwrap();
    assert_eq!(event["old_val"], Value::Null);
    assert_eq!(event["new_val"]["title"], json!("breaking"));
    assert_eq!(after_close, None);
}

#[tokio::test]
async fn test_overlapping_feed_reads_are_refused() {
    let engine = seeded_engine().await;
    let executor: Arc<dyn QueryExecutor> = engine.clone();

    let feed = Arc::new(
        QueryBuilder::table("app", "articles")
            .changes()
            .cursor(executor),
    );

    // First read parks on the empty feed; the overlapping second read must
    // fail before touching the wire.
    let parked = tokio::spawn({
        let feed = feed.clone();
        async move { feed.next().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = feed.next().await.unwrap_err();
    assert!(matches!(err, TidewireError::Unsafe(_)));

    feed.close().await.unwrap();
    assert_eq!(parked.await.unwrap().unwrap(), None);
}
