use perspective_harness::{CallTrace, ErrorKind, JsonlTraceSink, TraceSink};
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    index: usize,
    stage: String,
    score: Option<f64>,
    error_kind: Option<String>,
}

fn make_trace(run_id: Uuid, index: usize, score: Option<f64>) -> CallTrace {
    CallTrace {
        timestamp_ms: 0,
        run_id,
        index,
        stage: "score",
        prompt_template_slug: "wrongdoing_third_person".to_string(),
        template_hash: "template_hash".to_string(),
        text_hash: "text_hash".to_string(),
        model: "gpt-4o-mini".to_string(),
        response: score.map(|s| s.to_string()),
        score,
        fallback: false,
        error_kind: score.is_none().then_some(ErrorKind::Timeout),
        error: score.is_none().then(|| "request timed out".to_string()),
        latency_ms: 12,
        input_tokens: 40,
        output_tokens: 2,
    }
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let run_id = Uuid::new_v4();

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(run_id, 1, Some(0.25))).unwrap();
    sink.record(make_trace(run_id, 2, None)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].index, 1);
    assert_eq!(rows[0].stage, "score");
    assert_eq!(rows[0].score, Some(0.25));
    assert_eq!(rows[0].error_kind, None);

    assert_eq!(rows[1].index, 2);
    assert_eq!(rows[1].score, None);
    assert_eq!(rows[1].error_kind.as_deref(), Some("timeout"));
}

#[test]
fn cloned_sinks_share_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");
    let run_id = Uuid::new_v4();

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let other = sink.clone();
    sink.record(make_trace(run_id, 0, Some(0.5))).unwrap();
    other.record(make_trace(run_id, 1, Some(0.75))).unwrap();

    // The worker only finishes once every clone is gone.
    drop(sink);
    drop(other);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 2);
    assert!(raw.lines().all(|l| l.contains(&run_id.to_string())));
}
