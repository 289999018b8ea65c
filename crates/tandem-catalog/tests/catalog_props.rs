use chrono::Utc;
use proptest::prelude::*;
use tandem_catalog::{
    replay, CatalogStore, Mutation, MutationKind, PipelineSnapshot, Seen,
};
use tandem_core::types::{
    AnalysisResult, SourceMeta, Stage, TranscriptBlob, TranscriptStatus, VideoId,
};

#[derive(Debug, Clone, Copy)]
enum Op {
    FetchOk,
    FetchFail { abandon: bool },
    AnalyzeOk,
    AnalyzeFail { abandon: bool },
    Publish,
    PublishFail { abandon: bool },
    Sweep,
    Requeue(Stage),
    Reanalyze,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::FetchOk),
        any::<bool>().prop_map(|abandon| Op::FetchFail { abandon }),
        Just(Op::AnalyzeOk),
        any::<bool>().prop_map(|abandon| Op::AnalyzeFail { abandon }),
        Just(Op::Publish),
        any::<bool>().prop_map(|abandon| Op::PublishFail { abandon }),
        Just(Op::Sweep),
        prop_oneof![
            Just(Stage::Transcript),
            Just(Stage::Analysis),
            Just(Stage::Publish)
        ]
        .prop_map(Op::Requeue),
        Just(Op::Reanalyze),
    ]
}

fn vid(index: usize) -> VideoId {
    VideoId::parse(&format!("video-{}", index)).unwrap()
}

fn seeded_store(count: usize) -> CatalogStore {
    let mut store = CatalogStore::new(PipelineSnapshot::new());
    for i in 0..count {
        store
            .upsert(
                vid(i),
                SourceMeta {
                    channel_id: "chan".to_string(),
                    channel_name: "Chan".to_string(),
                    title: format!("Video {}", i),
                    published_at: None,
                    url: None,
                },
                Utc::now(),
            )
            .unwrap();
    }
    store
}

/// Drive one operation through the store with an up-to-date observation.
/// Rejections are fine; the property is about what gets accepted.
fn drive(store: &mut CatalogStore, id: &VideoId, op: Op) {
    let now = Utc::now();
    let record = store.get(id).unwrap().clone();
    let kind = match op {
        Op::FetchOk => MutationKind::TranscriptFetched {
            seen: Seen::of(&record),
            transcript: TranscriptBlob::new("words", now),
        },
        Op::FetchFail { abandon } => MutationKind::TranscriptFailed {
            seen: Seen::of(&record),
            error: "unavailable".to_string(),
            abandon,
        },
        Op::AnalyzeOk => MutationKind::Analyzed {
            seen: Seen::of(&record),
            result: AnalysisResult::new(id.clone(), serde_json::json!({"ok": true}), None, now),
            raw: Some("{\"ok\":true}".to_string()),
        },
        Op::AnalyzeFail { abandon } => MutationKind::AnalysisFailed {
            seen: Seen::of(&record),
            error: "timeout".to_string(),
            abandon,
        },
        Op::Publish => {
            let Some(latest) = store.latest_result(id) else {
                return;
            };
            MutationKind::Published {
                seen: Seen::of(&record),
                result_id: latest.id,
                location: format!("mem://{}.json", id),
            }
        }
        Op::PublishFail { abandon } => MutationKind::PublishFailed {
            seen: Seen::of(&record),
            error: "503".to_string(),
            abandon,
        },
        Op::Sweep => {
            let _ = store.sweep(id, now);
            return;
        }
        Op::Requeue(stage) => {
            let _ = store.requeue(id, stage, now);
            return;
        }
        Op::Reanalyze => {
            let _ = store.reanalyze(id, now);
            return;
        }
    };
    let _ = store.record(Mutation::new(id.clone(), now, kind));
}

proptest! {
    #[test]
    fn prop_accepted_mutations_keep_snapshot_valid(
        ops in prop::collection::vec((0usize..3, op_strategy()), 0..60)
    ) {
        let mut store = seeded_store(3);
        for (index, op) in ops {
            drive(&mut store, &vid(index), op);
            prop_assert!(store.snapshot().validate().is_ok());
        }
    }

    #[test]
    fn prop_no_result_without_transcript(
        ops in prop::collection::vec((0usize..3, op_strategy()), 0..60)
    ) {
        let mut store = seeded_store(3);
        for (index, op) in ops {
            drive(&mut store, &vid(index), op);
        }
        for (id, results) in &store.snapshot().analyses {
            let record = store.get(id).unwrap();
            prop_assert!(
                results.is_empty() || record.transcript_status == TranscriptStatus::Fetched
            );
        }
    }

    #[test]
    fn prop_replay_onto_own_base_reproduces_state(
        ops in prop::collection::vec((0usize..3, op_strategy()), 0..40)
    ) {
        let base = seeded_store(3).into_parts().0;
        let mut store = CatalogStore::new(base.clone());
        for (index, op) in ops {
            drive(&mut store, &vid(index), op);
        }
        let (local, pending) = store.into_parts();
        let (merged, report) = replay(&base, &pending.mutations).unwrap();
        prop_assert!(report.dropped.is_empty());
        prop_assert_eq!(report.applied, pending.len());
        prop_assert_eq!(merged, local);
    }
}
