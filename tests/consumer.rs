//! End-to-end consumer-loop tests against the replay provider.
//!
//! These exercise the full compile -> activate -> drain -> walk -> stop path
//! the way a host would drive it, including the ordering, resumability, and
//! drop-accounting guarantees.

use anyhow::anyhow;
use spigot::decode::encode_record;
use spigot::{
    AggEntry, AggValue, CompileError, Error, FieldKind, FieldValue, ReplayProvider, Session,
    SessionState,
};

fn ip_provider() -> ReplayProvider {
    let mut provider = ReplayProvider::new(2);
    provider
        .add_probe(
            "ip:::send",
            &[
                ("execname", FieldKind::String),
                ("pid", FieldKind::Integer),
                ("plength", FieldKind::Integer),
            ],
        )
        .unwrap();
    provider
        .add_probe("ip:::receive", &[("plength", FieldKind::Integer)])
        .unwrap();
    provider
}

const SCRIPT: &str = "ip:::send /pid == 100/ { printf(\"%s %d\", execname, pid); }\n\
                      ip:::receive { printf(\"%d\", plength); @bytes[plength] = count(); }";

fn running_session() -> Session<ReplayProvider> {
    let mut session = Session::new(ip_provider());
    session.compile(SCRIPT).unwrap();
    session.activate().unwrap();
    session
}

fn send_values(pid: i64) -> Vec<FieldValue> {
    vec![
        FieldValue::String("bash".to_string()),
        FieldValue::Integer(pid),
    ]
}

#[test]
fn compile_failure_is_atomic_and_retryable() {
    let mut session = Session::new(ip_provider());
    // second clause references a field ip:::receive doesn't expose
    let err = session
        .compile(
            "ip:::send { printf(\"%d\", pid); }\n\
             ip:::receive { printf(\"%d\", pid); }",
        )
        .unwrap_err();
    match err {
        Error::Compile(CompileError::UnresolvedField { clause, field, .. }) => {
            assert_eq!(clause, 1);
            assert_eq!(field, "pid");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(session.state(), SessionState::Created);
    assert!(session.program().is_none());

    session.compile(SCRIPT).unwrap();
    assert_eq!(session.state(), SessionState::Compiled);
}

#[test]
fn drain_orders_sources_by_index_not_arrival() {
    let mut session = running_session();

    // interleave the pushes; the drain order must still be src0 then src1
    let provider = session.provider_mut();
    provider
        .push_event(1, "ip:::receive", 50, &[FieldValue::Integer(10)])
        .unwrap();
    provider.push_event(0, "ip:::send", 10, &send_values(1)).unwrap();
    provider.push_event(0, "ip:::send", 20, &send_values(2)).unwrap();
    provider
        .push_event(1, "ip:::receive", 5, &[FieldValue::Integer(20)])
        .unwrap();
    provider.push_event(0, "ip:::send", 30, &send_values(3)).unwrap();

    let mut seen = Vec::new();
    let stats = session
        .drain(|record| {
            seen.push((record.source, record.ts));
            Ok(())
        })
        .unwrap();

    assert_eq!(stats.records, 5);
    assert_eq!(seen, vec![(0, 10), (0, 20), (0, 30), (1, 50), (1, 5)]);
}

#[test]
fn no_record_lost_or_duplicated_across_arbitrary_splits() {
    let mut session = running_session();
    for ts in 0..20 {
        session
            .provider_mut()
            .push_event(0, "ip:::send", ts, &send_values(ts as i64))
            .unwrap();
    }
    // 7 bytes per read slices frames at every offset eventually
    session.provider_mut().set_read_limit(0, 7);

    let mut seen = Vec::new();
    while !session.provider().exhausted() {
        session
            .drain(|record| {
                seen.push(record.ts);
                Ok(())
            })
            .unwrap();
    }
    // one final pass for the last partial prefix
    session.drain(|record| {
        seen.push(record.ts);
        Ok(())
    })
    .unwrap();

    assert_eq!(seen, (0..20).collect::<Vec<u64>>());
}

#[test]
fn split_frame_decodes_like_unsplit() {
    // same event bytes, once whole and once metered out mid-frame
    let mut whole = running_session();
    whole
        .provider_mut()
        .push_event(0, "ip:::send", 7, &send_values(100))
        .unwrap();
    let mut expected = Vec::new();
    whole
        .drain(|record| {
            expected.push(record.clone());
            Ok(())
        })
        .unwrap();
    assert_eq!(expected.len(), 1);

    let mut split = running_session();
    split
        .provider_mut()
        .push_event(0, "ip:::send", 7, &send_values(100))
        .unwrap();
    split.provider_mut().set_read_limit(0, 11);
    let mut seen = Vec::new();
    for _ in 0..8 {
        split
            .drain(|record| {
                seen.push(record.clone());
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].values, expected[0].values);
    assert_eq!(seen[0].ts, expected[0].ts);
}

#[test]
fn dropped_counts_are_cumulative_and_monotonic() {
    let mut session = running_session();

    session.provider_mut().push_drop(0, 3).unwrap();
    let stats = session.drain(|_| Ok(())).unwrap();
    assert_eq!(stats.per_source_dropped[&0], 3);
    assert_eq!(stats.per_source_dropped[&1], 0);

    // a quiet cycle keeps the total
    let stats = session.drain(|_| Ok(())).unwrap();
    assert_eq!(stats.per_source_dropped[&0], 3);

    session.provider_mut().push_drop(0, 2).unwrap();
    session.provider_mut().push_drop(1, 1).unwrap();
    let stats = session.drain(|_| Ok(())).unwrap();
    assert_eq!(stats.per_source_dropped[&0], 5);
    assert_eq!(stats.per_source_dropped[&1], 1);
}

#[test]
fn stop_twice_is_a_noop() {
    let mut session = running_session();
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn walk_delivers_every_snapshot_entry() {
    let mut session = running_session();
    session.provider_mut().set_aggregation(
        "bytes",
        vec![
            AggEntry {
                keys: vec![FieldValue::String("A".to_string())],
                value: AggValue::Scalar(10),
            },
            AggEntry {
                keys: vec![FieldValue::String("B".to_string())],
                value: AggValue::Scalar(3),
            },
        ],
    );

    let mut walked = Vec::new();
    session
        .walk("bytes", |keys, value| {
            let key = match &keys[0] {
                FieldValue::String(s) => s.clone(),
                other => panic!("unexpected key {other:?}"),
            };
            let value = match value {
                AggValue::Scalar(v) => *v,
                other => panic!("unexpected value {other:?}"),
            };
            walked.push((key, value));
            Ok(())
        })
        .unwrap();

    walked.sort();
    assert_eq!(walked, vec![("A".to_string(), 10), ("B".to_string(), 3)]);
}

#[test]
fn clear_resets_aggregations() {
    let mut session = running_session();
    session.provider_mut().set_aggregation(
        "bytes",
        vec![AggEntry {
            keys: vec![FieldValue::String("A".to_string())],
            value: AggValue::Scalar(10),
        }],
    );
    session.clear_aggregations().unwrap();
    let mut walked = 0;
    session
        .walk("bytes", |_, _| {
            walked += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(walked, 0);
}

#[test]
fn decode_failure_quarantines_one_source_only() {
    let mut session = running_session();

    // a complete frame whose cookie no clause owns corrupts source 1
    session
        .provider_mut()
        .push_raw(1, &encode_record(0xdead, 1, 1, &[]))
        .unwrap();
    session
        .provider_mut()
        .push_event(0, "ip:::send", 10, &send_values(1))
        .unwrap();

    let mut seen = 0;
    let stats = session
        .drain(|_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, 1);
    assert!(stats.quarantined.contains_key(&1));
    assert!(!stats.quarantined.contains_key(&0));

    // source 0 keeps flowing on later passes, source 1 stays quarantined
    session
        .provider_mut()
        .push_event(0, "ip:::send", 20, &send_values(2))
        .unwrap();
    let stats = session.drain(|_| {
        seen += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, 2);
    assert!(stats.quarantined.contains_key(&1));
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn handler_error_propagates_and_next_drain_resumes() {
    let mut session = running_session();
    session
        .provider_mut()
        .push_event(0, "ip:::send", 1, &send_values(1))
        .unwrap();
    session
        .provider_mut()
        .push_event(0, "ip:::send", 2, &send_values(2))
        .unwrap();

    let mut delivered = Vec::new();
    let err = session
        .drain(|record| {
            delivered.push(record.ts);
            Err(anyhow!("handler exploded"))
        })
        .unwrap_err();
    match err {
        Error::Handler { source_id, .. } => assert_eq!(source_id, 0),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(delivered, vec![1]);
    assert_eq!(session.state(), SessionState::Running);

    // the failing record was consumed; exactly the second one remains
    session
        .drain(|record| {
            delivered.push(record.ts);
            Ok(())
        })
        .unwrap();
    assert_eq!(delivered, vec![1, 2]);
}

#[test]
fn drain_before_activate_is_a_state_error() {
    let mut session = Session::new(ip_provider());
    session.compile(SCRIPT).unwrap();
    let err = session.drain(|_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::State(_)));
    assert_eq!(session.state(), SessionState::Compiled);
}

#[test]
fn activation_refusal_fails_the_session() {
    let mut session = Session::new(ip_provider());
    session.compile(SCRIPT).unwrap();
    session.provider_mut().refuse_enable(true);
    let err = session.activate().unwrap_err();
    assert!(matches!(err, Error::Activation(_)));
    assert_eq!(session.state(), SessionState::Failed);
    // teardown after failure never raises
    session.stop();
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn provider_read_failure_is_session_fatal() {
    let mut session = running_session();
    session.provider_mut().fail_reads(true);
    let err = session.drain(|_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::Provider { op: "read_buffer", .. }));
    assert_eq!(session.state(), SessionState::Failed);
    session.stop();
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn predicate_clause_and_aggregation_clause_coexist() {
    let session = running_session();
    let program = session.program().unwrap();
    assert_eq!(program.clauses().len(), 2);
    assert_eq!(program.clauses()[0].predicate.as_deref(), Some("pid == 100"));
    assert_eq!(program.clauses()[1].aggregations.len(), 1);
    assert_eq!(program.clauses()[1].aggregations[0].name, "bytes");
}
