//! End-to-end pipeline tests: signed envelopes run through the validator
//! and are applied by the session actors, with durable state on disk.

use std::sync::Arc;

use tempfile::TempDir;

use fg_domain::config::{SecurityConfig, SessionsConfig};
use fg_protocol::{
    AssessmentAction, AssessmentPayload, ContentRef, Envelope, EnvelopeKind, NavigationPayload,
    PageContextPayload,
};
use fg_security::{AuditLog, KeyManager, SecurityValidator, ValidationFailure};
use fg_sessions::{ContextStore, SessionRegistry};

const ORIGIN: &str = "http://localhost:3000";

struct Pipeline {
    keys: Arc<KeyManager>,
    validator: SecurityValidator,
    sessions: SessionRegistry,
    store: Arc<ContextStore>,
    _dir: TempDir,
}

fn pipeline() -> Pipeline {
    pipeline_with(SecurityConfig::default())
}

fn pipeline_with(security: SecurityConfig) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let keys = Arc::new(KeyManager::new(3600, 7200));
    let audit = Arc::new(AuditLog::default());
    let validator = SecurityValidator::new(security, keys.clone(), audit);
    let store = Arc::new(ContextStore::new(dir.path()).unwrap());
    let sessions = SessionRegistry::new(SessionsConfig::default(), store.clone());
    Pipeline {
        keys,
        validator,
        sessions,
        store,
        _dir: dir,
    }
}

fn signed_envelope(
    keys: &KeyManager,
    kind: EnvelopeKind,
    payload: serde_json::Value,
    session_id: &str,
) -> Envelope {
    let mut envelope = Envelope::new(kind, payload, session_id, ORIGIN);
    envelope.signature = keys.sign(&envelope.signing_base());
    envelope
}

#[tokio::test]
async fn accepted_context_update_reaches_the_actor() {
    let p = pipeline();

    let envelope = signed_envelope(
        &p.keys,
        EnvelopeKind::PageContextUpdate,
        serde_json::json!(PageContextPayload {
            student_id: "student-7".into(),
            current_content: Some(ContentRef {
                content_id: "page-1".into(),
                page_type: "wiki_page".into(),
                url: "https://lms.example/pages/1".into(),
            }),
        }),
        "sess-ctx",
    );

    let verdict = p.validator.validate(&envelope);
    assert!(verdict.valid, "unexpected failures: {:?}", verdict.failures);

    let payload: PageContextPayload = envelope.typed_payload().unwrap();
    let handle = p.sessions.handle("sess-ctx");
    let state = handle
        .update_context(Some(payload.student_id), payload.current_content)
        .await
        .unwrap();

    assert_eq!(state.student_id.as_deref(), Some("student-7"));
    assert_eq!(
        state.current_content.as_ref().map(|c| c.content_id.as_str()),
        Some("page-1")
    );

    // Durable: the update is on disk before the reply comes back.
    let persisted = p.store.get("sess-ctx").unwrap();
    assert_eq!(persisted.student_id.as_deref(), Some("student-7"));
}

#[tokio::test]
async fn replayed_envelope_is_rejected_exactly_once() {
    let p = pipeline();

    let envelope = signed_envelope(
        &p.keys,
        EnvelopeKind::BehavioralSignal,
        serde_json::json!({"signal": "scroll_depth", "value": 0.8}),
        "sess-replay",
    );

    assert!(p.validator.validate(&envelope).valid);

    let second = p.validator.validate(&envelope);
    assert!(!second.valid);
    assert!(second.failures.contains(&ValidationFailure::ReplayedNonce));
}

#[tokio::test]
async fn navigation_signals_build_history_through_the_pipeline() {
    let p = pipeline();
    let handle = p.sessions.handle("sess-nav");

    for (content_id, prev) in [("page-a", None), ("page-b", Some("page-a"))] {
        let envelope = signed_envelope(
            &p.keys,
            EnvelopeKind::BehavioralSignal,
            serde_json::json!(NavigationPayload {
                content_id: content_id.into(),
                page_type: "assignment".into(),
                url: format!("https://lms.example/{content_id}"),
                previous_content_id: prev.map(String::from),
            }),
            "sess-nav",
        );
        let verdict = p.validator.validate(&envelope);
        assert!(verdict.valid, "unexpected failures: {:?}", verdict.failures);

        let nav: NavigationPayload = envelope.typed_payload().unwrap();
        handle.record_navigation(nav).await.unwrap();
    }

    let state = handle.snapshot().await.unwrap();
    assert_eq!(state.navigation_history.len(), 2);
    assert_eq!(state.navigation_history[0].content_id, "page-a");
    assert_eq!(state.navigation_history[1].content_id, "page-b");
}

#[tokio::test]
async fn per_session_rate_limit_rejects_the_overflow() {
    let security = SecurityConfig {
        rate_limit_per_minute: 3,
        ..SecurityConfig::default()
    };
    let p = pipeline_with(security);

    for _ in 0..3 {
        let envelope = signed_envelope(
            &p.keys,
            EnvelopeKind::BehavioralSignal,
            serde_json::json!({"signal": "idle"}),
            "sess-burst",
        );
        assert!(p.validator.validate(&envelope).valid);
    }

    let overflow = signed_envelope(
        &p.keys,
        EnvelopeKind::BehavioralSignal,
        serde_json::json!({"signal": "idle"}),
        "sess-burst",
    );
    let verdict = p.validator.validate(&overflow);
    assert!(!verdict.valid);
    assert!(verdict
        .failures
        .contains(&ValidationFailure::RateLimited { limit_per_minute: 3 }));
    // Rate-limit rejections are safe to retry after backing off.
    assert!(verdict.is_retryable());

    // Other sessions are unaffected.
    let other = signed_envelope(
        &p.keys,
        EnvelopeKind::BehavioralSignal,
        serde_json::json!({"signal": "idle"}),
        "sess-calm",
    );
    assert!(p.validator.validate(&other).valid);
}

#[tokio::test]
async fn untrusted_origin_is_rejected_before_any_state_change() {
    let p = pipeline();

    let mut envelope = Envelope::new(
        EnvelopeKind::PageContextUpdate,
        serde_json::json!({"studentId": "x"}),
        "sess-evil",
        "https://evil.example.com",
    );
    envelope.signature = p.keys.sign(&envelope.signing_base());

    let verdict = p.validator.validate(&envelope);
    assert!(!verdict.valid);
    assert!(verdict
        .failures
        .iter()
        .any(|f| matches!(f, ValidationFailure::UntrustedOrigin(_))));
    assert_eq!(p.sessions.live_sessions(), 0);
}

#[tokio::test]
async fn rotated_key_keeps_verifying_grace_period_envelopes() {
    let p = pipeline();

    let envelope = signed_envelope(
        &p.keys,
        EnvelopeKind::BehavioralSignal,
        serde_json::json!({"signal": "focus"}),
        "sess-rotate",
    );

    // Rotate between sign and validate; the old key is still in grace.
    p.keys.rotate();

    let verdict = p.validator.validate(&envelope);
    assert!(verdict.valid, "unexpected failures: {:?}", verdict.failures);
}

#[tokio::test]
async fn assessment_lifecycle_flows_end_to_end() {
    let p = pipeline();
    let handle = p.sessions.handle("sess-quiz");

    let start = signed_envelope(
        &p.keys,
        EnvelopeKind::BehavioralSignal,
        serde_json::json!(AssessmentPayload {
            assessment_id: "quiz-42".into(),
            action: AssessmentAction::Start,
        }),
        "sess-quiz",
    );
    assert!(p.validator.validate(&start).valid);
    let payload: AssessmentPayload = start.typed_payload().unwrap();
    let state = handle.set_assessment_state(payload).await.unwrap();
    assert!(state.active_assessment_ids.contains("quiz-42"));

    let end = AssessmentPayload {
        assessment_id: "quiz-42".into(),
        action: AssessmentAction::End,
    };
    let state = handle.set_assessment_state(end).await.unwrap();
    assert!(state.active_assessment_ids.is_empty());
}

#[tokio::test]
async fn ending_a_session_clears_its_durable_state() {
    let p = pipeline();
    let handle = p.sessions.handle("sess-done");

    handle
        .update_context(Some("student-9".into()), None)
        .await
        .unwrap();
    assert!(p.store.get("sess-done").is_some());

    handle.end("test teardown").await.unwrap();
    assert!(p.store.get("sess-done").is_none());

    p.sessions.prune();
    assert_eq!(p.sessions.live_sessions(), 0);
}
