//! The per-session context record and its pure mutation rules.
//!
//! All mutation goes through the owning actor; the methods here are plain
//! functions over the state so they can be tested without a runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use fg_protocol::{AssessmentAction, AssessmentPayload, ContentRef, NavigationPayload};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One visited page, newest entries last.  `duration_ms` is filled in when
/// the following navigation identifies this page as the one being left.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEntry {
    pub content_id: String,
    pub page_type: String,
    pub url: String,
    pub entered_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Durable context for one learning session. Owned exclusively by its
/// session actor; nothing else mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContextState {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub current_content: Option<ContentRef>,
    #[serde(default)]
    pub navigation_history: Vec<NavigationEntry>,
    #[serde(default)]
    pub active_assessment_ids: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
}

impl SessionContextState {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            student_id: None,
            current_content: None,
            navigation_history: Vec::new(),
            active_assessment_ids: BTreeSet::new(),
            last_updated: now,
        }
    }

    /// Apply a page-context update.
    pub fn apply_update(
        &mut self,
        student_id: Option<String>,
        current_content: Option<ContentRef>,
        now: DateTime<Utc>,
    ) {
        if student_id.is_some() {
            self.student_id = student_id;
        }
        self.current_content = current_content;
        self.last_updated = now;
    }

    /// Record a navigation event.
    ///
    /// When the payload names the page being left and it matches the newest
    /// history entry, that entry's dwell duration is computed as the
    /// wall-clock delta between the two recordings. The new entry is then
    /// appended, with the oldest evicted once the history exceeds `cap`.
    ///
    /// Returns the dwell duration attributed to the previous page, if any.
    pub fn record_navigation(
        &mut self,
        nav: &NavigationPayload,
        now: DateTime<Utc>,
        cap: usize,
    ) -> Option<u64> {
        let duration_ms = match (&nav.previous_content_id, self.navigation_history.last_mut()) {
            (Some(prev_id), Some(last)) if *prev_id == last.content_id => {
                let ms = (now - last.entered_at).num_milliseconds().max(0) as u64;
                last.duration_ms = Some(ms);
                Some(ms)
            }
            _ => None,
        };

        self.navigation_history.push(NavigationEntry {
            content_id: nav.content_id.clone(),
            page_type: nav.page_type.clone(),
            url: nav.url.clone(),
            entered_at: now,
            duration_ms: None,
        });
        while self.navigation_history.len() > cap {
            self.navigation_history.remove(0);
        }

        self.current_content = Some(ContentRef {
            content_id: nav.content_id.clone(),
            page_type: nav.page_type.clone(),
            url: nav.url.clone(),
        });
        self.last_updated = now;
        duration_ms
    }

    /// Apply an assessment lifecycle signal. Start/end mutate the active
    /// set; pause/resume are acknowledged but leave membership unchanged.
    /// Returns whether membership changed.
    pub fn apply_assessment(&mut self, payload: &AssessmentPayload, now: DateTime<Utc>) -> bool {
        let changed = match payload.action {
            AssessmentAction::Start => self
                .active_assessment_ids
                .insert(payload.assessment_id.clone()),
            AssessmentAction::End => self.active_assessment_ids.remove(&payload.assessment_id),
            AssessmentAction::Pause | AssessmentAction::Resume => false,
        };
        self.last_updated = now;
        changed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn nav(content_id: &str, previous: Option<&str>) -> NavigationPayload {
        NavigationPayload {
            content_id: content_id.into(),
            page_type: "reading".into(),
            url: format!("/content/{content_id}"),
            previous_content_id: previous.map(String::from),
        }
    }

    #[test]
    fn dwell_time_attributed_when_previous_matches() {
        let t0 = Utc::now();
        let mut state = SessionContextState::new("s1", t0);

        state.record_navigation(&nav("a", None), t0, 50);
        let duration = state.record_navigation(&nav("b", Some("a")), t0 + Duration::seconds(8), 50);

        assert_eq!(duration, Some(8000));
        // The duration landed on page A's entry.
        assert_eq!(state.navigation_history[0].duration_ms, Some(8000));
        assert_eq!(state.navigation_history[1].duration_ms, None);
    }

    #[test]
    fn no_dwell_time_when_previous_mismatches() {
        let t0 = Utc::now();
        let mut state = SessionContextState::new("s1", t0);
        state.record_navigation(&nav("a", None), t0, 50);
        let duration =
            state.record_navigation(&nav("c", Some("zzz")), t0 + Duration::seconds(5), 50);
        assert_eq!(duration, None);
        assert_eq!(state.navigation_history[0].duration_ms, None);
    }

    #[test]
    fn history_evicts_oldest_at_cap() {
        let t0 = Utc::now();
        let mut state = SessionContextState::new("s1", t0);
        for i in 0..7 {
            state.record_navigation(&nav(&format!("p{i}"), None), t0 + Duration::seconds(i), 5);
        }
        assert_eq!(state.navigation_history.len(), 5);
        assert_eq!(state.navigation_history[0].content_id, "p2");
        assert_eq!(state.navigation_history[4].content_id, "p6");
    }

    #[test]
    fn navigation_updates_current_content() {
        let t0 = Utc::now();
        let mut state = SessionContextState::new("s1", t0);
        state.record_navigation(&nav("a", None), t0, 50);
        assert_eq!(
            state.current_content.as_ref().map(|c| c.content_id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn assessment_start_end_mutate_membership() {
        let now = Utc::now();
        let mut state = SessionContextState::new("s1", now);

        let start = AssessmentPayload {
            assessment_id: "quiz-1".into(),
            action: AssessmentAction::Start,
        };
        assert!(state.apply_assessment(&start, now));
        assert!(state.active_assessment_ids.contains("quiz-1"));

        let pause = AssessmentPayload {
            assessment_id: "quiz-1".into(),
            action: AssessmentAction::Pause,
        };
        assert!(!state.apply_assessment(&pause, now));
        assert!(state.active_assessment_ids.contains("quiz-1"));

        let end = AssessmentPayload {
            assessment_id: "quiz-1".into(),
            action: AssessmentAction::End,
        };
        assert!(state.apply_assessment(&end, now));
        assert!(state.active_assessment_ids.is_empty());
    }

    #[test]
    fn update_keeps_student_id_when_absent() {
        let now = Utc::now();
        let mut state = SessionContextState::new("s1", now);
        state.apply_update(Some("stu-1".into()), None, now);
        state.apply_update(None, None, now);
        assert_eq!(state.student_id.as_deref(), Some("stu-1"));
    }
}
