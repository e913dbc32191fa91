//! Where the viewport goes after the store changes.
//!
//! | mutation                          | directive          |
//! |-----------------------------------|--------------------|
//! | live append                       | `Bottom`           |
//! | page load with a relevant message | `Center` + highlight |
//! | initial page, nothing relevant    | `Bottom`           |
//! | older page, nothing relevant      | `Stay`             |
//!
//! Highlights clear themselves after a fixed duration; the owner polls
//! [`ScrollAnchor::deadline`] and calls [`ScrollAnchor::expire`].

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::paginator::LoadKind;

/// How long a relevance highlight stays on.
pub const HIGHLIGHT_DURATION: Duration = Duration::from_millis(2000);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnchorDirective {
    /// Scroll to the newest message.
    Bottom,
    /// Center the viewport on a message and highlight it.
    Center { message_id: String },
    /// Leave the viewport where it is.
    Stay,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Highlight {
    pub message_id: String,
    pub until: Instant,
}

#[derive(Clone, Debug)]
pub struct ScrollAnchor {
    highlight_for: Duration,
    highlight: Option<Highlight>,
}

impl Default for ScrollAnchor {
    fn default() -> Self {
        Self::new(HIGHLIGHT_DURATION)
    }
}

impl ScrollAnchor {
    pub fn new(highlight_for: Duration) -> Self {
        Self {
            highlight_for,
            highlight: None,
        }
    }

    pub fn after_live_append(&mut self) -> AnchorDirective {
        AnchorDirective::Bottom
    }

    pub fn after_page_load(
        &mut self,
        kind: LoadKind,
        relevant: Option<String>,
        now: Instant,
    ) -> AnchorDirective {
        match (relevant, kind) {
            (Some(message_id), _) => {
                self.highlight = Some(Highlight {
                    message_id: message_id.clone(),
                    until: now + self.highlight_for,
                });
                AnchorDirective::Center { message_id }
            }
            (None, LoadKind::Initial) => AnchorDirective::Bottom,
            (None, LoadKind::Older) => AnchorDirective::Stay,
        }
    }

    pub fn highlighted(&self) -> Option<&str> {
        self.highlight.as_ref().map(|h| h.message_id.as_str())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.highlight.as_ref().map(|h| h.until)
    }

    /// Clear the highlight if its time is up. Returns the cleared id.
    pub fn expire(&mut self, now: Instant) -> Option<String> {
        match &self.highlight {
            Some(h) if h.until <= now => self.highlight.take().map(|h| h.message_id),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.highlight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_append_always_goes_to_bottom() {
        let mut anchor = ScrollAnchor::default();
        anchor.after_page_load(LoadKind::Older, Some("m1".into()), Instant::now());
        assert_eq!(anchor.after_live_append(), AnchorDirective::Bottom);
        // The highlight keeps running on its own clock.
        assert_eq!(anchor.highlighted(), Some("m1"));
    }

    #[test]
    fn decision_table() {
        let now = Instant::now();
        let mut anchor = ScrollAnchor::default();
        assert_eq!(
            anchor.after_page_load(LoadKind::Initial, None, now),
            AnchorDirective::Bottom
        );
        assert_eq!(
            anchor.after_page_load(LoadKind::Older, None, now),
            AnchorDirective::Stay
        );
        assert_eq!(anchor.highlighted(), None);
        assert_eq!(
            anchor.after_page_load(LoadKind::Older, Some("m7".into()), now),
            AnchorDirective::Center {
                message_id: "m7".into()
            }
        );
        assert_eq!(
            anchor.after_page_load(LoadKind::Initial, Some("m8".into()), now),
            AnchorDirective::Center {
                message_id: "m8".into()
            }
        );
        assert_eq!(anchor.highlighted(), Some("m8"));
    }

    #[test]
    fn highlight_expires_after_duration() {
        let now = Instant::now();
        let mut anchor = ScrollAnchor::new(Duration::from_millis(500));
        anchor.after_page_load(LoadKind::Older, Some("m1".into()), now);
        assert_eq!(anchor.deadline(), Some(now + Duration::from_millis(500)));

        assert_eq!(anchor.expire(now + Duration::from_millis(499)), None);
        assert_eq!(anchor.highlighted(), Some("m1"));
        assert_eq!(
            anchor.expire(now + Duration::from_millis(500)),
            Some("m1".to_string())
        );
        assert_eq!(anchor.highlighted(), None);
        assert_eq!(anchor.deadline(), None);
    }

    #[test]
    fn directive_serializes_tagged() {
        let json = serde_json::to_value(AnchorDirective::Center {
            message_id: "m1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "center");
        assert_eq!(json["message_id"], "m1");
    }
}
