//! Maps session state to what the user sees.
//!
//! The shell has no state machine of its own: given a [`SessionSnapshot`] and
//! an externally owned [`Visibility`] signal it decides which control to show.

use crate::manager::{ConnectionStatus, SessionSnapshot};

pub const CALL_TO_ACTION_LABEL: &str = "Let's Build!";

/// Whether the host surface currently wants the call control on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    /// Fraction of the viewport height the hero image's bottom edge must rise
    /// above before the control appears.
    pub const SCROLL_THRESHOLD: f64 = 0.2;

    /// Visible when a chat section is on screen, or once most of the hero
    /// image has scrolled past.
    pub fn from_scroll(chat_section_present: bool, hero_bottom: f64, viewport_height: f64) -> Self {
        if chat_section_present || hero_bottom < viewport_height * Self::SCROLL_THRESHOLD {
            Visibility::Visible
        } else {
            Visibility::Hidden
        }
    }

    pub fn is_visible(self) -> bool {
        self == Visibility::Visible
    }
}

impl From<bool> for Visibility {
    fn from(visible: bool) -> Self {
        if visible { Visibility::Visible } else { Visibility::Hidden }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affordance {
    /// Offer to start a call.
    CallToAction { label: String },
    /// An attempt is running or a retry is pending.
    Busy { label: String, retry_count: u32 },
    Hidden,
}

pub fn affordance(snapshot: &SessionSnapshot, visibility: Visibility) -> Affordance {
    if snapshot.status == ConnectionStatus::Connected {
        return Affordance::Hidden;
    }
    if snapshot.is_connecting || snapshot.status == ConnectionStatus::Connecting {
        let label = match snapshot.retry_count {
            0 => "Connecting…".to_string(),
            n => format!("Retrying ({})…", n),
        };
        return Affordance::Busy {
            label,
            retry_count: snapshot.retry_count,
        };
    }
    if visibility.is_visible() {
        Affordance::CallToAction {
            label: CALL_TO_ACTION_LABEL.to_string(),
        }
    } else {
        Affordance::Hidden
    }
}
