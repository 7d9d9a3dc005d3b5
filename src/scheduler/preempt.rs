//! Which priorities may preempt which.

use crate::types::TaskPriority;

/// Whether a waiting task of priority `incoming` may preempt a running one of `running`.
///
/// | incoming | preempts |
/// |---|---|
/// | critical | normal, low, background |
/// | high | low, background |
/// | normal | background |
/// | low, background | nothing |
pub fn can_preempt(incoming: TaskPriority, running: TaskPriority) -> bool {
    use TaskPriority::*;
    matches!(
        (incoming, running),
        (Critical, Normal | Low | Background) | (High, Low | Background) | (Normal, Background)
    )
}
