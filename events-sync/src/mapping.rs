use chrono::{DateTime, Utc};

use crate::sink::{EventPerformerRow, EventRow, STATUS_ACTIVE};
use crate::source::RawEvent;

/// One upstream event normalized into its table rows.
#[derive(Debug, Clone)]
pub struct MappedEvent {
    pub event: EventRow,
    /// Performer links in upstream order. May be empty.
    pub performers: Vec<EventPerformerRow>,
}

/// Map an upstream event to its `tevo_events` row and `tevo_event_performers` links.
///
/// Every row is stamped with `run_started`. Performances without a performer id
/// are skipped; upstream data is known to contain them.
pub fn map_event(raw: &RawEvent, run_started: DateTime<Utc>) -> MappedEvent {
    let event = EventRow {
        event_id: raw.id,
        event_name: raw.name.clone(),
        event_date: raw.occurs_at,
        venue_id: raw.venue.id,
        category_id: raw.category.id,
        configuration_id: raw.configuration.as_ref().and_then(|c| c.id),
        products_count: raw.products_count,
        event_url: raw.url.clone(),
        updated_at: raw.updated_at,
        event_status: STATUS_ACTIVE,
        event_state: raw.state.clone(),
        last_modified: run_started,
    };

    let performers = raw
        .performances
        .iter()
        .filter_map(|p| {
            let performer_id = p.performer.as_ref().and_then(|r| r.id)?;
            Some(EventPerformerRow {
                event_id: raw.id,
                performer_id,
                is_primary: p.primary,
                status: STATUS_ACTIVE,
                last_modified: run_started,
            })
        })
        .collect();

    MappedEvent { event, performers }
}
