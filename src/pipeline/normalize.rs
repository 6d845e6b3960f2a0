//! Update normalization
//!
//! `admit` is the cheap pre-filter applied to every data frame; `normalize`
//! expands an admitted UPDATE into one event per prefix.

use crate::models::{Event, ParseOutcome, RawUpdateMessage, RejectReason};

/// An UPDATE that carries everything normalization needs
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedUpdate {
    pub ts: f64,
    pub peer_id: u32,
    pub source: String,
    pub message: RawUpdateMessage,
}

/// Drop messages lacking a peer, timestamp or source, or carrying no prefixes.
pub fn admit(message: RawUpdateMessage) -> ParseOutcome<AdmittedUpdate> {
    let Some(peer_id) = message.peer_asn else {
        return ParseOutcome::Rejected(RejectReason::MissingPeer);
    };
    let Some(ts) = message.timestamp else {
        return ParseOutcome::Rejected(RejectReason::MissingTimestamp);
    };
    let Some(source) = message.host.clone().filter(|h| !h.is_empty()) else {
        return ParseOutcome::Rejected(RejectReason::MissingSource);
    };
    if message.announcements.is_empty() && message.withdrawals.is_empty() {
        return ParseOutcome::Rejected(RejectReason::NoPrefixes);
    }

    ParseOutcome::Parsed(AdmittedUpdate {
        ts,
        peer_id,
        source,
        message,
    })
}

/// Last hop of the path (first member of a trailing set), else the peer.
pub fn origin_of(update: &AdmittedUpdate) -> u32 {
    update
        .message
        .path
        .last()
        .and_then(|segment| segment.primary())
        .unwrap_or(update.peer_id)
}

/// Flattened path; sets collapse to their first member, empty sets vanish.
pub fn flatten_path(update: &AdmittedUpdate) -> Vec<u32> {
    update
        .message
        .path
        .iter()
        .filter_map(|segment| segment.primary())
        .collect()
}

/// One announce event per announced prefix, then one withdraw event per
/// withdrawn prefix, in message order. `src`/`dst` stay empty.
pub fn normalize(update: &AdmittedUpdate) -> Vec<Event> {
    let origin = origin_of(update);
    let path = flatten_path(update);
    let msg = &update.message;

    let announced = msg
        .announcements
        .iter()
        .flat_map(|group| group.prefixes.iter())
        .filter(|prefix| !prefix.is_empty())
        .map(|prefix| {
            Event::announce(
                update.ts,
                prefix.clone(),
                origin,
                update.peer_id,
                path.clone(),
            )
        });

    let withdrawn = msg
        .withdrawals
        .iter()
        .filter(|prefix| !prefix.is_empty())
        .map(|prefix| Event::withdraw(update.ts, prefix.clone(), update.peer_id));

    announced.chain(withdrawn).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Announcement, EventKind, PathSegment};

    fn update(path: Vec<PathSegment>, announced: &[&str], withdrawn: &[&str]) -> RawUpdateMessage {
        RawUpdateMessage {
            timestamp: Some(1_700_000_000.5),
            peer: Some("192.0.2.1".to_string()),
            peer_asn: Some(3333),
            host: Some("rrc00".to_string()),
            path,
            announcements: vec![Announcement {
                next_hop: Some("192.0.2.1".to_string()),
                prefixes: announced.iter().map(|p| p.to_string()).collect(),
            }],
            withdrawals: withdrawn.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn admitted(msg: RawUpdateMessage) -> AdmittedUpdate {
        admit(msg).parsed().unwrap()
    }

    #[test]
    fn test_admission_rejects() {
        let mut msg = update(vec![], &["10.0.0.0/24"], &[]);
        msg.peer_asn = None;
        assert_eq!(admit(msg), ParseOutcome::Rejected(RejectReason::MissingPeer));

        let mut msg = update(vec![], &["10.0.0.0/24"], &[]);
        msg.timestamp = None;
        assert_eq!(admit(msg), ParseOutcome::Rejected(RejectReason::MissingTimestamp));

        let mut msg = update(vec![], &["10.0.0.0/24"], &[]);
        msg.host = None;
        assert_eq!(admit(msg), ParseOutcome::Rejected(RejectReason::MissingSource));

        let mut msg = update(vec![], &[], &[]);
        msg.announcements.clear();
        assert_eq!(admit(msg), ParseOutcome::Rejected(RejectReason::NoPrefixes));
    }

    #[test]
    fn test_one_event_per_prefix() {
        let msg = update(
            vec![PathSegment::Asn(3333), PathSegment::Asn(1299), PathSegment::Asn(64500)],
            &["10.0.0.0/24", "10.0.1.0/24"],
            &["192.0.2.0/24"],
        );
        let events = normalize(&admitted(msg));

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].prefix, "10.0.0.0/24");
        assert_eq!(events[1].prefix, "10.0.1.0/24");
        assert_eq!(events[0].kind, EventKind::Announce);
        assert_eq!(events[0].origin_id, Some(64500));
        assert_eq!(events[0].peer_id, 3333);
        assert_eq!(events[0].path, vec![3333, 1299, 64500]);
        assert!(events[0].src.is_none());

        assert_eq!(events[2].kind, EventKind::Withdraw);
        assert_eq!(events[2].origin_id, None);
        assert_eq!(events[2].ts, 1_700_000_000.5);
    }

    #[test]
    fn test_origin_unwraps_trailing_set() {
        let msg = update(
            vec![PathSegment::Asn(3333), PathSegment::Set(vec![64512, 64513])],
            &["10.0.0.0/24"],
            &[],
        );
        let events = normalize(&admitted(msg));
        assert_eq!(events[0].origin_id, Some(64512));
        assert_eq!(events[0].path, vec![3333, 64512]);
    }

    #[test]
    fn test_empty_path_uses_peer() {
        let msg = update(vec![], &["10.0.0.0/24"], &[]);
        let events = normalize(&admitted(msg));
        assert_eq!(events[0].origin_id, Some(3333));
        assert_eq!(events[0].path, vec![3333, 3333]);
    }

    #[test]
    fn test_empty_announcement_group_yields_nothing() {
        let msg = update(vec![PathSegment::Asn(3333)], &[], &[]);
        let update = admitted(msg);
        assert!(normalize(&update).is_empty());
    }
}
