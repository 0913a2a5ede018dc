use memfabric_types::{ChannelId, MessageId, PrincipalId, SubscriptionId};
use std::collections::HashSet;

#[test]
fn generated_ids_are_unique() {
    let ids: HashSet<_> = (0..100).map(|_| SubscriptionId::new()).collect();
    assert_eq!(ids.len(), 100);
}

#[test]
fn generated_ids_are_time_ordered() {
    let a = MessageId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = MessageId::new();
    assert!(a < b);
}

#[test]
fn id_display_parse_round_trip() {
    let id = ChannelId::new();
    let parsed: ChannelId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn id_parse_rejects_garbage() {
    assert!("not-a-uuid".parse::<ChannelId>().is_err());
}

#[test]
fn principal_id_accepts_names() {
    let id = PrincipalId::new("agent-a").unwrap();
    assert_eq!(id.as_str(), "agent-a");
    assert_eq!(id.to_string(), "agent-a");
}

#[test]
fn principal_id_rejects_blank() {
    assert!(PrincipalId::new("").is_err());
    assert!(PrincipalId::new("   ").is_err());
}

#[test]
fn principal_id_serializes_transparently() {
    let id = PrincipalId::new("p1").unwrap();
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"p1\"");
}
