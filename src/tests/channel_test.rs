use crate::sluice::proxy::{ChannelId, Flags, Side, Target};
use crate::sluice::server::Readiness;

#[test]
fn test_flag_groups() {
    assert_eq!(Flags::LISTED, Flags::MONITORED | Flags::ACTIVE);
    assert_eq!(Flags::SHUT_BOTH, Flags::SHUT_SENT | Flags::SHUT_RECV);
    assert_eq!(Flags::ACTIVITY, Flags::ERRONEOUS);
}

#[test]
fn test_listed_bits_are_exclusive_groups() {
    let mut f = Flags::MONITORED;
    // promotion to the active list swaps the bits, it never holds both
    f.remove(Flags::LISTED);
    f.insert(Flags::ACTIVE);
    assert!(f.contains(Flags::ACTIVE));
    assert!(!f.contains(Flags::MONITORED));
}

#[test]
fn test_side_peering() {
    assert_eq!(Side::Front.other(), Side::Back);
    assert_eq!(Side::Back.other(), Side::Front);
    let id = ChannelId::new(7, Side::Front);
    assert_eq!(id.peer(), ChannelId::new(7, Side::Back));
    assert_eq!(id.peer().peer(), id);
}

#[test]
fn test_side_labels() {
    assert_eq!(Side::Front.to_string(), "FRONT");
    assert_eq!(Side::Back.to_string(), "BACK");
}

#[test]
fn test_token_roundtrip() {
    let targets = [
        Target::Front,
        Target::Feed(0),
        Target::Feed(3),
        Target::Channel(ChannelId::new(0, Side::Front)),
        Target::Channel(ChannelId::new(0, Side::Back)),
        Target::Channel(ChannelId::new(123456, Side::Back)),
    ];
    for t in targets {
        assert_eq!(Target::decode(t.encode()), Some(t));
    }
    assert_eq!(Target::decode(0), None);
}

#[test]
fn test_readiness_rendering() {
    let r = Readiness::READ | Readiness::WRITE | Readiness::HANGUP;
    assert_eq!(r.to_string(), "IOH");
    assert_eq!(Readiness::empty().to_string(), "");
}
