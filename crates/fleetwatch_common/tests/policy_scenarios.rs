//! Policy scenarios end to end: a fleet policy arrives on the wire, is
//! merged with the local policy and decides which published builds the
//! agent may move to.

use fleetwatch_common::{
    evaluate, parse_version, resolve, AgentOverrideMode, Eligibility, IneligibleReason,
    InboundMessage, PolicySource, PolicySpec, VersionPinStrategy,
};

fn fleet_from_wire(raw: &str) -> fleetwatch_common::FleetUpdatePolicy {
    match InboundMessage::parse(raw).unwrap() {
        InboundMessage::FleetPolicy(Some(policy)) => policy,
        other => panic!("expected a fleet policy, got {:?}", other),
    }
}

fn decide(spec: &PolicySpec, current: &str, candidate: &str) -> Eligibility {
    evaluate(
        &parse_version(current).unwrap(),
        &parse_version(candidate).unwrap(),
        spec,
    )
}

#[test]
fn test_fleet_patch_policy_holds_minor_release() {
    let fleet = fleet_from_wire(
        r#"{"type":"update_policy","data":{"update_check_days":1,"version_pin_strategy":"patch"}}"#,
    );
    let local = PolicySpec::default();

    let effective = resolve(AgentOverrideMode::Inherit, &local, Some(&fleet));
    assert_eq!(effective.source(), PolicySource::Fleet);
    let spec = effective.spec().unwrap();

    assert_eq!(
        decide(spec, "1.2.3", "1.3.0"),
        Eligibility::Ineligible(IneligibleReason::OutsidePatchLine)
    );
    assert_eq!(decide(spec, "1.2.3", "1.2.9"), Eligibility::Eligible);
}

#[test]
fn test_local_override_wins_over_fleet() {
    let fleet = fleet_from_wire(
        r#"{"type":"update_policy","data":{"version_pin_strategy":"latest","allow_major_upgrade":true}}"#,
    );
    let local = PolicySpec {
        version_pin_strategy: VersionPinStrategy::Minor,
        ..PolicySpec::default()
    };

    let effective = resolve(AgentOverrideMode::Local, &local, Some(&fleet));
    assert_eq!(effective.source(), PolicySource::Local);
    assert_eq!(
        decide(effective.spec().unwrap(), "1.2.3", "2.0.0"),
        Eligibility::Ineligible(IneligibleReason::OutsideMinorLine)
    );

    // Same input under Inherit follows the fleet.
    let effective = resolve(AgentOverrideMode::Inherit, &local, Some(&fleet));
    assert_eq!(decide(effective.spec().unwrap(), "1.2.3", "2.0.0"), Eligibility::Eligible);
}

#[test]
fn test_pin_allows_rollback_to_target() {
    let fleet = fleet_from_wire(
        r#"{"type":"update_policy","data":{"version_pin_strategy":"pin","target_version":"v1.1.0"}}"#,
    );
    let effective = resolve(AgentOverrideMode::Inherit, &PolicySpec::default(), Some(&fleet));
    let spec = effective.spec().unwrap();

    assert_eq!(decide(spec, "1.2.3", "1.1.0"), Eligibility::Eligible);
    assert!(matches!(
        decide(spec, "1.2.3", "1.3.0"),
        Eligibility::Ineligible(IneligibleReason::NotPinTarget { .. })
    ));
    assert_eq!(
        decide(spec, "1.1.0", "1.1.0"),
        Eligibility::Ineligible(IneligibleReason::AlreadyAtPin)
    );
}

#[test]
fn test_cleared_fleet_policy_falls_back_to_local() {
    let cleared = InboundMessage::parse(r#"{"type":"update_policy","data":null}"#).unwrap();
    assert_eq!(cleared, InboundMessage::FleetPolicy(None));

    let local = PolicySpec {
        update_check_days: 0,
        ..PolicySpec::default()
    };
    let effective = resolve(AgentOverrideMode::Inherit, &local, None);

    assert_eq!(effective.source(), PolicySource::Fallback);
    assert!(effective.is_enabled());
    // Scheduled checks off, commands still allowed.
    assert_eq!(effective.check_interval(), None);
}

#[test]
fn test_never_mode_disables_everything() {
    let fleet = fleet_from_wire(r#"{"type":"update_policy","data":{"collect_telemetry":true}}"#);
    let effective = resolve(AgentOverrideMode::Never, &PolicySpec::default(), Some(&fleet));

    assert!(!effective.is_enabled());
    assert!(effective.spec().is_none());
    assert!(effective.check_interval().is_none());
    assert!(!effective.collect_telemetry());
}
