use crate::sim::SimTime;

#[test]
fn sim_time_unit_conversions() {
    assert_eq!(SimTime::from_nanos(7), SimTime(7));
    assert_eq!(SimTime::from_micros(1), SimTime(1_000));
    assert_eq!(SimTime::from_millis(1), SimTime(1_000_000));
    assert_eq!(SimTime::from_micros(3).as_nanos(), 3_000);
}

#[test]
fn sim_time_arithmetic_saturates() {
    assert_eq!(SimTime::from_micros(u64::MAX), SimTime(u64::MAX));
    assert_eq!(SimTime::from_millis(u64::MAX), SimTime(u64::MAX));
    assert_eq!(SimTime(u64::MAX).saturating_add(SimTime(1)), SimTime(u64::MAX));
    assert_eq!(SimTime(3).saturating_sub(SimTime(5)), SimTime::ZERO);
    assert_eq!(SimTime(5).saturating_sub(SimTime(3)), SimTime(2));
}

#[test]
fn sim_time_displays_nanoseconds() {
    assert_eq!(SimTime::from_micros(2).to_string(), "2000ns");
}
