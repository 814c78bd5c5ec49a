//! Stray Marker Association Scenarios
//!
//! Synthetic marker sequences validating slot identity stability without
//! hardware:
//! - identity assignment when nothing moved
//! - marker loss with stale-position retention
//! - observation-order independence
//!
//! Run with: `cargo test --test stray_matching`

use drishti_io::core::types::ToolStatus;
use drishti_io::devices::ndi::strays::StraySlots;

fn slot_positions(slots: &StraySlots) -> Vec<[f64; 3]> {
    (0..slots.len()).map(|i| slots.slot(i).0).collect()
}

fn slot_statuses(slots: &StraySlots) -> Vec<ToolStatus> {
    (0..slots.len()).map(|i| slots.slot(i).1).collect()
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn same_positions_in_same_order_produce_identity_assignment() {
    let mut slots = StraySlots::new(3);
    let markers = [[0.0, 0.0, 10.0], [10.0, 0.0, 10.0], [0.0, 10.0, 10.0]];

    slots.update(&markers);
    assert_eq!(slot_positions(&slots), markers.to_vec());

    // Second frame with bit-identical observations: identity assignment
    slots.update(&markers);
    assert_eq!(slot_positions(&slots), markers.to_vec());
    assert_eq!(slot_statuses(&slots), vec![ToolStatus::Ok; 3]);
}

// ============================================================================
// Marker loss (three markers down to two)
// ============================================================================

#[test]
fn three_markers_down_to_two_keeps_slot_identity() {
    let mut slots = StraySlots::new(3);
    slots.update(&[[0.0, 0.0, 10.0], [10.0, 0.0, 10.0], [0.0, 10.0, 10.0]]);

    // The middle marker disappears; the survivors moved slightly.
    slots.update(&[[0.1, 0.0, 10.0], [0.0, 10.2, 10.0]]);

    assert_eq!(slots.slot(0), ([0.1, 0.0, 10.0], ToolStatus::Ok));
    // The lost marker's slot goes MISSING but retains its last-known
    // position for downstream consumers.
    assert_eq!(slots.slot(1), ([10.0, 0.0, 10.0], ToolStatus::Missing));
    assert_eq!(slots.slot(2), ([0.0, 10.2, 10.0], ToolStatus::Ok));
}

#[test]
fn reappearing_marker_reclaims_a_slot() {
    let mut slots = StraySlots::new(3);
    slots.update(&[[0.0, 0.0, 10.0], [10.0, 0.0, 10.0], [0.0, 10.0, 10.0]]);
    slots.update(&[[0.1, 0.0, 10.0], [0.0, 10.2, 10.0]]);

    // The lost marker comes back near its stale position; nearest-neighbor
    // matching hands it the same slot.
    slots.update(&[[0.1, 0.0, 10.0], [10.1, 0.0, 10.0], [0.0, 10.2, 10.0]]);
    assert_eq!(slots.slot(1), ([10.1, 0.0, 10.0], ToolStatus::Ok));
    assert_eq!(slot_statuses(&slots), vec![ToolStatus::Ok; 3]);
}

// ============================================================================
// Order independence
// ============================================================================

#[test]
fn swapping_close_observations_yields_minimum_total_distance() {
    let mut slots = StraySlots::new(2);
    slots.update(&[[0.0, 0.0, 5.0], [2.0, 0.0, 5.0]]);

    // Same two markers reported in the opposite order
    slots.update(&[[2.05, 0.0, 5.0], [0.05, 0.0, 5.0]]);
    assert_eq!(slots.slot(0), ([0.05, 0.0, 5.0], ToolStatus::Ok));
    assert_eq!(slots.slot(1), ([2.05, 0.0, 5.0], ToolStatus::Ok));
}

#[test]
fn extra_observations_fill_empty_slots_in_order() {
    let mut slots = StraySlots::new(4);
    slots.update(&[[1.0, 0.0, 0.0]]);
    assert_eq!(slots.slot(0).1, ToolStatus::Ok);
    assert_eq!(slots.slot(1).1, ToolStatus::Missing);

    // Two newcomers land in the first empty slots
    slots.update(&[[1.0, 0.0, 0.0], [50.0, 0.0, 0.0], [90.0, 0.0, 0.0]]);
    assert_eq!(slots.slot(0).0, [1.0, 0.0, 0.0]);
    assert_eq!(slots.slot(1).0, [50.0, 0.0, 0.0]);
    assert_eq!(slots.slot(2).0, [90.0, 0.0, 0.0]);
    assert_eq!(slots.slot(3).1, ToolStatus::Missing);
}
