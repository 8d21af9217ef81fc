//! Assertions on observed sandbox states.

use promptstack_protocol::SandboxState;

/// Whether every step of `observed` is a legal transition. Repeated
/// consecutive states are allowed.
pub fn is_valid_state_sequence(observed: &[SandboxState]) -> bool {
    observed
        .windows(2)
        .all(|pair| pair[0] == pair[1] || pair[0].can_transition_to(pair[1]))
}

/// Assert that `observed` never skips or reverses a state, e.g. never goes
/// `Ready -> Building` or enters `Working` twice without `Ready` between.
///
/// # Example
///
/// ```rust
/// use promptstack_protocol::SandboxState::*;
/// use promptstack_test_utils::assert_state_sequence;
///
/// assert_state_sequence(&[Offline, Building, BuildingWaiting, Ready, Working, ApplyingChanges, Ready]);
/// ```
pub fn assert_state_sequence(observed: &[SandboxState]) {
    for pair in observed.windows(2) {
        assert!(
            pair[0] == pair[1] || pair[0].can_transition_to(pair[1]),
            "Illegal state transition {} -> {} in {:?}",
            pair[0],
            pair[1],
            observed
        );
    }
}

/// Assert that each `Working` is closed by a `Ready` before the next one.
pub fn assert_turns_serialized(observed: &[SandboxState]) {
    let mut in_turn = false;
    for state in observed {
        match state {
            SandboxState::Working => {
                assert!(!in_turn, "Turn started while another was running: {observed:?}");
                in_turn = true;
            }
            SandboxState::Ready | SandboxState::Offline => in_turn = false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxState::*;

    #[test]
    fn test_valid_sequences() {
        assert!(is_valid_state_sequence(&[Offline, Building, Ready, Working, Ready]));
        assert!(is_valid_state_sequence(&[Building, BuildingWaiting, BuildingWaiting, Ready]));
    }

    #[test]
    fn test_invalid_sequences() {
        assert!(!is_valid_state_sequence(&[Ready, Building]));
        assert!(!is_valid_state_sequence(&[Building, Working]));
        assert!(!is_valid_state_sequence(&[BuildingWaiting, Building]));
    }

    #[test]
    #[should_panic(expected = "Illegal state transition")]
    fn test_assert_panics_on_regression() {
        assert_state_sequence(&[Ready, Building]);
    }

    #[test]
    #[should_panic(expected = "Turn started")]
    fn test_overlapping_turns_panic() {
        assert_turns_serialized(&[Ready, Working, Working]);
    }
}
