//! Secure Network Beacon handling and the IV-Index state machine
//! (Mesh Profile §3.10.5).
//!
//! A beacon must authenticate under the beacon key of a known network key,
//! current or old; which one tells us how far the sender is through a key
//! refresh. The announced IV state is then screened by ordering,
//! distance and dwell-time rules: every state must have lasted at least
//! 96 hours, a jump of more than one state is "IV recovery" and is allowed
//! at most once per 192 hours, and a node can never move backwards.

use mesh_core::{IvIndex, KeyIndex, NetworkKey, Timestamp};
use mesh_proto::beacon::SecureNetworkBeacon;
use tracing::{debug, info, trace};

/// Persisted IV-Index state.
///
/// `last_transition == None` means the history is unknown (fresh install
/// or a host that does not persist timestamps): the first authenticated
/// beacon is then accepted without dwell checks. A host that can persist
/// should; a node resuming with unknown history can otherwise be handed a
/// stale-but-forward IV-Index by an attacker replaying old beacons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvState {
    /// The current IV-Index pair.
    pub iv: IvIndex,
    /// When the last transition was accepted.
    pub last_transition: Option<Timestamp>,
    /// True when the last accepted transition was a recovery jump.
    pub recovery_used: bool,
}

impl IvState {
    /// Initial state of a freshly imported network.
    pub fn new(iv: IvIndex) -> Self {
        Self {
            iv,
            last_transition: None,
            recovery_used: false,
        }
    }
}

/// Tuning knobs of the acceptance rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct IvPolicy {
    /// Lifts the 42-state distance limit (host opted into unlimited
    /// recovery).
    pub unlimited_recovery: bool,
    /// Test mode: one state of dwell requirement is waived.
    pub test_mode: bool,
}

/// Why a beacon's IV state was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvRejection {
    /// The announced state is behind the current one.
    MovedBackwards,
    /// Announced update-active at the current index while in normal
    /// operation; an update would have announced the next index.
    ReenteredUpdate,
    /// More than 42 states ahead without unlimited recovery.
    TooFarAhead,
    /// A single-step transition inside the 96-hour dwell of the current
    /// state.
    DwellNotMet,
    /// A recovery jump within 192 hours of the previous recovery.
    RecoveryTooSoon,
}

/// Which credentials authenticated a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconAuthority {
    /// The network key whose beacon key verified the beacon.
    pub network_key: KeyIndex,
    /// True when the current (new) key verified it; false for the old key
    /// of an ongoing refresh.
    pub used_current_key: bool,
}

/// Key refresh transition requested by an authenticated beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefreshAction {
    /// Key refresh flag set under the new key: switch to transmitting
    /// with the new key.
    Finalize,
    /// Key refresh flag cleared under the new key: revoke the old key.
    RevokeOld,
}

/// The outcome of one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconOutcome {
    /// No known beacon key verified it; silent drop.
    NotAuthenticated,
    /// Authenticated; the IV state did not change (same state announced).
    Unchanged {
        /// Who vouched for the beacon.
        authority: BeaconAuthority,
        /// Requested key refresh transition, if any.
        key_refresh: Option<KeyRefreshAction>,
    },
    /// Authenticated and the IV state advanced.
    IvChanged {
        /// Who vouched for the beacon.
        authority: BeaconAuthority,
        /// The new IV state.
        iv: IvIndex,
        /// Requested key refresh transition, if any.
        key_refresh: Option<KeyRefreshAction>,
    },
    /// Authenticated but the IV rules rejected the announced state.
    Rejected(IvRejection),
}

/// The beacon-driven side of the engine.
#[derive(Debug)]
pub struct BeaconHandler {
    state: IvState,
    policy: IvPolicy,
}

impl BeaconHandler {
    /// Creates the handler from persisted state.
    pub fn new(state: IvState, policy: IvPolicy) -> Self {
        Self { state, policy }
    }

    /// The current IV state.
    pub fn state(&self) -> &IvState {
        &self.state
    }

    /// The current IV-Index pair.
    pub fn iv(&self) -> IvIndex {
        self.state.iv
    }

    /// Handles a received Secure Network Beacon.
    pub fn handle_beacon(
        &mut self,
        beacon: &SecureNetworkBeacon,
        keys: &[NetworkKey],
        now: Timestamp,
    ) -> BeaconOutcome {
        let authority = match authenticate(beacon, keys) {
            Some(authority) => authority,
            None => {
                trace!("Beacon did not authenticate under any known key");
                return BeaconOutcome::NotAuthenticated;
            }
        };

        // Key refresh transitions are only meaningful when the *new* key
        // of a refresh signed the beacon.
        let key_refresh = if authority.used_current_key {
            if beacon.key_refresh {
                Some(KeyRefreshAction::Finalize)
            } else {
                Some(KeyRefreshAction::RevokeOld)
            }
        } else {
            None
        };

        match self.accept_iv(beacon.iv(), now) {
            Ok(true) => {
                info!(iv = ?self.state.iv, "IV-Index advanced by beacon");
                BeaconOutcome::IvChanged {
                    authority,
                    iv: self.state.iv,
                    key_refresh,
                }
            }
            Ok(false) => BeaconOutcome::Unchanged {
                authority,
                key_refresh,
            },
            Err(rejection) => {
                debug!(?rejection, announced = ?beacon.iv(), "Beacon IV state rejected");
                BeaconOutcome::Rejected(rejection)
            }
        }
    }

    /// Starts an IV-Update from this node (sequence space pressure).
    ///
    /// Subject to the same dwell rule as beacon-driven transitions;
    /// returns the new state when allowed.
    pub fn begin_iv_update(&mut self, now: Timestamp) -> Option<IvIndex> {
        if self.state.iv.update_active {
            return None;
        }
        if let Some(last) = self.state.last_transition {
            if !self.policy.test_mode && now.hours_since(last) < 96 {
                return None;
            }
        }
        let next = IvIndex::new(self.state.iv.index + 1, true);
        self.state.iv = next;
        self.state.last_transition = Some(now);
        self.state.recovery_used = false;
        info!(iv = ?next, "IV-Update started locally");
        Some(next)
    }

    /// Applies the IV acceptance rules; `Ok(true)` means the state moved.
    fn accept_iv(&mut self, announced: IvIndex, now: Timestamp) -> Result<bool, IvRejection> {
        let current = self.state.iv;

        if announced.index < current.index {
            return Err(IvRejection::MovedBackwards);
        }
        if announced.index == current.index {
            if announced.update_active == current.update_active {
                return Ok(false);
            }
            if !current.update_active && announced.update_active {
                return Err(IvRejection::ReenteredUpdate);
            }
            // update-active -> normal at the same index: the ordinary
            // completion step, handled below.
        }
        if announced.index > current.index + 42 && !self.policy.unlimited_recovery {
            return Err(IvRejection::TooFarAhead);
        }

        let steps = current
            .steps_to(&announced)
            .ok_or(IvRejection::MovedBackwards)?;
        let waived = self.state.recovery_used || self.policy.test_mode;
        let state_diff = steps.saturating_sub(waived as u64);
        if state_diff == 0 {
            // The waiver absorbed the single step; accept without dwell.
            return self.apply(announced, now, false);
        }

        let is_recovery = state_diff > 1;
        if let Some(last) = self.state.last_transition {
            if !is_recovery && now.hours_since(last) < 96 * state_diff {
                return Err(IvRejection::DwellNotMet);
            }
            if is_recovery && self.state.recovery_used && now.hours_since(last) < 192 {
                return Err(IvRejection::RecoveryTooSoon);
            }
        }
        self.apply(announced, now, is_recovery)
    }

    fn apply(
        &mut self,
        announced: IvIndex,
        now: Timestamp,
        is_recovery: bool,
    ) -> Result<bool, IvRejection> {
        self.state.iv = announced;
        self.state.last_transition = Some(now);
        self.state.recovery_used = is_recovery;
        Ok(true)
    }
}

fn authenticate(beacon: &SecureNetworkBeacon, keys: &[NetworkKey]) -> Option<BeaconAuthority> {
    for key in keys {
        if key.matches_network_id(&beacon.network_id) {
            if beacon.network_id == key.derived().network_id
                && beacon.authenticate(&key.derived().beacon_key)
            {
                return Some(BeaconAuthority {
                    network_key: key.index(),
                    used_current_key: true,
                });
            }
            if let Some(old) = key.old_derived() {
                if beacon.network_id == old.network_id && beacon.authenticate(&old.beacon_key) {
                    return Some(BeaconAuthority {
                        network_key: key.index(),
                        used_current_key: false,
                    });
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn network_key() -> NetworkKey {
        NetworkKey::new(KeyIndex::PRIMARY, [0x31; 16])
    }

    fn beacon_for(key: &NetworkKey, iv: IvIndex, key_refresh: bool) -> SecureNetworkBeacon {
        let derived = key.derived();
        SecureNetworkBeacon::build(key_refresh, iv, derived.network_id, &derived.beacon_key)
    }

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    fn handler_at(iv: IvIndex, transition: Timestamp) -> BeaconHandler {
        BeaconHandler::new(
            IvState {
                iv,
                last_transition: Some(transition),
                recovery_used: false,
            },
            IvPolicy::default(),
        )
    }

    #[test]
    fn test_update_cycle_with_dwell() {
        let key = network_key();
        let keys = [key.clone()];
        let t0 = Timestamp::new(0);
        // Entered (5, normal) at t0; an update to 6 arrives 100 h later.
        let mut handler = handler_at(IvIndex::new(5, false), t0);

        let t1 = t0.add(hours(100));
        let outcome = handler.handle_beacon(&beacon_for(&key, IvIndex::new(6, true), false), &keys, t1);
        assert!(matches!(outcome, BeaconOutcome::IvChanged { iv, .. } if iv == IvIndex::new(6, true)));

        // One hour later the completion beacon is too early.
        let outcome = handler.handle_beacon(
            &beacon_for(&key, IvIndex::new(6, false), false),
            &keys,
            t1.add(hours(1)),
        );
        assert_eq!(outcome, BeaconOutcome::Rejected(IvRejection::DwellNotMet));
        assert_eq!(handler.iv(), IvIndex::new(6, true));

        // At 97 h it is accepted.
        let outcome = handler.handle_beacon(
            &beacon_for(&key, IvIndex::new(6, false), false),
            &keys,
            t1.add(hours(97)),
        );
        assert!(matches!(outcome, BeaconOutcome::IvChanged { iv, .. } if iv == IvIndex::new(6, false)));
    }

    #[test]
    fn test_monotonicity() {
        let key = network_key();
        let keys = [key.clone()];
        let t0 = Timestamp::new(0);
        let mut handler = handler_at(IvIndex::new(6, false), t0);

        // Backwards index.
        assert_eq!(
            handler.handle_beacon(&beacon_for(&key, IvIndex::new(5, false), false), &keys, t0),
            BeaconOutcome::Rejected(IvRejection::MovedBackwards)
        );
        // Re-entering update at the same index.
        assert_eq!(
            handler.handle_beacon(&beacon_for(&key, IvIndex::new(6, true), false), &keys, t0),
            BeaconOutcome::Rejected(IvRejection::ReenteredUpdate)
        );
        // The same state is a no-op, not an error.
        assert!(matches!(
            handler.handle_beacon(&beacon_for(&key, IvIndex::new(6, false), false), &keys, t0),
            BeaconOutcome::Unchanged { .. }
        ));
    }

    #[test]
    fn test_distance_limit_and_recovery() {
        let key = network_key();
        let keys = [key.clone()];
        let t0 = Timestamp::new(0);
        let mut handler = handler_at(IvIndex::new(5, false), t0);

        // 43 indices ahead: rejected by default.
        assert_eq!(
            handler.handle_beacon(&beacon_for(&key, IvIndex::new(48, false), false), &keys, t0),
            BeaconOutcome::Rejected(IvRejection::TooFarAhead)
        );

        // A 10-index jump inside the limit is a recovery and skips dwell.
        let outcome =
            handler.handle_beacon(&beacon_for(&key, IvIndex::new(15, false), false), &keys, t0);
        assert!(matches!(outcome, BeaconOutcome::IvChanged { iv, .. } if iv.index == 15));
        assert!(handler.state().recovery_used);

        // A second recovery inside 192 h is refused.
        let outcome = handler.handle_beacon(
            &beacon_for(&key, IvIndex::new(25, false), false),
            &keys,
            t0.add(hours(100)),
        );
        assert_eq!(outcome, BeaconOutcome::Rejected(IvRejection::RecoveryTooSoon));

        // After 192 h it goes through.
        let outcome = handler.handle_beacon(
            &beacon_for(&key, IvIndex::new(25, false), false),
            &keys,
            t0.add(hours(193)),
        );
        assert!(matches!(outcome, BeaconOutcome::IvChanged { iv, .. } if iv.index == 25));
    }

    #[test]
    fn test_unlimited_recovery_option() {
        let key = network_key();
        let keys = [key.clone()];
        let mut handler = BeaconHandler::new(
            IvState::new(IvIndex::new(5, false)),
            IvPolicy {
                unlimited_recovery: true,
                test_mode: false,
            },
        );
        let outcome = handler.handle_beacon(
            &beacon_for(&key, IvIndex::new(1000, false), false),
            &keys,
            Timestamp::new(0),
        );
        assert!(matches!(outcome, BeaconOutcome::IvChanged { iv, .. } if iv.index == 1000));
    }

    #[test]
    fn test_unknown_history_accepts_first_beacon() {
        let key = network_key();
        let keys = [key.clone()];
        let mut handler =
            BeaconHandler::new(IvState::new(IvIndex::new(5, false)), IvPolicy::default());

        // No timestamp on record: a forward single step passes immediately.
        let outcome = handler.handle_beacon(
            &beacon_for(&key, IvIndex::new(6, true), false),
            &keys,
            Timestamp::new(0),
        );
        assert!(matches!(outcome, BeaconOutcome::IvChanged { .. }));
        // From then on the dwell clock runs.
        assert!(handler.state().last_transition.is_some());
    }

    #[test]
    fn test_forged_beacon_ignored() {
        let key = network_key();
        let other = NetworkKey::new(KeyIndex::PRIMARY, [0x77; 16]);
        let keys = [key];
        let mut handler =
            BeaconHandler::new(IvState::new(IvIndex::new(5, false)), IvPolicy::default());

        // Signed by a key we do not have.
        let outcome = handler.handle_beacon(
            &beacon_for(&other, IvIndex::new(6, true), false),
            &keys,
            Timestamp::new(0),
        );
        assert_eq!(outcome, BeaconOutcome::NotAuthenticated);
        assert_eq!(handler.iv(), IvIndex::new(5, false));
    }

    #[test]
    fn test_key_refresh_actions() {
        let mut key = network_key();
        let t0 = Timestamp::new(0);
        key.update_key([0x99; 16], t0);
        let keys = [key.clone()];
        let mut handler =
            BeaconHandler::new(IvState::new(IvIndex::new(0, false)), IvPolicy::default());

        // Old key signing: no refresh action.
        let old_beacon = {
            let old = key.old_derived().unwrap();
            SecureNetworkBeacon::build(false, IvIndex::new(0, false), old.network_id, &old.beacon_key)
        };
        match handler.handle_beacon(&old_beacon, &keys, t0) {
            BeaconOutcome::Unchanged {
                authority,
                key_refresh,
            } => {
                assert!(!authority.used_current_key);
                assert_eq!(key_refresh, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // New key with the refresh flag: finalize.
        match handler.handle_beacon(&beacon_for(&key, IvIndex::new(0, false), true), &keys, t0) {
            BeaconOutcome::Unchanged { key_refresh, .. } => {
                assert_eq!(key_refresh, Some(KeyRefreshAction::Finalize));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // New key without the flag: revoke the old key.
        match handler.handle_beacon(&beacon_for(&key, IvIndex::new(0, false), false), &keys, t0) {
            BeaconOutcome::Unchanged { key_refresh, .. } => {
                assert_eq!(key_refresh, Some(KeyRefreshAction::RevokeOld));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_begin_iv_update_guarded() {
        let t0 = Timestamp::new(0);
        let mut handler = handler_at(IvIndex::new(3, false), t0);

        // Inside the dwell: refused.
        assert_eq!(handler.begin_iv_update(t0.add(hours(10))), None);
        // After 96 h: starts.
        assert_eq!(
            handler.begin_iv_update(t0.add(hours(96))),
            Some(IvIndex::new(4, true))
        );
        // Already active: refused.
        assert_eq!(handler.begin_iv_update(t0.add(hours(300))), None);
    }
}
