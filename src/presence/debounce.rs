use super::classifier::ConditionClass;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per (device, condition) notification rate limiter.
///
/// A sustained fault produces one notification burst per cooldown
/// window instead of one per message. Tickets are stamped only when a
/// notification is actually allowed through, so repeated suppressed
/// evaluations never extend the window. Different conditions on the
/// same device debounce independently.
#[derive(Debug)]
pub struct DebounceGate {
    cooldown: ChronoDuration,
    idle_window: ChronoDuration,
    tickets: Mutex<HashMap<(String, ConditionClass), DateTime<Utc>>>,
}

impl DebounceGate {
    pub fn new(cooldown: std::time::Duration, idle_window: std::time::Duration) -> Self {
        Self {
            cooldown: ChronoDuration::from_std(cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            idle_window: ChronoDuration::from_std(idle_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(30)),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// `true` exactly when a notification for this (device, condition)
    /// pair should go out now; stamps the ticket as a side effect.
    pub fn should_notify(
        &self,
        device_key: &str,
        condition: ConditionClass,
        now: DateTime<Utc>,
    ) -> bool {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (device_key.to_string(), condition);
        match tickets.get(&key) {
            Some(last) if now - *last < self.cooldown => false,
            _ => {
                tickets.insert(key, now);
                true
            }
        }
    }

    /// Drop tickets untouched for the idle window; devices that went
    /// quiet should not hold map entries forever.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = tickets.len();
        tickets.retain(|_, last| now - *last < self.idle_window);
        before - tickets.len()
    }

    pub fn len(&self) -> usize {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate() -> DebounceGate {
        DebounceGate::new(Duration::from_secs(60), Duration::from_secs(1800))
    }

    #[test]
    fn second_call_within_cooldown_is_suppressed() {
        let gate = gate();
        let t0 = Utc::now();
        assert!(gate.should_notify("AA:BB", ConditionClass::DeviceFault, t0));
        assert!(!gate.should_notify(
            "AA:BB",
            ConditionClass::DeviceFault,
            t0 + ChronoDuration::seconds(30)
        ));
        assert!(gate.should_notify(
            "AA:BB",
            ConditionClass::DeviceFault,
            t0 + ChronoDuration::seconds(61)
        ));
    }

    #[test]
    fn suppressed_calls_do_not_extend_the_window() {
        let gate = gate();
        let t0 = Utc::now();
        assert!(gate.should_notify("AA:BB", ConditionClass::Fall, t0));
        // Evaluated (and suppressed) right before expiry; the ticket
        // still dates from t0.
        assert!(!gate.should_notify("AA:BB", ConditionClass::Fall, t0 + ChronoDuration::seconds(59)));
        assert!(gate.should_notify("AA:BB", ConditionClass::Fall, t0 + ChronoDuration::seconds(60)));
    }

    #[test]
    fn conditions_and_devices_debounce_independently() {
        let gate = gate();
        let t0 = Utc::now();
        assert!(gate.should_notify("AA:BB", ConditionClass::DeviceFault, t0));
        assert!(gate.should_notify("AA:BB", ConditionClass::Fall, t0));
        assert!(gate.should_notify("CC:DD", ConditionClass::DeviceFault, t0));
        assert!(!gate.should_notify("AA:BB", ConditionClass::DeviceFault, t0));
    }

    #[test]
    fn prune_idle_drops_stale_tickets() {
        let gate = gate();
        let t0 = Utc::now();
        gate.should_notify("AA:BB", ConditionClass::DeviceFault, t0);
        gate.should_notify("CC:DD", ConditionClass::Fall, t0 + ChronoDuration::minutes(29));
        assert_eq!(gate.len(), 2);

        let pruned = gate.prune_idle(t0 + ChronoDuration::minutes(31));
        assert_eq!(pruned, 1);
        assert_eq!(gate.len(), 1);
    }
}
