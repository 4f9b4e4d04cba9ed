//! Local dose alarms and history.
//!
//! Alarms are time-triggered notifications for a medicine. Tapping one
//! yields a [`ReminderTap`] that pre-selects the verification session's
//! medicine and reminder. History records the outcome of each dose.

use crate::store::{
    DoseStatus, HistoryEntry, Medicine, Store, StoreError, StoreExt, HISTORY_KEY, MEDICINES_KEY,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// How long a snoozed alarm waits before firing again.
pub const SNOOZE_MINUTES: i64 = 5;

/// Errors raised by the notification collaborator.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid alarm time {time:?} for medicine {medicine_id}")]
    InvalidTime { medicine_id: String, time: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Payload delivered when the user taps an alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderTap {
    pub medicine_id: String,
    pub reminder_id: Option<String>,
}

/// A pending alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAlarm {
    pub medicine_id: String,
    pub reminder_id: Option<String>,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
}

impl ScheduledAlarm {
    /// The tap payload carried by this alarm.
    pub fn tap(&self) -> ReminderTap {
        ReminderTap {
            medicine_id: self.medicine_id.clone(),
            reminder_id: self.reminder_id.clone(),
        }
    }
}

/// Alarm scheduling and dose history.
pub trait Notifier: Send + Sync + 'static {
    /// Schedules the medicine's alarm and saves the medicine.
    fn schedule_reminder(&self, medicine: &Medicine) -> Result<ScheduledAlarm, NotifyError>;

    /// Replaces pending alarms with one firing after the snooze period.
    fn snooze_alarm(&self, medicine: &Medicine) -> Result<ScheduledAlarm, NotifyError>;

    /// Cancels every pending alarm.
    fn stop_alarm(&self) -> Result<(), NotifyError>;

    /// Prepends a dose outcome to the history.
    fn add_to_history(
        &self,
        medicine_id: &str,
        status: DoseStatus,
    ) -> Result<HistoryEntry, NotifyError>;
}

/// [`Notifier`] keeping alarms in memory and records in a [`Store`].
pub struct LocalNotifier<S> {
    store: S,
    alarms: Mutex<Vec<ScheduledAlarm>>,
    /// Serializes read-modify-write of the medicine and history lists.
    records: Mutex<()>,
}

impl<S: Store> LocalNotifier<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            alarms: Mutex::new(Vec::new()),
            records: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Schedules against an explicit clock.
    pub fn schedule_reminder_at(
        &self,
        medicine: &Medicine,
        now: DateTime<Utc>,
    ) -> Result<ScheduledAlarm, NotifyError> {
        let mut fire_at = DateTime::parse_from_rfc3339(&medicine.time)
            .map_err(|_| NotifyError::InvalidTime {
                medicine_id: medicine.id.clone(),
                time: medicine.time.clone(),
            })?
            .with_timezone(&Utc);
        // A time already passed today rings tomorrow
        if fire_at <= now {
            fire_at += Duration::days(1);
        }

        let alarm = ScheduledAlarm {
            medicine_id: medicine.id.clone(),
            reminder_id: medicine.reminder_id.clone(),
            title: "MEDICINE ALARM".to_string(),
            body: format!("Take {} - {}", medicine.name, medicine.dosage),
            fire_at,
        };

        {
            let _records = self.lock_records();
            let mut medicines = self.store.medicines()?;
            medicines.push(medicine.clone());
            self.store.set_json(MEDICINES_KEY, &medicines)?;
        }

        self.lock_alarms().push(alarm.clone());
        tracing::info!(medicine = %medicine.id, fire_at = %alarm.fire_at, "Reminder scheduled");
        Ok(alarm)
    }

    /// Snoozes against an explicit clock.
    pub fn snooze_alarm_at(&self, medicine: &Medicine, now: DateTime<Utc>) -> ScheduledAlarm {
        let alarm = ScheduledAlarm {
            medicine_id: medicine.id.clone(),
            reminder_id: medicine.reminder_id.clone(),
            title: "SNOOZED MEDICINE".to_string(),
            body: format!("Reminder: {}", medicine.name),
            fire_at: now + Duration::minutes(SNOOZE_MINUTES),
        };

        let mut alarms = self.lock_alarms();
        alarms.clear();
        alarms.push(alarm.clone());
        tracing::info!(medicine = %medicine.id, fire_at = %alarm.fire_at, "Alarm snoozed");
        alarm
    }

    /// Removes and returns alarms due at `now`, as tap payloads.
    pub fn due_alarms(&self, now: DateTime<Utc>) -> Vec<ReminderTap> {
        let mut alarms = self.lock_alarms();
        let (due, pending): (Vec<_>, Vec<_>) =
            alarms.drain(..).partition(|alarm| alarm.fire_at <= now);
        *alarms = pending;
        due.iter().map(ScheduledAlarm::tap).collect()
    }

    /// Alarms not yet fired or cancelled.
    pub fn pending(&self) -> Vec<ScheduledAlarm> {
        self.lock_alarms().clone()
    }

    fn lock_alarms(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledAlarm>> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, ()> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Store + 'static> Notifier for LocalNotifier<S> {
    fn schedule_reminder(&self, medicine: &Medicine) -> Result<ScheduledAlarm, NotifyError> {
        self.schedule_reminder_at(medicine, Utc::now())
    }

    fn snooze_alarm(&self, medicine: &Medicine) -> Result<ScheduledAlarm, NotifyError> {
        Ok(self.snooze_alarm_at(medicine, Utc::now()))
    }

    fn stop_alarm(&self) -> Result<(), NotifyError> {
        let mut alarms = self.lock_alarms();
        if !alarms.is_empty() {
            tracing::info!(cancelled = alarms.len(), "Alarms stopped");
        }
        alarms.clear();
        Ok(())
    }

    fn add_to_history(
        &self,
        medicine_id: &str,
        status: DoseStatus,
    ) -> Result<HistoryEntry, NotifyError> {
        let _records = self.lock_records();
        let medicine_name = self
            .store
            .find_medicine(medicine_id)?
            .map(|m| m.name)
            .unwrap_or_else(|| "Unknown".to_string());

        let now = Utc::now();
        let entry = HistoryEntry {
            id: now.timestamp_millis().to_string(),
            medicine_id: medicine_id.to_string(),
            medicine_name,
            status,
            time: now,
        };

        let mut history = self.store.history()?;
        history.insert(0, entry.clone());
        self.store.set_json(HISTORY_KEY, &history)?;

        tracing::info!(medicine = medicine_id, %status, "Dose recorded");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn medicine_at(time: &str) -> Medicine {
        Medicine {
            time: time.to_string(),
            dosage: "1 pill".to_string(),
            ..Medicine::new("7", "7", "Amoxicillin")
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_past_time_moves_to_next_day() {
        let notifier = LocalNotifier::new(MemoryStore::new());

        let alarm = notifier
            .schedule_reminder_at(&medicine_at("2026-10-16T08:00:00Z"), noon())
            .unwrap();
        assert_eq!(alarm.fire_at, Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).unwrap());
        assert_eq!(alarm.body, "Take Amoxicillin - 1 pill");

        let future = notifier
            .schedule_reminder_at(&medicine_at("2026-10-16T20:00:00Z"), noon())
            .unwrap();
        assert_eq!(future.fire_at, Utc.with_ymd_and_hms(2026, 10, 16, 20, 0, 0).unwrap());

        assert_eq!(notifier.store().medicines().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_time_rejected() {
        let notifier = LocalNotifier::new(MemoryStore::new());
        assert!(matches!(
            notifier.schedule_reminder_at(&medicine_at("tomorrow-ish"), noon()),
            Err(NotifyError::InvalidTime { .. })
        ));
        assert!(notifier.pending().is_empty());
    }

    #[test]
    fn test_snooze_replaces_pending() {
        let notifier = LocalNotifier::new(MemoryStore::new());
        let medicine = medicine_at("2026-10-16T20:00:00Z");
        notifier.schedule_reminder_at(&medicine, noon()).unwrap();

        let snoozed = notifier.snooze_alarm_at(&medicine, noon());
        assert_eq!(snoozed.fire_at, noon() + Duration::minutes(5));
        assert_eq!(notifier.pending(), vec![snoozed]);
    }

    #[test]
    fn test_due_alarms_yield_taps() {
        let notifier = LocalNotifier::new(MemoryStore::new());
        let medicine = medicine_at("2026-10-16T20:00:00Z");
        notifier.snooze_alarm_at(&medicine, noon());

        assert!(notifier.due_alarms(noon()).is_empty());

        let taps = notifier.due_alarms(noon() + Duration::minutes(6));
        assert_eq!(
            taps,
            vec![ReminderTap {
                medicine_id: "7".into(),
                reminder_id: Some("7".into())
            }]
        );
        assert!(notifier.pending().is_empty());
    }

    #[test]
    fn test_history_newest_first_with_names() {
        let store = MemoryStore::new();
        let notifier = LocalNotifier::new(store.clone());
        notifier
            .schedule_reminder_at(&medicine_at("2026-10-16T20:00:00Z"), noon())
            .unwrap();

        notifier.add_to_history("7", DoseStatus::Missed).unwrap();
        notifier.add_to_history("99", DoseStatus::Taken).unwrap();

        let history = store.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].medicine_name, "Unknown");
        assert_eq!(history[0].status, DoseStatus::Taken);
        assert_eq!(history[1].medicine_name, "Amoxicillin");
    }

    #[test]
    fn test_concurrent_history_writes_are_kept() {
        let store = MemoryStore::new();
        let notifier = std::sync::Arc::new(LocalNotifier::new(store.clone()));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let notifier = std::sync::Arc::clone(&notifier);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        notifier.add_to_history("7", DoseStatus::Taken).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.history().unwrap().len(), 200);
    }

    #[test]
    fn test_stop_alarm_clears_everything() {
        let notifier = LocalNotifier::new(MemoryStore::new());
        let medicine = medicine_at("2026-10-16T20:00:00Z");
        notifier.schedule_reminder_at(&medicine, noon()).unwrap();

        notifier.stop_alarm().unwrap();
        notifier.stop_alarm().unwrap();
        assert!(notifier.pending().is_empty());
    }
}
