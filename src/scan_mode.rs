use crate::config::ScanModeConfig;
use crate::error::ConfigError;
use crate::model::Instant;
use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Parsed cron schedule with seconds precision (`sec min hour dom month dow [year]`).
///
/// Two schedules compare equal when their normalized expressions match.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(scan_mode: &str, expression: &str) -> Result<Self, ConfigError> {
        let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");
        let schedule = Schedule::from_str(&normalized).map_err(|err| ConfigError::InvalidCron {
            scan_mode: scan_mode.to_string(),
            expression: expression.to_string(),
            reason: err.to_string(),
        })?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(ConfigError::NoFutureTrigger(scan_mode.to_string()));
        }
        Ok(Self {
            expression: normalized,
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First trigger strictly after `after`.
    pub fn next_after(&self, after: &Instant) -> Option<Instant> {
        self.schedule.after(after).next()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl std::hash::Hash for CronSchedule {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.expression.hash(state);
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMode {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
}

/// Named schedules, resolved once at startup and shared by reference.
#[derive(Debug, Clone, Default)]
pub struct ScanModeRegistry {
    modes: HashMap<String, Arc<ScanMode>>,
}

impl ScanModeRegistry {
    pub fn from_configs(configs: &[ScanModeConfig]) -> Result<Self, ConfigError> {
        let mut modes = HashMap::with_capacity(configs.len());
        for config in configs {
            let schedule = CronSchedule::parse(&config.id, &config.cron_expression)?;
            let mode = ScanMode {
                id: config.id.clone(),
                name: if config.name.is_empty() {
                    config.id.clone()
                } else {
                    config.name.clone()
                },
                schedule,
            };
            if modes.insert(config.id.clone(), Arc::new(mode)).is_some() {
                return Err(ConfigError::DuplicateId {
                    kind: "scan mode",
                    id: config.id.clone(),
                });
            }
        }
        Ok(Self { modes })
    }

    pub fn get(&self, id: &str) -> Option<Arc<ScanMode>> {
        self.modes.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_after_is_strictly_later() {
        let schedule = CronSchedule::parse("ten", "*/10 * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
        let next = schedule.next_after(&start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 20).unwrap());
    }

    #[test]
    fn whitespace_does_not_affect_equality() {
        let a = CronSchedule::parse("a", "0  * * * * *").unwrap();
        let b = CronSchedule::parse("b", " 0 * * * * * ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.expression(), "0 * * * * *");
    }

    #[test]
    fn rejects_garbage_and_past_only_schedules() {
        assert!(matches!(
            CronSchedule::parse("bad", "every ten seconds"),
            Err(ConfigError::InvalidCron { .. })
        ));
        assert_eq!(
            CronSchedule::parse("past", "0 0 0 1 1 * 2001"),
            Err(ConfigError::NoFutureTrigger("past".to_string()))
        );
    }

    #[test]
    fn registry_rejects_duplicates() {
        let configs = vec![
            ScanModeConfig {
                id: "fast".to_string(),
                name: String::new(),
                cron_expression: "* * * * * *".to_string(),
            },
            ScanModeConfig {
                id: "fast".to_string(),
                name: String::new(),
                cron_expression: "*/5 * * * * *".to_string(),
            },
        ];
        assert!(matches!(
            ScanModeRegistry::from_configs(&configs),
            Err(ConfigError::DuplicateId { .. })
        ));
        let registry = ScanModeRegistry::from_configs(&configs[..1]).unwrap();
        assert_eq!(registry.get("fast").unwrap().name, "fast");
    }
}
