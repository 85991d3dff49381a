//! The Job data model: phases, scenario weights, and the shared parameter
//! bag. A Job is immutable once dispatched to the fleet.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::JobConfigError;

/// A time-bounded stage of a Job with a target aggregate user arrival rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobPhase {
    pub name: String,
    pub users_per_second: i64,
    /// Integer seconds, matching the source's whole-second duration grain.
    /// Wire key is `Duration`, not the `rename_all`-derived `DurationSecs`.
    #[serde(rename = "Duration")]
    pub duration_secs: i64,
}

/// An immutable benchmark specification dispatched to the whole fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    pub phases: Vec<JobPhase>,
    pub session_names: Vec<String>,
    pub session_percentages: Vec<f64>,
    #[serde(default)]
    pub session_params: HashMap<String, String>,
}

impl Job {
    /// Loads a Job from a JSON or YAML file, sniffed by extension and falling
    /// back to JSON-then-YAML if the extension is ambiguous. Bespoke config
    /// formats are out of scope; this is plain serde (de)serialization.
    pub fn load(path: &Path) -> Result<Self, JobConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| JobConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let job: Job = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|source| JobConfigError::Decode {
                path: path.display().to_string(),
                source: Box::new(source),
            })?
        } else {
            serde_json::from_str(&raw).or_else(|json_err| {
                serde_yaml::from_str(&raw).map_err(|_| JobConfigError::Decode {
                    path: path.display().to_string(),
                    source: Box::new(json_err),
                })
            })?
        };

        job.validate_shape()?;
        Ok(job)
    }

    /// Structural validation only: names/percentages line up. Per §9 open
    /// question #2, a percentage sum that deviates from 1 is NOT rejected —
    /// only logged — matching the observed source behaviour.
    fn validate_shape(&self) -> Result<(), JobConfigError> {
        if self.session_names.len() != self.session_percentages.len() {
            return Err(JobConfigError::Invalid(format!(
                "session_names has {} entries but session_percentages has {}",
                self.session_names.len(),
                self.session_percentages.len()
            )));
        }

        let sum: f64 = self.session_percentages.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            tracing::warn!(sum, "session percentages do not sum to 1; running job as given");
        }

        Ok(())
    }

    /// Writes the Job back to `path` verbatim, for operator audit. Format
    /// mirrors the extension: `.yaml`/`.yml` writes YAML, anything else JSON.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let rendered = if is_yaml {
            serde_yaml::to_string(self).expect("Job serializes to YAML")
        } else {
            serde_json::to_string_pretty(self).expect("Job serializes to JSON")
        };
        std::fs::write(path, rendered)
    }

    /// The percentage weight assigned to `scenario_name`, or 0 if absent.
    pub fn weight_of(&self, scenario_name: &str) -> f64 {
        self.session_names
            .iter()
            .position(|n| n == scenario_name)
            .map(|idx| self.session_percentages[idx])
            .unwrap_or(0.0)
    }
}

/// Per-virtual-user identity threaded into `Scenario::execute`.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub phase_name: String,
    pub params: std::sync::Arc<HashMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            phases: vec![JobPhase {
                name: "ramp".to_string(),
                users_per_second: 30,
                duration_secs: 10,
            }],
            session_names: vec!["signalrcore:echo".to_string(), "redis:pubsub".to_string()],
            session_percentages: vec![0.7, 0.3],
            session_params: HashMap::new(),
        }
    }

    #[test]
    fn weight_of_known_and_unknown_scenario() {
        let job = sample_job();
        assert_eq!(job.weight_of("signalrcore:echo"), 0.7);
        assert_eq!(job.weight_of("redis:pubsub"), 0.3);
        assert_eq!(job.weight_of("nonexistent"), 0.0);
    }

    #[test]
    fn mismatched_names_and_percentages_is_invalid() {
        let mut job = sample_job();
        job.session_percentages.pop();
        assert!(job.validate_shape().is_err());
    }

    #[test]
    fn mismatched_sum_is_not_rejected() {
        let mut job = sample_job();
        job.session_percentages = vec![0.5, 0.9];
        assert!(job.validate_shape().is_ok());
    }

    #[test]
    fn json_and_yaml_round_trip() {
        let job = sample_job();
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phases.len(), 1);

        let yaml = serde_yaml::to_string(&job).unwrap();
        let back: Job = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.session_names, job.session_names);
    }
}
