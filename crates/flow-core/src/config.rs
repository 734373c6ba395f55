//! flowgrid.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub job: JobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Timeout for a single pause/resume/trigger call (e.g. "10s").
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,
    /// Deadline for collecting every acknowledgement of a modification.
    #[serde(default = "default_modification_timeout")]
    pub modification_timeout: String,
    /// Number of prior attempts retained per task replica.
    #[serde(default = "default_max_attempts_history")]
    pub max_attempts_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_slots")]
    pub slots: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vertices: Vec<VertexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexConfig {
    pub name: String,
    pub parallelism: u32,
    pub max_parallelism: Option<u32>,
    pub invokable: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Name of the upstream vertex.
    pub from: String,
    #[serde(default)]
    pub pattern: PatternConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternConfig {
    #[default]
    AllToAll,
    Pointwise,
}

fn default_rpc_timeout() -> String {
    "10s".to_string()
}

fn default_modification_timeout() -> String {
    "60s".to_string()
}

fn default_max_attempts_history() -> usize {
    16
}

fn default_location() -> String {
    "local-0".to_string()
}

fn default_slots() -> u32 {
    16
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: default_rpc_timeout(),
            modification_timeout: default_modification_timeout(),
            max_attempts_history: default_max_attempts_history(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            slots: default_slots(),
        }
    }
}

impl CoordinatorConfig {
    pub fn rpc_timeout(&self) -> CoreResult<Duration> {
        parse_duration(&self.rpc_timeout)
    }

    pub fn modification_timeout(&self) -> CoreResult<Duration> {
        parse_duration(&self.modification_timeout)
    }
}

impl FlowConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: FlowConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check durations, parallelism, and that every input names an
    /// earlier vertex, so the job graph can be attached in order.
    pub fn validate(&self) -> CoreResult<()> {
        self.coordinator.rpc_timeout()?;
        self.coordinator.modification_timeout()?;

        let mut seen = HashSet::new();
        for vertex in &self.job.vertices {
            if vertex.parallelism == 0 {
                return Err(CoreError::InvalidConfig(format!(
                    "vertex '{}' has parallelism 0",
                    vertex.name
                )));
            }
            for input in &vertex.inputs {
                if !seen.contains(input.from.as_str()) {
                    return Err(CoreError::InvalidConfig(format!(
                        "vertex '{}' reads from '{}', which is not declared before it",
                        vertex.name, input.from
                    )));
                }
            }
            if !seen.insert(vertex.name.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate vertex name '{}'",
                    vertex.name
                )));
            }
        }
        Ok(())
    }

    /// Scaffold a two-stage source → map job.
    pub fn scaffold(job_name: &str) -> Self {
        FlowConfig {
            coordinator: CoordinatorConfig::default(),
            worker: WorkerConfig::default(),
            job: JobConfig {
                name: job_name.to_string(),
                vertices: vec![
                    VertexConfig {
                        name: "Source: Collection".to_string(),
                        parallelism: 1,
                        max_parallelism: None,
                        invokable: "flowgrid.SourceTask".to_string(),
                        roles: vec!["source".to_string()],
                        inputs: Vec::new(),
                    },
                    VertexConfig {
                        name: "Map".to_string(),
                        parallelism: 2,
                        max_parallelism: None,
                        invokable: "flowgrid.OneInputTask".to_string(),
                        roles: vec!["map".to_string()],
                        inputs: vec![InputConfig {
                            from: "Source: Collection".to_string(),
                            pattern: PatternConfig::AllToAll,
                        }],
                    },
                ],
            },
        }
    }
}

/// Parse a duration string like "250ms", "30s", "5m". A bare number is
/// read as seconds.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let invalid = || CoreError::InvalidDuration(s.to_string());

    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| invalid())
    } else {
        s.parse().map(Duration::from_secs).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = FlowConfig::scaffold("wordcount");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("wordcount"));

        let parsed = FlowConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.job.vertices.len(), 2);
        assert_eq!(parsed.job.vertices[1].inputs[0].from, "Source: Collection");
    }

    #[test]
    fn empty_config_takes_defaults() {
        let config = FlowConfig::from_toml_str("").unwrap();
        assert_eq!(config.coordinator.rpc_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.coordinator.max_attempts_history, 16);
        assert_eq!(config.worker.slots, 16);
        assert!(config.job.vertices.is_empty());
    }

    #[test]
    fn parse_minimal_job() {
        let toml_str = r#"
[coordinator]
rpc_timeout = "250ms"

[job]
name = "test"

[[job.vertices]]
name = "Source"
parallelism = 1
invokable = "flowgrid.SourceTask"

[[job.vertices]]
name = "Map"
parallelism = 3
invokable = "flowgrid.OneInputTask"
inputs = [{ from = "Source", pattern = "pointwise" }]
"#;
        let config = FlowConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.coordinator.rpc_timeout().unwrap(), Duration::from_millis(250));
        assert_eq!(config.job.vertices[1].inputs[0].pattern, PatternConfig::Pointwise);
    }

    #[test]
    fn rejects_forward_reference() {
        let toml_str = r#"
[[job.vertices]]
name = "Map"
parallelism = 1
invokable = "flowgrid.OneInputTask"
inputs = [{ from = "Source" }]

[[job.vertices]]
name = "Source"
parallelism = 1
invokable = "flowgrid.SourceTask"
"#;
        let err = FlowConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_parallelism() {
        let toml_str = r#"
[[job.vertices]]
name = "Source"
parallelism = 0
invokable = "flowgrid.SourceTask"
"#;
        assert!(FlowConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("20ms").unwrap(), Duration::from_millis(20));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
    }
}
