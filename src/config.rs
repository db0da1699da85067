use crate::instrument::TriggerMode;
use crate::mock::SignalSettings;
use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub acquisition: AcquisitionConf,
    #[config(nested)]
    pub compute: ComputeConf,
    #[config(nested)]
    pub logging: LoggingConf,
    #[config(default = [])]
    pub instruments: Vec<InstrumentConf>,
    #[config(default = [])]
    pub filters: Vec<FilterConf>,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionConf {
    #[config(default = 5)]
    pub poll_interval_ms: u64,
    #[config(default = 100)]
    pub max_backoff_ms: u64,
    #[config(default = 5)]
    pub failure_threshold: u32,
    #[config(default = 2)]
    pub max_pending: usize,
    #[config(default = "Continuous")]
    pub trigger_mode: TriggerMode,
}

#[derive(Config, Debug, Clone)]
pub struct ComputeConf {
    #[config(default = true)]
    pub gpu_filters: bool,
    /// Detected from the CPU when unset.
    pub simd: Option<bool>,
}

#[derive(Config, Debug, Clone)]
pub struct LoggingConf {
    #[config(default = "info")]
    pub level: String,
    #[config(default = ".")]
    pub dir: String,
}

/// A simulated instrument.
#[derive(Deserialize, Debug, Clone)]
pub struct InstrumentConf {
    pub name: String,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_record_len")]
    pub record_len: usize,
    /// Femtoseconds per sample.
    #[serde(default = "default_sample_period")]
    pub sample_period_fs: i64,
    #[serde(default)]
    pub signal: SignalSettings,
    /// Fail every Nth download with a transport error.
    pub fail_every: Option<usize>,
}

fn default_channels() -> usize {
    4
}

fn default_record_len() -> usize {
    1000
}

fn default_sample_period() -> i64 {
    1_000_000
}

/// One node of the filter graph.
///
/// Inputs map input names to stream references: `instrument:CHn` for a
/// channel, or `filter` / `filter.stream` for another node's output, where
/// `stream` is an output name or index.
#[derive(Deserialize, Debug, Clone)]
pub struct FilterConf {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, ParamText>,
    #[serde(default = "default_gpu")]
    pub gpu: bool,
}

fn default_gpu() -> bool {
    true
}

/// A parameter value as written in TOML. Parsed against the parameter's
/// declared type when the filter is built.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ParamText {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<f64>),
}

impl fmt::Display for ParamText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamText::Bool(v) => write!(f, "{}", v),
            ParamText::Int(v) => write!(f, "{}", v),
            ParamText::Float(v) => write!(f, "{}", v),
            ParamText::Text(v) => write!(f, "{}", v),
            ParamText::List(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

impl Conf {
    pub fn from_file(path: impl Into<std::path::PathBuf>) -> Result<Self, confique::Error> {
        Conf::builder().file(path).load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SignalShape;

    fn load(name: &str, text: &str) -> Conf {
        let path = std::env::temp_dir().join(format!("scopecore-{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, text).unwrap();
        let conf = Conf::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        conf
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let conf = load("defaults", "");
        assert_eq!(conf.acquisition.poll_interval_ms, 5);
        assert_eq!(conf.acquisition.max_backoff_ms, 100);
        assert_eq!(conf.acquisition.failure_threshold, 5);
        assert_eq!(conf.acquisition.max_pending, 2);
        assert_eq!(conf.acquisition.trigger_mode, TriggerMode::Continuous);
        assert!(conf.compute.gpu_filters);
        assert_eq!(conf.compute.simd, None);
        assert_eq!(conf.logging.level, "info");
        assert!(conf.instruments.is_empty());
        assert!(conf.filters.is_empty());
    }

    #[test]
    fn instruments_and_filters() {
        let conf = load(
            "full",
            r#"
[acquisition]
trigger_mode = "Single"
max_pending = 4

[compute]
simd = false

[[instruments]]
name = "scope"
channels = 2
record_len = 10
signal = { shape = "Zero" }

[[filters]]
name = "diff"
kind = "subtract"
inputs = { A = "scope:CH1", B = "scope:CH2" }

[[filters]]
name = "lp"
kind = "fir"
gpu = false
params = { cutoff_hz = "10M", length = 31, taps = [0.25, 0.5, 0.25] }
"#,
        );
        assert_eq!(conf.acquisition.trigger_mode, TriggerMode::Single);
        assert_eq!(conf.acquisition.max_pending, 4);
        assert_eq!(conf.compute.simd, Some(false));

        let scope = &conf.instruments[0];
        assert_eq!(scope.channels, 2);
        assert_eq!(scope.record_len, 10);
        assert_eq!(scope.sample_period_fs, 1_000_000);
        assert_eq!(scope.signal.shape, SignalShape::Zero);
        assert_eq!(scope.fail_every, None);

        let diff = &conf.filters[0];
        assert_eq!(diff.inputs["A"], "scope:CH1");
        assert!(diff.gpu);

        let lp = &conf.filters[1];
        assert!(!lp.gpu);
        assert_eq!(lp.params["cutoff_hz"], ParamText::Text("10M".into()));
        assert_eq!(lp.params["length"].to_string(), "31");
        assert_eq!(lp.params["taps"].to_string(), "0.25,0.5,0.25");
    }
}
