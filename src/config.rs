use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{read_text, write_text, CensusError, Result};
use crate::gap::GapEnvironment;

pub const CENSUS_CONFIG_FILENAME: &str = "census_config.json";

/// Known terms of A000638, the number of conjugacy classes of subgroups of S_n.
pub const A000638: &[(u32, u64)] = &[
    (1, 1),
    (2, 2),
    (3, 4),
    (4, 11),
    (5, 19),
    (6, 56),
    (7, 96),
    (8, 296),
    (9, 554),
    (10, 1593),
    (11, 3094),
    (12, 10723),
    (13, 20832),
    (14, 75154),
    (15, 159129),
    (16, 686165),
];

/// Known terms of A174511, the number of isomorphism types of subgroups of S_n.
pub const A174511: &[(u32, u64)] = &[
    (1, 1),
    (2, 2),
    (3, 4),
    (4, 9),
    (5, 16),
    (6, 29),
    (7, 55),
    (8, 137),
    (9, 241),
    (10, 453),
    (11, 894),
    (12, 2065),
    (13, 3845),
    (14, 7766),
    (15, 16438),
];

fn lookup(table: &[(u32, u64)], n: u32) -> Option<u64> {
    table.iter().find(|(k, _)| *k == n).map(|(_, v)| *v)
}

pub fn known_conjugacy_classes(n: u32) -> Option<u64> {
    lookup(A000638, n)
}

pub fn known_isomorphism_types(n: u32) -> Option<u64> {
    lookup(A174511, n)
}

/// Where the GAP executables live for each environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GapSettings {
    pub environment: GapEnvironment,
    /// Windows path of the Cygwin `bash.exe` shipped with GAP.
    pub cygwin_bash: String,
    /// GAP install directory as seen from inside Cygwin.
    pub cygwin_gap_root: String,
    pub wsl_gap: String,
    pub native_gap: String,
}

impl Default for GapSettings {
    fn default() -> Self {
        GapSettings {
            environment: GapEnvironment::Cygwin,
            cygwin_bash: String::from(r"C:\Program Files\GAP-4.15.1\runtime\bin\bash.exe"),
            cygwin_gap_root: String::from("/opt/gap-4.15.1"),
            wsl_gap: String::from("gap"),
            native_gap: String::from("gap"),
        }
    }
}

/// Everything a census run needs to know about the machine and the target
/// S_n. Read from `census_config.json`, any missing field takes its default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CensusConfig {
    pub n: u32,
    pub work_dir: PathBuf,
    pub gap: GapSettings,
    pub memory: String,
    pub num_workers: usize,
    pub max_parallel: usize,
    pub timeout_hours: f64,
    /// Orders routed to the ANUPQ worker, all powers of two.
    pub two_group_orders: Vec<u64>,
    /// Bucket keys too expensive to deduplicate; their first member is kept.
    pub difficult_keys: Vec<String>,
    pub expected_total: Option<u64>,
    /// Isomorphism types of order below the large-group cutoff, counted by
    /// IdGroup outside of the bucket workers.
    pub idgroup_types: u64,
    pub monitor_interval_secs: u64,
}

impl Default for CensusConfig {
    fn default() -> Self {
        CensusConfig {
            n: 14,
            work_dir: PathBuf::from("census_work"),
            gap: GapSettings::default(),
            memory: String::from("8g"),
            num_workers: 10,
            max_parallel: 12,
            timeout_hours: 72.0,
            two_group_orders: vec![512, 1024, 2048],
            difficult_keys: Vec::new(),
            expected_total: None,
            idgroup_types: 0,
            monitor_interval_secs: 30,
        }
    }
}

impl CensusConfig {
    /// Looks for `census_config.json` in `dir`. A missing file gives the
    /// defaults, a malformed one is an error.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CENSUS_CONFIG_FILENAME);
        if !path.exists() {
            log::info!(
                "No config at {:}, using defaults.",
                path.display()
            );
            return Ok(CensusConfig::default());
        }
        Self::from_file(path)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::trace!("Reading config from {:}", path.display());
        let s = read_text(path)?;
        let conf: CensusConfig = serde_json::from_str(&s)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn save_to_disk(&self, path: impl AsRef<Path>) -> Result<()> {
        let s = serde_json::to_string_pretty(self)?;
        write_text(path, &s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(CensusError::Config(String::from("n must be positive")));
        }
        if self.num_workers == 0 || self.max_parallel == 0 {
            return Err(CensusError::Config(String::from(
                "num_workers and max_parallel must be at least 1",
            )));
        }
        if let Some(bad) = self.two_group_orders.iter().find(|o| !o.is_power_of_two()) {
            return Err(CensusError::Config(format!(
                "two_group_orders entry {:} is not a power of two",
                bad
            )));
        }
        if !(self.timeout_hours > 0.0) {
            return Err(CensusError::Config(String::from("timeout_hours must be positive")));
        }
        Ok(())
    }

    /// Explicit override first, then the OEIS table.
    pub fn expected_conjugacy_classes(&self) -> Option<u64> {
        self.expected_total.or_else(|| known_conjugacy_classes(self.n))
    }

    pub fn expected_isomorphism_types(&self) -> Option<u64> {
        self.expected_total.or_else(|| known_isomorphism_types(self.n))
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout_hours * 3600.0)
    }
}
