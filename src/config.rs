use std::path::{Path, PathBuf};

const DEFAULT_ROOT_PATH: &str = "twophase_data";
const DEFAULT_MAX_PREPARED_XACTS: usize = 50;
const DEFAULT_STATE_FILE_MAX_BYTES: usize = 10_000_000;

/// Tunables for the two-phase commit core. `max_prepared_xacts` sets the
/// GXACT slot pool capacity, immutable once the registry has been
/// opened.
pub struct TwoPhaseConfig {
    pub root_path: PathBuf,
    pub max_prepared_xacts: usize,
    pub state_file_max_bytes: usize,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from(DEFAULT_ROOT_PATH),
            max_prepared_xacts: DEFAULT_MAX_PREPARED_XACTS,
            state_file_max_bytes: DEFAULT_STATE_FILE_MAX_BYTES,
        }
    }
}

impl TwoPhaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_path<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.root_path = p.as_ref().to_path_buf();
        self
    }

    pub fn max_prepared_xacts(mut self, n: usize) -> Self {
        self.max_prepared_xacts = n;
        self
    }

    pub fn state_file_max_bytes(mut self, n: usize) -> Self {
        self.state_file_max_bytes = n;
        self
    }

    pub fn twophase_dir(&self) -> PathBuf {
        let mut path = self.root_path.clone();
        path.push("pg_twophase");
        path
    }

    pub fn wal_dir(&self) -> PathBuf {
        let mut path = self.root_path.clone();
        path.push("wal");
        path
    }

    pub fn clog_path(&self) -> PathBuf {
        let mut path = self.root_path.clone();
        path.push("clog");
        path
    }

    pub fn base_path(&self) -> PathBuf {
        let mut path = self.root_path.clone();
        path.push("base");
        path
    }
}

/// Convenience initializer for `env_logger`.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
