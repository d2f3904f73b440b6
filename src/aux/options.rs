/// Configuration of the helper-engine subsystem. Mirrors the engine's
/// `AuxEngine*` UCI options; an empty `engine_file` disables everything.
#[derive(Clone, Debug)]
pub struct AuxOptions {
    /// Path to the helper executable.
    pub engine_file: String,
    /// Number of helper instances, one worker thread each.
    pub instances: usize,
    /// `k1=v1;k2=v2` pairs sent to each helper as `setoption`.
    pub options: String,
    /// Options for worker 0 only; non-empty switches it to root-infinite
    /// mode, where it keeps one `go infinite` query running on the root.
    pub options_on_root: String,
    /// Per-query budget for `go movetime`, in milliseconds.
    pub movetime_ms: u64,
    /// Visit threshold at which the MCTS backup nominates a node.
    pub threshold: u32,
    /// Depth above which dequeued nodes are probabilistically reinserted.
    pub max_depth: u32,
    /// 0-10; gates how chatty the subsystem logs are.
    pub verbosity: u8,
    /// Forwarded to helpers that advertise a SyzygyPath option.
    pub syzygy_path: Option<String>,
}

impl Default for AuxOptions {
    fn default() -> Self {
        Self {
            engine_file: String::new(),
            instances: 1,
            options: String::new(),
            options_on_root: String::new(),
            movetime_ms: 100,
            threshold: 100,
            max_depth: 10,
            verbosity: 0,
            syzygy_path: None,
        }
    }
}

impl AuxOptions {
    pub fn enabled(&self) -> bool { !self.engine_file.is_empty() }

    pub fn root_infinite(&self) -> bool { !self.options_on_root.is_empty() }

    /// Option string for helper slot `idx`: worker 0 gets the on-root set
    /// when configured, everyone else the regular set.
    pub fn options_for_slot(&self, idx: usize) -> &str {
        if idx == 0 && self.root_infinite() { &self.options_on_root } else { &self.options }
    }
}

/// Split a `k1=v1;k2=v2` option string into pairs; malformed fragments are
/// skipped rather than failing the handshake.
pub fn parse_option_pairs(s: &str) -> Vec<(String, String)> {
    s.split(';')
        .filter_map(|kv| {
            let kv = kv.trim();
            if kv.is_empty() {
                return None;
            }
            let (k, v) = kv.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
