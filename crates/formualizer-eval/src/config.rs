//! `EvalConfig`: the small, struct-based analogue of a config file for a
//! library with no file-based configuration of its own (`spec.md` §10).
//! Mirrors the teacher's `EvalConfig`/`DeterministicMode` shape in
//! `engine/mod.rs`, trimmed to what this core's C7/C8 actually consult.

#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Worker threads the executor's pool spawns. `0` runs the dirty batch
    /// on the calling thread instead of standing up a pool at all.
    pub thread_count: usize,
    /// How many completed cells the executor checks between polling the
    /// cancellation flag (`spec.md` §5 "cooperative cancellation").
    pub cancel_check_interval: usize,
    /// When `true`, volatile functions (`NOW`, `TODAY`, `RAND`,
    /// `RANDBETWEEN`) return a fixed value instead of reading the system
    /// clock or a fresh random seed, so a calculation run is reproducible
    /// byte-for-byte (snapshot tests, replay). Mirrors the teacher's
    /// `DeterministicMode::Enabled` / `Disabled` split.
    pub deterministic_mode: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cancel_check_interval: 64,
            deterministic_mode: false,
        }
    }
}
