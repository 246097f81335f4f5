/// Per-session counters. Wire-level failures land here rather than in API
/// returns so a long-lived session keeps running through noise.
#[derive(Copy, Clone, Debug, Default)]
pub struct SessionStats {
    pub pd: PdStats,
    pub md: MdStats,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct PdStats {
    pub sent: u64,
    pub received: u64,
    /// Validation failures by kind.
    pub crc_errors: u64,
    pub topo_errors: u64,
    pub wire_errors: u64,
    /// Valid frames with no matching subscriber.
    pub no_sub: u64,
    /// Frames dropped by the sequence-counter rule.
    pub stale_drops: u64,
    pub timeouts: u64,
    /// Sends skipped because the pool was empty or pacing kicked in.
    pub deferred_sends: u64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MdStats {
    pub sent: u64,
    pub received: u64,
    pub crc_errors: u64,
    pub topo_errors: u64,
    pub wire_errors: u64,
    pub no_listener: u64,
    /// Frames for unknown or already-terminated sessions.
    pub orphans: u64,
    pub retries: u64,
    pub reply_timeouts: u64,
    pub confirm_timeouts: u64,
    /// Caller-side confirms that were never sent in time.
    pub req_confirm_timeouts: u64,
    pub app_reply_timeouts: u64,
    pub aborted: u64,
}
