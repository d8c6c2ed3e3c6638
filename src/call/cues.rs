/// Audible ring and hold cues played to the agent.
pub trait CallCues: Send + Sync {
    fn start_ringing(&self);
    /// Stop every cue that is playing
    fn stop(&self);
}

/// Cues for headless runs.
#[derive(Debug, Default)]
pub struct SilentCues;

impl CallCues for SilentCues {
    fn start_ringing(&self) {}
    fn stop(&self) {}
}
