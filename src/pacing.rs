/// Adaptive inter-piece pacing at the sender.
///
/// The signal is coarse -- a `ResumeRequest` either carries a
/// non-empty missing set or it doesn't -- so the controller reacts to
/// that alone rather than a measured rate. There is deliberately no
/// decay of `current_delay` on clean requests; see `DESIGN.md` for why.
use crate::config::EngineConfig;

#[derive(Debug, Clone)]
pub struct PacingController {
    current_delay: f64,
    loss_retry_counter: u32,
    initial_delay: f64,
    max_delay: f64,
    backoff_factor: f64,
    retry_threshold: u32,
}

impl PacingController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            loss_retry_counter: 0,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            retry_threshold: config.retry_threshold,
        }
    }

    pub fn current_delay(&self) -> f64 {
        self.current_delay
    }

    /// Feed the outcome of one observed `ResumeRequest`. Returns the
    /// `(old, new)` delay when this call triggered a backoff step, so the
    /// caller can emit a `PacingBackoff` log event.
    pub fn on_resume_request(&mut self, missing_is_empty: bool) -> Option<(f64, f64)> {
        if missing_is_empty {
            self.loss_retry_counter = 0;
            return None;
        }
        self.loss_retry_counter += 1;
        if self.loss_retry_counter >= self.retry_threshold {
            let old_delay = self.current_delay;
            self.current_delay = (self.current_delay * self.backoff_factor).min(self.max_delay);
            self.loss_retry_counter = 0;
            if self.current_delay != old_delay {
                return Some((old_delay, self.current_delay));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            initial_delay: 1.0,
            max_delay: 30.0,
            backoff_factor: 1.5,
            retry_threshold: 3,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn starts_at_initial_delay() {
        let pc = PacingController::new(&config());
        assert_eq!(pc.current_delay(), 1.0);
    }

    #[test]
    fn clean_request_resets_counter_without_lowering_delay() {
        let mut pc = PacingController::new(&config());
        pc.on_resume_request(false);
        pc.on_resume_request(false);
        pc.on_resume_request(true);
        assert_eq!(pc.current_delay(), 1.0);
        // counter reset: two more lossy requests should not yet trigger backoff
        pc.on_resume_request(false);
        pc.on_resume_request(false);
        assert_eq!(pc.current_delay(), 1.0);
    }

    #[test]
    fn backoff_after_threshold_consecutive_losses() {
        let mut pc = PacingController::new(&config());
        pc.on_resume_request(false);
        pc.on_resume_request(false);
        assert_eq!(pc.current_delay(), 1.0);
        pc.on_resume_request(false);
        assert_eq!(pc.current_delay(), 1.5);
    }

    #[test]
    fn delay_never_exceeds_max() {
        let mut pc = PacingController::new(&EngineConfig {
            initial_delay: 25.0,
            max_delay: 30.0,
            backoff_factor: 2.0,
            retry_threshold: 1,
            ..EngineConfig::default()
        });
        pc.on_resume_request(false);
        assert_eq!(pc.current_delay(), 30.0);
        pc.on_resume_request(false);
        assert_eq!(pc.current_delay(), 30.0);
    }

    #[test]
    fn delay_never_drops_below_initial() {
        let mut pc = PacingController::new(&config());
        assert!(pc.current_delay() >= pc.initial_delay);
        pc.on_resume_request(true);
        pc.on_resume_request(true);
        assert_eq!(pc.current_delay(), pc.initial_delay);
    }
}
