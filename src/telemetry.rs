//! Scalar sinks and rolling loss windows. Everything here is observational;
//! training control flow never depends on it, and a missing sink is fine.

use tracing::info;

pub trait TelemetrySink {
    fn scalar(&mut self, key: &str, value: f64);
}

/// Emits scalars as structured log events. Owned by the designated worker
/// only so metrics are not duplicated per worker.
pub struct LogSink {
    worker_id: usize,
}

impl LogSink {
    pub fn new(worker_id: usize) -> Self {
        Self { worker_id }
    }
}

impl TelemetrySink for LogSink {
    fn scalar(&mut self, key: &str, value: f64) {
        info!(target: "telemetry", worker = self.worker_id, key, value, "scalar");
    }
}

/// Accumulates losses and reports the mean once more than `cap` entries have
/// been collected, then starts over.
pub struct LossWindow {
    cap: usize,
    buf: Vec<f32>,
    pub flushes: u64,
}

impl LossWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::with_capacity(cap + 1),
            flushes: 0,
        }
    }

    pub fn push(&mut self, value: f32) -> Option<f32> {
        self.buf.push(value);
        if self.buf.len() > self.cap {
            let mean = self.buf.iter().sum::<f32>() / self.buf.len() as f32;
            self.buf.clear();
            self.flushes += 1;
            Some(mean)
        } else {
            None
        }
    }

    pub fn mean(&self) -> Option<f32> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.iter().sum::<f32>() / self.buf.len() as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_window_flushes_past_cap() {
        let mut window = LossWindow::new(3);
        assert_eq!(window.push(1.), None);
        assert_eq!(window.push(2.), None);
        assert_eq!(window.push(3.), None);
        // fourth entry tips the window over
        let mean = window.push(2.).unwrap();
        assert!((mean - 2.0).abs() < 1e-6);
        assert_eq!(window.flushes, 1);
        assert_eq!(window.mean(), None);
    }
}
