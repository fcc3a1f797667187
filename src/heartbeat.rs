//! Monitored-Topic Heartbeat
//!
//! Periodically announces which raw-metrics topic this instance consumes on
//! a control topic, so upstream senders can discover where to publish. A
//! blank control topic disables the loop entirely.

use crate::shutdown::ShutdownSignal;
use crate::transport::QueueProducer;
use std::sync::Arc;
use tracing::{info, warn};

pub struct TopicHeartbeat {
    producer: Arc<dyn QueueProducer>,
    control_topic: String,
    monitored_topic: String,
    interval_secs: u64,
}

impl TopicHeartbeat {
    pub fn new(
        producer: Arc<dyn QueueProducer>,
        control_topic: String,
        monitored_topic: String,
        interval_secs: u64,
    ) -> Self {
        Self {
            producer,
            control_topic,
            monitored_topic,
            interval_secs,
        }
    }

    pub fn run(&self, shutdown: &ShutdownSignal) {
        if self.control_topic.trim().is_empty() {
            info!("monitored-topic reporting disabled (no control topic configured)");
            return;
        }
        if shutdown.wait_secs(self.interval_secs) {
            return;
        }
        loop {
            if let Err(err) = self
                .producer
                .send(&self.control_topic, self.monitored_topic.as_bytes())
            {
                warn!(
                    topic = %self.control_topic,
                    error = %err,
                    "failed to announce the monitored topic"
                );
            }
            if shutdown.wait_secs(self.interval_secs) {
                return;
            }
        }
    }
}
