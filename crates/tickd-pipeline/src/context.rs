use std::sync::Arc;

use tickd_core::TickdConfig;
use tickd_db::Db;
use tickd_extract::VisionClient;
use tickd_signal::SignalAdapter;

/// Dependency bundle handed to the sensor and the engine at construction
/// time. Built once in the daemon; nothing in the pipeline reads process
/// state on its own.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<TickdConfig>,
    pub db: Arc<Db>,
    pub signal: Arc<SignalAdapter>,
    pub llm: Arc<VisionClient>,
}

impl PipelineContext {
    pub fn new(
        config: Arc<TickdConfig>,
        db: Arc<Db>,
        signal: Arc<SignalAdapter>,
        llm: Arc<VisionClient>,
    ) -> Self {
        Self {
            config,
            db,
            signal,
            llm,
        }
    }
}
