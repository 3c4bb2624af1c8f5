use crate::engine::EngineContext;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub ctx: EngineContext,
    pub scheduler: Scheduler,
}
